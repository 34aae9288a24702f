//! Distributed lease over a keyed token table with TTL.
//!
//! At most one worker holds the lease for a key at a time. Acquisition is
//! a single upsert that only overwrites an expired holder; renewal and
//! release are conditional on the holder's token, so a worker that lost
//! its lease can never clobber the new holder.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Bounded retries for renew/release when the shared database is busy
/// past its busy_timeout. A database error here must not masquerade as a
/// lost lease: `LeaseLost` is reserved for a genuine token mismatch.
const LEASE_RETRY_ATTEMPTS: u32 = 3;
const LEASE_RETRY_PAUSE: Duration = Duration::from_millis(50);

fn with_db_retry<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(StoreError::Database(e)) if attempt + 1 < LEASE_RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, %what, err = %e, "lease store busy, retrying");
                std::thread::sleep(LEASE_RETRY_PAUSE);
            }
            Err(e) => return Err(e),
        }
    }
}

/// A held lease. Renewal must happen at intervals ≤ ttl/2.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub ttl: Duration,
    token: String,
}

impl Lease {
    /// Interval at which the holder should call [`LeaseManager::renew`].
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 2
    }
}

pub struct LeaseManager {
    db: Mutex<Connection>,
}

impl LeaseManager {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::new(conn)
    }

    /// Try to take exclusive ownership of `key` for `ttl`.
    /// Returns `LeaseBusy` when another worker holds an unexpired lease.
    #[instrument(skip(self), fields(key))]
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease> {
        self.acquire_at(key, ttl, Utc::now())
    }

    fn acquire_at(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let token = Uuid::new_v4().to_string();
        let expires = (now + chrono::Duration::from_std(ttl).unwrap_or_default()).to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "INSERT INTO leases (key, token, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET token = ?2, expires_at = ?3
             WHERE leases.expires_at < ?4",
            rusqlite::params![key, token, expires, now.to_rfc3339()],
        )?;
        if changed == 0 {
            debug!(%key, "lease busy");
            return Err(StoreError::LeaseBusy {
                key: key.to_string(),
            });
        }
        debug!(%key, "lease acquired");
        Ok(Lease {
            key: key.to_string(),
            ttl,
            token,
        })
    }

    /// Extend a held lease by its TTL. `LeaseLost` means another worker
    /// took over; the caller must abort in-flight mutations and exit.
    /// A busy database is retried a few times first so the keeper does
    /// not abort a healthy call over a transient store hiccup.
    #[instrument(skip(self, lease), fields(key = %lease.key))]
    pub fn renew(&self, lease: &Lease) -> Result<()> {
        with_db_retry("renew", || self.renew_at(lease, Utc::now()))
    }

    fn renew_at(&self, lease: &Lease, now: DateTime<Utc>) -> Result<()> {
        let expires =
            (now + chrono::Duration::from_std(lease.ttl).unwrap_or_default()).to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE leases SET expires_at = ?1 WHERE key = ?2 AND token = ?3",
            rusqlite::params![expires, lease.key, lease.token],
        )?;
        if changed == 0 {
            warn!(key = %lease.key, "lease lost");
            return Err(StoreError::LeaseLost {
                key: lease.key.clone(),
            });
        }
        Ok(())
    }

    /// Release a held lease. Best-effort: releasing a lost lease is a no-op.
    #[instrument(skip(self, lease), fields(key = %lease.key))]
    pub fn release(&self, lease: Lease) -> Result<()> {
        with_db_retry("release", || {
            let db = self.db.lock().unwrap();
            db.execute(
                "DELETE FROM leases WHERE key = ?1 AND token = ?2",
                rusqlite::params![lease.key, lease.token],
            )?;
            Ok(())
        })?;
        debug!(key = %lease.key, "lease released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_db;

    fn manager() -> LeaseManager {
        LeaseManager::new(open_test_db()).unwrap()
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn exclusive_while_unexpired() {
        let mgr = manager();
        let lease = mgr.acquire("call:c1", TTL).unwrap();
        let err = mgr.acquire("call:c1", TTL).unwrap_err();
        assert!(matches!(err, StoreError::LeaseBusy { .. }));
        mgr.release(lease).unwrap();
        // released — a new worker may take it
        mgr.acquire("call:c1", TTL).unwrap();
    }

    #[test]
    fn different_keys_are_independent() {
        let mgr = manager();
        mgr.acquire("call:c1", TTL).unwrap();
        mgr.acquire("claim_schema:+33612345678", TTL).unwrap();
    }

    #[test]
    fn expired_lease_is_stolen() {
        let mgr = manager();
        let t0 = Utc::now();
        let stale = mgr.acquire_at("call:c1", TTL, t0).unwrap();

        // 61 seconds later another worker steals the expired lease.
        let t1 = t0 + chrono::Duration::seconds(61);
        let stolen = mgr.acquire_at("call:c1", TTL, t1).unwrap();
        assert_eq!(stolen.key, "call:c1");

        // the old holder can no longer renew
        let err = mgr.renew_at(&stale, t1).unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
    }

    #[test]
    fn renew_extends_ownership() {
        let mgr = manager();
        let t0 = Utc::now();
        let lease = mgr.acquire_at("call:c1", TTL, t0).unwrap();

        // renewed at t0+50s — still exclusive at t0+70s
        mgr.renew_at(&lease, t0 + chrono::Duration::seconds(50)).unwrap();
        let err = mgr
            .acquire_at("call:c1", TTL, t0 + chrono::Duration::seconds(70))
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseBusy { .. }));
    }

    #[test]
    fn renew_interval_is_half_ttl() {
        let mgr = manager();
        let lease = mgr.acquire("call:c1", TTL).unwrap();
        assert_eq!(lease.renew_interval(), Duration::from_secs(30));
    }
}
