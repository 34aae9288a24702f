use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use switchboard_core::types::{CallId, PhoneNumber};

use crate::call::Call;
use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Document store for [`Call`]s with optimistic single-writer semantics.
///
/// Wraps a single SQLite connection in a `Mutex`, the same shape the rest
/// of the workspace uses for its managers. Reads outside the lease are
/// allowed and may be stale; writes go through [`CallStore::save`].
pub struct CallStore {
    db: Mutex<Connection>,
}

impl CallStore {
    /// Wrap an already-open connection, initialising the schema if needed.
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

    /// Insert a freshly created call. Fails if the id already exists.
    #[instrument(skip(self, call), fields(call_id = %call.call_id))]
    pub fn create(&self, call: &Call) -> Result<()> {
        let doc = serde_json::to_string(call)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO calls (call_id, caller_phone, version, created_at, updated_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                call.call_id.as_str(),
                call.caller_phone().as_str(),
                call.version as i64,
                call.created_at.to_rfc3339(),
                call.updated_at.to_rfc3339(),
                doc,
            ],
        )?;
        debug!("call created");
        Ok(())
    }

    /// Load a call by id.
    pub fn get_by_id(&self, id: &CallId) -> Result<Option<Call>> {
        let db = self.db.lock().unwrap();
        let row: Option<(String, i64)> = db
            .query_row(
                "SELECT doc, version FROM calls WHERE call_id = ?1",
                rusqlite::params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((doc, version)) => {
                let mut call: Call = serde_json::from_str(&doc)?;
                call.version = version as u64;
                Ok(Some(call))
            }
            None => Ok(None),
        }
    }

    /// The most recent call for a caller, newest `created_at` first.
    pub fn get_last(&self, phone: &PhoneNumber) -> Result<Option<Call>> {
        Ok(self.list_by_phone(phone, 1)?.into_iter().next())
    }

    /// Recent calls for a caller, newest first.
    pub fn list_by_phone(&self, phone: &PhoneNumber, limit: usize) -> Result<Vec<Call>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT doc, version FROM calls
             WHERE caller_phone = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![phone.as_str(), limit as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        let mut calls = Vec::new();
        for row in rows {
            let (doc, version) = row?;
            let mut call: Call = serde_json::from_str(&doc)?;
            call.version = version as u64;
            calls.push(call);
        }
        Ok(calls)
    }

    /// Save under optimistic concurrency: the row's stored version must
    /// still equal `call.version`. On success the version is bumped both
    /// in the row and on the passed document.
    #[instrument(skip(self, call), fields(call_id = %call.call_id, version = call.version))]
    pub fn save(&self, call: &mut Call) -> Result<()> {
        call.touch();
        let doc = serde_json::to_string(call)?;
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE calls
             SET doc = ?1, version = version + 1, updated_at = ?2
             WHERE call_id = ?3 AND version = ?4",
            rusqlite::params![
                doc,
                call.updated_at.to_rfc3339(),
                call.call_id.as_str(),
                call.version as i64,
            ],
        )?;
        if changed == 0 {
            // Distinguish a missing row from a stale version.
            let exists: bool = db
                .query_row(
                    "SELECT 1 FROM calls WHERE call_id = ?1",
                    rusqlite::params![call.call_id.as_str()],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            return if exists {
                Err(StoreError::Conflict {
                    id: call.call_id.to_string(),
                    expected: call.version,
                })
            } else {
                Err(StoreError::NotFound {
                    id: call.call_id.to_string(),
                })
            };
        }
        call.version += 1;
        debug!(new_version = call.version, "call saved");
        Ok(())
    }

    /// Persistence discipline for conflicting writers: reload the latest
    /// document, re-apply `mutate`, and retry the save — up to 3 times.
    /// `mutate` must be idempotent on a fresh document.
    pub fn save_with<F>(&self, call: &mut Call, mut mutate: F) -> Result<()>
    where
        F: FnMut(&mut Call) -> Result<()>,
    {
        const MAX_SAVE_ATTEMPTS: u32 = 3;

        mutate(call)?;
        let mut attempt = 0;
        loop {
            match self.save(call) {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { .. }) if attempt + 1 < MAX_SAVE_ATTEMPTS => {
                    attempt += 1;
                    debug!(attempt, call_id = %call.call_id, "save conflict, reloading");
                    let fresh = self.get_by_id(&call.call_id)?.ok_or(StoreError::NotFound {
                        id: call.call_id.to_string(),
                    })?;
                    *call = fresh;
                    mutate(call)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Message, Reminder, ReminderOwner};
    use crate::db::open_test_db;
    use chrono::Utc;

    fn store() -> CallStore {
        CallStore::new(open_test_db()).unwrap()
    }

    fn sample_call() -> Call {
        crate::call::tests::sample_call()
    }

    #[test]
    fn create_and_reload_round_trip() {
        let store = store();
        let mut call = sample_call();
        call.append_message(Message::human("bonjour"));
        store.create(&call).unwrap();

        let loaded = store.get_by_id(&call.call_id).unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.caller_phone(), call.caller_phone());
    }

    #[test]
    fn save_bumps_version_and_rejects_stale() {
        let store = store();
        let mut call = sample_call();
        store.create(&call).unwrap();

        // Two workers load the same version.
        let mut a = store.get_by_id(&call.call_id).unwrap().unwrap();
        let mut b = store.get_by_id(&call.call_id).unwrap().unwrap();

        a.append_message(Message::human("from a"));
        store.save(&mut a).unwrap();
        assert_eq!(a.version, 1);

        b.append_message(Message::human("from b"));
        let err = store.save(&mut b).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // The winning write is what's stored.
        let stored = store.get_by_id(&call.call_id).unwrap().unwrap();
        assert_eq!(stored.messages.last().unwrap().content, "from a");

        call.append_message(Message::human("stale original"));
        assert!(store.save(&mut call).is_err());
    }

    #[test]
    fn save_with_reapplies_on_conflict() {
        let store = store();
        let call = sample_call();
        store.create(&call).unwrap();

        // Worker A and B both load v0; A wins, B re-applies its reminder.
        let mut a = store.get_by_id(&call.call_id).unwrap().unwrap();
        let mut b = store.get_by_id(&call.call_id).unwrap().unwrap();

        a.append_message(Message::human("a first"));
        store.save(&mut a).unwrap();

        let reminder = Reminder {
            created_at: Utc::now(),
            title: "call back".to_string(),
            description: "expert appointment".to_string(),
            due_at: Utc::now(),
            owner: ReminderOwner::Assistant,
        };
        store
            .save_with(&mut b, |c| {
                if !c.reminders.iter().any(|r| r.title == "call back") {
                    c.add_reminder(reminder.clone());
                }
                Ok(())
            })
            .unwrap();

        let stored = store.get_by_id(&call.call_id).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        // the reminder is present exactly once, and A's message survived
        assert_eq!(stored.reminders.len(), 1);
        assert_eq!(stored.messages.len(), 1);
    }

    #[test]
    fn list_by_phone_newest_first() {
        let store = store();
        let first = sample_call();
        store.create(&first).unwrap();
        let mut second = sample_call();
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        store.create(&second).unwrap();

        let calls = store.list_by_phone(first.caller_phone(), 10).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, second.call_id);

        let last = store.get_last(first.caller_phone()).unwrap().unwrap();
        assert_eq!(last.call_id, second.call_id);
    }

    #[test]
    fn missing_call_is_none() {
        let store = store();
        assert!(store.get_by_id(&CallId::new()).unwrap().is_none());
    }
}
