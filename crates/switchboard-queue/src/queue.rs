//! Typed pull queues with visibility-timeout semantics over SQLite.
//!
//! Delivery is at-least-once: a message received but neither acked nor
//! extended becomes visible again once its deadline passes. Consumers are
//! responsible for idempotency (fingerprints recorded on the Call).

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    CallEvents,
    SmsEvents,
    PostCall,
    Training,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::CallEvents => "call_events",
            QueueName::SmsEvents => "sms_events",
            QueueName::PostCall => "post_call",
            QueueName::Training => "training",
        }
    }
}

/// A received message. Holds the receipt needed to ack/nack/extend; the
/// receipt dies when the visibility deadline passes.
#[derive(Debug)]
pub struct Delivery<T> {
    pub body: T,
    pub attempts: u32,
    id: String,
    receipt: String,
}

impl<T> Delivery<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

pub struct WorkQueue {
    db: Mutex<Connection>,
    visibility: Duration,
}

pub(crate) fn init_db(conn: &Connection) -> Result<()> {
    // The queue shares its database file with the store; see the pragma
    // note on the store's init_db.
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA busy_timeout=5000;",
    )?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS queue_messages (
            id          TEXT PRIMARY KEY,
            queue       TEXT NOT NULL,
            body        TEXT NOT NULL,
            attempts    INTEGER NOT NULL DEFAULT 0,
            receipt     TEXT,
            enqueued_at TEXT NOT NULL,
            visible_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages(queue, visible_at);

        CREATE TABLE IF NOT EXISTS dispatch_markers (
            key        TEXT PRIMARY KEY,
            expires_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

impl WorkQueue {
    pub fn new(conn: Connection, visibility: Duration) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            visibility,
        })
    }

    pub fn open(path: &str, visibility: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::new(conn, visibility)
    }

    /// Append a message, visible immediately.
    #[instrument(skip(self, body), fields(queue = queue.as_str()))]
    pub fn enqueue<T: Serialize>(&self, queue: QueueName, body: &T) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO queue_messages (id, queue, body, enqueued_at, visible_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![id, queue.as_str(), serde_json::to_string(body)?, now],
        )?;
        debug!(message_id = %id, "message enqueued");
        Ok(id)
    }

    /// Pull up to `max` visible messages, hiding each for the visibility
    /// timeout. Undecodable bodies are dropped with a warning rather than
    /// poisoning the queue.
    pub fn receive<T: DeserializeOwned>(
        &self,
        queue: QueueName,
        max: usize,
    ) -> Result<Vec<Delivery<T>>> {
        self.receive_at(queue, max, Utc::now())
    }

    fn receive_at<T: DeserializeOwned>(
        &self,
        queue: QueueName,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery<T>>> {
        let deadline =
            (now + chrono::Duration::from_std(self.visibility).unwrap_or_default()).to_rfc3339();
        let now_str = now.to_rfc3339();
        let db = self.db.lock().unwrap();

        let candidates: Vec<(String, String, u32)> = {
            let mut stmt = db.prepare_cached(
                "SELECT id, body, attempts FROM queue_messages
                 WHERE queue = ?1 AND visible_at <= ?2
                 ORDER BY enqueued_at
                 LIMIT ?3",
            )?;
            let rows: Vec<_> = stmt
                .query_map(
                    rusqlite::params![queue.as_str(), now_str, max as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u32)),
                )?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut deliveries = Vec::new();
        for (id, body, attempts) in candidates {
            let receipt = Uuid::new_v4().to_string();
            // Conditional claim — a concurrent receiver may have taken it.
            let claimed = db.execute(
                "UPDATE queue_messages
                 SET receipt = ?1, visible_at = ?2, attempts = attempts + 1
                 WHERE id = ?3 AND visible_at <= ?4",
                rusqlite::params![receipt, deadline, id, now_str],
            )?;
            if claimed == 0 {
                continue;
            }
            match serde_json::from_str::<T>(&body) {
                Ok(parsed) => deliveries.push(Delivery {
                    body: parsed,
                    attempts: attempts + 1,
                    id,
                    receipt,
                }),
                Err(e) => {
                    tracing::warn!(message_id = %id, err = %e, "dropping undecodable message");
                    db.execute(
                        "DELETE FROM queue_messages WHERE id = ?1",
                        rusqlite::params![id],
                    )?;
                }
            }
        }
        Ok(deliveries)
    }

    /// Delete a handled message. Fails if the receipt expired and another
    /// consumer re-received it.
    pub fn ack<T>(&self, delivery: &Delivery<T>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "DELETE FROM queue_messages WHERE id = ?1 AND receipt = ?2",
            rusqlite::params![delivery.id, delivery.receipt],
        )?;
        if changed == 0 {
            return Err(QueueError::ReceiptExpired {
                id: delivery.id.clone(),
            });
        }
        Ok(())
    }

    /// Return a message to the queue immediately (handling failed).
    pub fn nack<T>(&self, delivery: &Delivery<T>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE queue_messages SET visible_at = ?1, receipt = NULL
             WHERE id = ?2 AND receipt = ?3",
            rusqlite::params![Utc::now().to_rfc3339(), delivery.id, delivery.receipt],
        )?;
        if changed == 0 {
            return Err(QueueError::ReceiptExpired {
                id: delivery.id.clone(),
            });
        }
        Ok(())
    }

    /// Push the visibility deadline out by `extra` from now. Long handlers
    /// run this from a sub-task to avoid redelivery mid-call.
    pub fn extend<T>(&self, delivery: &Delivery<T>, extra: Duration) -> Result<()> {
        let deadline =
            (Utc::now() + chrono::Duration::from_std(extra).unwrap_or_default()).to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE queue_messages SET visible_at = ?1 WHERE id = ?2 AND receipt = ?3",
            rusqlite::params![deadline, delivery.id, delivery.receipt],
        )?;
        if changed == 0 {
            return Err(QueueError::ReceiptExpired {
                id: delivery.id.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        n: u32,
    }

    fn queue() -> WorkQueue {
        let conn = Connection::open_in_memory().unwrap();
        WorkQueue::new(conn, Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn enqueue_receive_ack() {
        let q = queue();
        q.enqueue(QueueName::CallEvents, &Payload { n: 1 }).unwrap();
        q.enqueue(QueueName::CallEvents, &Payload { n: 2 }).unwrap();

        let got: Vec<Delivery<Payload>> = q.receive(QueueName::CallEvents, 10).unwrap();
        assert_eq!(got.len(), 2);
        // FIFO by enqueue order
        assert_eq!(got[0].body, Payload { n: 1 });

        for d in &got {
            q.ack(d).unwrap();
        }
        let empty: Vec<Delivery<Payload>> = q.receive(QueueName::CallEvents, 10).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn received_message_is_hidden() {
        let q = queue();
        q.enqueue(QueueName::PostCall, &Payload { n: 7 }).unwrap();
        let first: Vec<Delivery<Payload>> = q.receive(QueueName::PostCall, 1).unwrap();
        assert_eq!(first.len(), 1);
        let second: Vec<Delivery<Payload>> = q.receive(QueueName::PostCall, 1).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn unacked_message_reappears_after_visibility() {
        let q = queue();
        q.enqueue(QueueName::CallEvents, &Payload { n: 3 }).unwrap();
        let now = Utc::now();
        let first: Vec<Delivery<Payload>> = q.receive_at(QueueName::CallEvents, 1, now).unwrap();
        assert_eq!(first[0].attempts, 1);

        // 31 seconds later the deadline has passed and the message redelivers
        let later = now + chrono::Duration::seconds(31);
        let again: Vec<Delivery<Payload>> = q.receive_at(QueueName::CallEvents, 1, later).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);

        // the stale receipt can no longer ack
        assert!(q.ack(&first[0]).is_err());
    }

    #[test]
    fn nack_makes_visible_immediately() {
        let q = queue();
        q.enqueue(QueueName::SmsEvents, &Payload { n: 4 }).unwrap();
        let first: Vec<Delivery<Payload>> = q.receive(QueueName::SmsEvents, 1).unwrap();
        q.nack(&first[0]).unwrap();
        let again: Vec<Delivery<Payload>> = q.receive(QueueName::SmsEvents, 1).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn extend_keeps_message_hidden() {
        let q = queue();
        q.enqueue(QueueName::CallEvents, &Payload { n: 5 }).unwrap();
        let now = Utc::now();
        let first: Vec<Delivery<Payload>> = q.receive_at(QueueName::CallEvents, 1, now).unwrap();
        q.extend(&first[0], Duration::from_secs(120)).unwrap();

        let later = now + chrono::Duration::seconds(60);
        let hidden: Vec<Delivery<Payload>> = q.receive_at(QueueName::CallEvents, 1, later).unwrap();
        assert!(hidden.is_empty());
    }

    #[test]
    fn queues_are_isolated() {
        let q = queue();
        q.enqueue(QueueName::CallEvents, &Payload { n: 6 }).unwrap();
        let other: Vec<Delivery<Payload>> = q.receive(QueueName::Training, 10).unwrap();
        assert!(other.is_empty());
    }
}
