//! Post-call fan-out: one synthesis job per closed call, one training job
//! when the conversation produced new knowledge. Duplicate enqueues from
//! redelivered close events are suppressed by `(call_id, job_kind)`
//! markers with a short TTL.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use switchboard_core::types::CallId;

use crate::error::Result;
use crate::events::{JobKind, PostCallJob, TrainingJob};
use crate::queue::{init_db, QueueName, WorkQueue};

/// Markers outlive any plausible redelivery window but not forever, so a
/// genuinely re-run call (same id, much later) can enqueue again.
const MARKER_TTL: Duration = Duration::from_secs(3600);

pub struct BackgroundDispatcher {
    queue: Arc<WorkQueue>,
    markers: Mutex<Connection>,
}

impl BackgroundDispatcher {
    pub fn new(queue: Arc<WorkQueue>, conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            queue,
            markers: Mutex::new(conn),
        })
    }

    /// Enqueue the follow-ups for a closed call. `produced_knowledge` is
    /// true when the call mutated the claim/reminders or hit the retriever.
    pub fn dispatch_closed(&self, call_id: &CallId, produced_knowledge: bool) -> Result<()> {
        if self.mark(call_id, JobKind::PostCall, Utc::now())? {
            self.queue.enqueue(
                QueueName::PostCall,
                &PostCallJob {
                    call_id: call_id.clone(),
                },
            )?;
            info!(%call_id, "post_call job enqueued");
        } else {
            debug!(%call_id, "post_call job already dispatched");
        }

        if produced_knowledge {
            if self.mark(call_id, JobKind::Training, Utc::now())? {
                self.queue.enqueue(
                    QueueName::Training,
                    &TrainingJob {
                        call_id: call_id.clone(),
                    },
                )?;
                info!(%call_id, "training job enqueued");
            } else {
                debug!(%call_id, "training job already dispatched");
            }
        }
        Ok(())
    }

    /// Claim the dedup marker. Returns `true` when this caller owns the
    /// enqueue; `false` when a live marker already exists.
    fn mark(&self, call_id: &CallId, kind: JobKind, now: DateTime<Utc>) -> Result<bool> {
        let key = format!("{}:{}", call_id, kind.as_str());
        let expires =
            (now + chrono::Duration::from_std(MARKER_TTL).unwrap_or_default()).to_rfc3339();
        let db = self.markers.lock().unwrap();
        let changed = db.execute(
            "INSERT INTO dispatch_markers (key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = ?2
             WHERE dispatch_markers.expires_at < ?3",
            rusqlite::params![key, expires, now.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Delivery;

    fn dispatcher() -> BackgroundDispatcher {
        let queue = Arc::new(
            WorkQueue::new(
                Connection::open_in_memory().unwrap(),
                Duration::from_secs(30),
            )
            .unwrap(),
        );
        BackgroundDispatcher::new(queue, Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn dispatch_enqueues_both_jobs() {
        let d = dispatcher();
        let id = CallId::from("c1");
        d.dispatch_closed(&id, true).unwrap();

        let post: Vec<Delivery<PostCallJob>> = d.queue.receive(QueueName::PostCall, 10).unwrap();
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].body.call_id, id);

        let training: Vec<Delivery<TrainingJob>> = d.queue.receive(QueueName::Training, 10).unwrap();
        assert_eq!(training.len(), 1);
    }

    #[test]
    fn no_training_without_knowledge() {
        let d = dispatcher();
        d.dispatch_closed(&CallId::from("c2"), false).unwrap();
        let training: Vec<Delivery<TrainingJob>> = d.queue.receive(QueueName::Training, 10).unwrap();
        assert!(training.is_empty());
    }

    #[test]
    fn redelivery_is_deduplicated() {
        let d = dispatcher();
        let id = CallId::from("c3");
        d.dispatch_closed(&id, true).unwrap();
        d.dispatch_closed(&id, true).unwrap();

        let post: Vec<Delivery<PostCallJob>> = d.queue.receive(QueueName::PostCall, 10).unwrap();
        assert_eq!(post.len(), 1);
        let training: Vec<Delivery<TrainingJob>> = d.queue.receive(QueueName::Training, 10).unwrap();
        assert_eq!(training.len(), 1);
    }
}
