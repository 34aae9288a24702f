//! Wire shapes of the work items flowing through the queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use switchboard_core::types::{CallId, EventFingerprint};

/// Events on the `call_events` queue, the call lifecycle drivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallEvent {
    IncomingCall {
        caller_phone: String,
        callee_phone: String,
        correlation_id: String,
    },
    MediaEvent {
        call_id: CallId,
        event_id: String,
        media: MediaEventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

impl CallEvent {
    /// Idempotency fingerprint for events bound to an existing call.
    /// `IncomingCall` has no call yet; its correlation id dedups at the
    /// ingress instead.
    pub fn fingerprint(&self) -> Option<EventFingerprint> {
        match self {
            CallEvent::IncomingCall { .. } => None,
            CallEvent::MediaEvent {
                call_id, event_id, ..
            } => Some(EventFingerprint::new(call_id, event_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaEventKind {
    Connected,
    Hangup,
    Transferred,
    RecordingStarted,
    RecordingStopped,
}

/// Events on the `sms_events` queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundSms {
    pub from: String,
    pub to: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub event_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PostCall,
    Training,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PostCall => "post_call",
            JobKind::Training => "training",
        }
    }
}

/// Post-call enrichment job: synthesis plus the SMS report to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostCallJob {
    pub call_id: CallId,
}

/// Q/A extraction job feeding the retrieval corpus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingJob {
    pub call_id: CallId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_event_wire_format() {
        let event = CallEvent::MediaEvent {
            call_id: CallId::from("c1"),
            event_id: "e7".to_string(),
            media: MediaEventKind::Hangup,
            payload: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "media_event");
        assert_eq!(json["media"], "hangup");

        let back: CallEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.fingerprint().unwrap().as_str(), "c1:e7");
    }

    #[test]
    fn incoming_call_has_no_call_fingerprint() {
        let event = CallEvent::IncomingCall {
            caller_phone: "+33612345678".to_string(),
            callee_phone: "+33100000000".to_string(),
            correlation_id: "corr-1".to_string(),
        };
        assert!(event.fingerprint().is_none());
    }
}
