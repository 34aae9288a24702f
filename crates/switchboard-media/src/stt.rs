use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use switchboard_core::cancel::CancelScope;
use switchboard_core::types::{CallId, LangTag};

use crate::{MediaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionKind {
    /// In-progress hypothesis; superseded by later partials and the final.
    Partial,
    /// Committed text for one utterance.
    Final,
    /// The recognizer reports the line has gone quiet.
    Silence,
    /// The recognizer considers the utterance complete.
    RecognitionComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub kind: RecognitionKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<LangTag>,
    pub at: DateTime<Utc>,
}

impl RecognitionEvent {
    pub fn partial(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind: RecognitionKind::Partial,
            text: text.into(),
            detected_language: None,
            at,
        }
    }

    pub fn final_(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind: RecognitionKind::Final,
            text: text.into(),
            detected_language: None,
            at,
        }
    }
}

/// Speech-recognition source for one call. The implementation owns the
/// transport and reconnects transparently; the returned channel closes
/// when the transport is permanently gone or the scope is cancelled.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn subscribe(
        &self,
        call_id: &CallId,
        language: &LangTag,
        cancel: &CancelScope,
    ) -> Result<mpsc::Receiver<RecognitionEvent>>;
}

/// Recognition events as NDJSON over a streaming HTTP response.
pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_reconnects: u32,
    /// VAD sensitivity handed to the recognition service (0.1–1.0).
    vad_threshold: f64,
}

impl HttpRecognizer {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        max_reconnects: u32,
        vad_threshold: f64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            max_reconnects,
            vad_threshold,
        }
    }

    async fn connect(&self, call_id: &CallId, language: &LangTag) -> Result<reqwest::Response> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "call_id": call_id.as_str(),
            "language": language.as_str(),
            "vad_threshold": self.vad_threshold,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(MediaError::Api { status, message });
        }
        Ok(resp)
    }
}

#[async_trait]
impl SpeechRecognizer for HttpRecognizer {
    async fn subscribe(
        &self,
        call_id: &CallId,
        language: &LangTag,
        cancel: &CancelScope,
    ) -> Result<mpsc::Receiver<RecognitionEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let max_reconnects = self.max_reconnects;
        let vad_threshold = self.vad_threshold;
        let call_id = call_id.clone();
        let language = language.clone();
        let cancel = cancel.clone();

        // First connection happens inline so callers see setup failures.
        let first = self.connect(&call_id, &language).await?;

        tokio::spawn(async move {
            let recognizer = HttpRecognizer {
                client,
                endpoint,
                api_key,
                max_reconnects,
                vad_threshold,
            };
            let mut resp = Some(first);
            let mut reconnects = 0u32;

            loop {
                let current = match resp.take() {
                    Some(r) => r,
                    None => match recognizer.connect(&call_id, &language).await {
                        Ok(r) => {
                            debug!(%call_id, reconnects, "recognizer reconnected");
                            r
                        }
                        Err(e) => {
                            reconnects += 1;
                            if reconnects > max_reconnects {
                                warn!(%call_id, err = %e, "recognizer permanently unreachable");
                                return;
                            }
                            tokio::time::sleep(std::time::Duration::from_millis(
                                250 * reconnects as u64,
                            ))
                            .await;
                            continue;
                        }
                    },
                };

                match pump_events(current, &tx, &cancel).await {
                    PumpOutcome::Cancelled | PumpOutcome::ReceiverDropped => return,
                    PumpOutcome::TransportLost => {
                        reconnects += 1;
                        if reconnects > max_reconnects {
                            warn!(%call_id, "recognizer transport lost for good");
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

enum PumpOutcome {
    Cancelled,
    ReceiverDropped,
    TransportLost,
}

/// Read NDJSON lines off the response body until it ends or the scope is
/// cancelled.
async fn pump_events(
    resp: reqwest::Response,
    tx: &mpsc::Sender<RecognitionEvent>,
    cancel: &CancelScope,
) -> PumpOutcome {
    use futures_util::StreamExt;

    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            chunk = byte_stream.next() => chunk,
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
        };
        let chunk = match chunk {
            Some(Ok(c)) => c,
            Some(Err(_)) | None => return PumpOutcome::TransportLost,
        };
        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RecognitionEvent>(line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        return PumpOutcome::ReceiverDropped;
                    }
                }
                Err(e) => debug!(err = %e, "skipping undecodable recognition line"),
            }
        }

        line_buf = remainder;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognition_event_wire_format() {
        let json = r#"{"kind":"partial","text":"atten","at":"2026-07-12T10:30:00Z"}"#;
        let event: RecognitionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, RecognitionKind::Partial);
        assert_eq!(event.text, "atten");

        let json = r#"{"kind":"recognition_complete","at":"2026-07-12T10:30:01Z"}"#;
        let event: RecognitionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, RecognitionKind::RecognitionComplete);
        assert!(event.text.is_empty());
    }

    #[test]
    fn detected_language_round_trips() {
        let event = RecognitionEvent {
            kind: RecognitionKind::Final,
            text: "hello".to_string(),
            detected_language: Some(LangTag::new("en-US")),
            at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: RecognitionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.detected_language, Some(LangTag::new("en-US")));
    }
}
