//! In-memory media implementations for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use switchboard_core::cancel::CancelScope;
use switchboard_core::types::{CallId, LangTag};

use crate::cues::SoundCue;
use crate::stt::{RecognitionEvent, RecognitionKind, SpeechRecognizer};
use crate::tts::{SpeechPiece, SpeechSynthesizer};
use crate::Result;

/// Records every synthesized piece. In gated mode each `synthesize` call
/// blocks until [`RecordingSynthesizer::release_all`] or cancellation, so
/// tests can pile pieces up behind an in-flight one.
pub struct RecordingSynthesizer {
    spoken: Mutex<Vec<SpeechPiece>>,
    cues: Mutex<Vec<(SoundCue, &'static str)>>,
    started_tx: watch::Sender<u64>,
    started_rx: watch::Receiver<u64>,
    released_tx: watch::Sender<bool>,
    released_rx: watch::Receiver<bool>,
    gated: bool,
}

impl Default for RecordingSynthesizer {
    fn default() -> Self {
        Self::with_gate(false)
    }
}

impl RecordingSynthesizer {
    pub fn gated() -> Self {
        Self::with_gate(true)
    }

    fn with_gate(gated: bool) -> Self {
        let (started_tx, started_rx) = watch::channel(0u64);
        let (released_tx, released_rx) = watch::channel(false);
        Self {
            spoken: Mutex::new(Vec::new()),
            cues: Mutex::new(Vec::new()),
            started_tx,
            started_rx,
            released_tx,
            released_rx,
            gated,
        }
    }

    pub fn spoken(&self) -> Vec<SpeechPiece> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn cues(&self) -> Vec<(SoundCue, &'static str)> {
        self.cues.lock().unwrap().clone()
    }

    /// Wait until at least `n` synthesize calls have started.
    pub async fn wait_started(&self, n: u64) {
        let mut rx = self.started_rx.clone();
        while *rx.borrow() < n {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Open the gate for all current and future calls.
    pub fn release_all(&self) {
        let _ = self.released_tx.send(true);
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn synthesize(&self, piece: &SpeechPiece, cancel: &CancelScope) -> Result<()> {
        self.spoken.lock().unwrap().push(piece.clone());
        self.started_tx.send_modify(|n| *n += 1);

        if self.gated {
            let mut released = self.released_rx.clone();
            loop {
                // Cancellation wins over a concurrent release.
                if cancel.is_cancelled() {
                    return Err(crate::MediaError::Cancelled);
                }
                if *released.borrow() {
                    break;
                }
                tokio::select! {
                    changed = released.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => return Err(crate::MediaError::Cancelled),
                }
            }
        }
        Ok(())
    }

    async fn play_cue(&self, cue: SoundCue) -> Result<()> {
        self.cues.lock().unwrap().push((cue, "start"));
        Ok(())
    }

    async fn stop_cues(&self) -> Result<()> {
        self.cues.lock().unwrap().push((SoundCue::ThinkingLoop, "stop"));
        Ok(())
    }
}

/// One scripted recognition step: wait, then emit.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay: Duration,
    pub kind: RecognitionKind,
    pub text: String,
}

impl ScriptStep {
    pub fn new(delay: Duration, kind: RecognitionKind, text: impl Into<String>) -> Self {
        Self {
            delay,
            kind,
            text: text.into(),
        }
    }
}

/// Plays a fixed script of recognition events, timestamped at emit time.
pub struct ScriptedRecognizer {
    script: Mutex<Vec<ScriptStep>>,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn subscribe(
        &self,
        _call_id: &CallId,
        _language: &LangTag,
        cancel: &CancelScope,
    ) -> Result<mpsc::Receiver<RecognitionEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let script: Vec<ScriptStep> = std::mem::take(&mut *self.script.lock().unwrap());
        let cancel = cancel.clone();

        tokio::spawn(async move {
            for step in script {
                tokio::select! {
                    _ = tokio::time::sleep(step.delay) => {}
                    _ = cancel.cancelled() => return,
                }
                let event = RecognitionEvent {
                    kind: step.kind,
                    text: step.text,
                    detected_language: None,
                    at: Utc::now(),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            // keep the channel open until cancelled, like a live transport
            cancel.cancelled().await;
        });

        Ok(rx)
    }
}
