use async_trait::async_trait;

use switchboard_core::cancel::CancelScope;
use switchboard_core::types::LangTag;

use crate::cues::SoundCue;
use crate::{MediaError, Result};

/// One speakable unit handed to the synthesizer — a sentence or a cue
/// utterance, with the voice parameters resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechPiece {
    pub text: String,
    pub style: String,
    pub language: LangTag,
    pub voice: String,
}

impl SpeechPiece {
    pub fn new(text: impl Into<String>, style: &str, language: LangTag, voice: &str) -> Self {
        Self {
            text: text.into(),
            style: style.to_string(),
            language,
            voice: voice.to_string(),
        }
    }
}

/// Synthesis backend. `synthesize` resolves once the chunk has been
/// flushed toward the caller; implementations must honour the scope
/// within one round-trip.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, piece: &SpeechPiece, cancel: &CancelScope) -> Result<()>;

    /// Start a loopable background cue (thinking tone, noise floor).
    async fn play_cue(&self, _cue: SoundCue) -> Result<()> {
        Ok(())
    }

    /// Stop all background cues.
    async fn stop_cues(&self) -> Result<()> {
        Ok(())
    }
}

/// HTTP synthesis client.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value, cancel: &CancelScope) -> Result<()> {
        let url = format!("{}{}", self.endpoint.trim_end_matches('/'), path);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = match cancel.run(req.send()).await {
            Some(resp) => resp?,
            None => return Err(MediaError::Cancelled),
        };
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(MediaError::Api { status, message });
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, piece: &SpeechPiece, cancel: &CancelScope) -> Result<()> {
        self.post(
            "/synthesize",
            serde_json::json!({
                "text": piece.text,
                "style": piece.style,
                "language": piece.language.as_str(),
                "voice": piece.voice,
            }),
            cancel,
        )
        .await
    }

    async fn play_cue(&self, cue: SoundCue) -> Result<()> {
        self.post(
            "/cue",
            serde_json::json!({ "cue": cue.as_str(), "action": "start" }),
            &CancelScope::root(),
        )
        .await
    }

    async fn stop_cues(&self) -> Result<()> {
        self.post(
            "/cue",
            serde_json::json!({ "action": "stop" }),
            &CancelScope::root(),
        )
        .await
    }
}
