//! Media bridge: speech recognition in, speech synthesis out.
//!
//! The telephony gateway owns the raw audio; this crate abstracts the
//! STT/TTS services behind traits, serializes synthesis so chunks never
//! overlap, and decides when the caller has finished a turn.

pub mod cues;
pub mod mock;
pub mod speaker;
pub mod stt;
pub mod tts;
pub mod turn;

pub use cues::{SoundCue, Utterance};
pub use speaker::{SpeakerHandle, SpeakerQueue};
pub use stt::{RecognitionEvent, RecognitionKind, SpeechRecognizer};
pub use tts::{SpeechPiece, SpeechSynthesizer};
pub use turn::{TurnDetector, TurnSignal, TurnThresholds};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("recognizer unreachable after {attempts} attempts")]
    RecognizerUnreachable { attempts: u32 },

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MediaError>;
