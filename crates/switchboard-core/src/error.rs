use thiserror::Error;

/// Cross-crate failure classification. Every subsystem error maps into one
/// of these classes so the orchestrator can pick a policy without matching
/// on foreign enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retriable network/LLM/STT/TTS failure. Jittered backoff, capped.
    TransientRemote,
    /// Optimistic-concurrency save rejection. Reload and re-apply.
    Conflict,
    /// Lease renewal failed. Abort the call scope; another worker resumes.
    LeaseLost,
    /// Tool arguments, claim values, or language code violate schema.
    /// Reply with a clarifying utterance, do not mutate state.
    Invalid,
    /// Content-safety blocked a sentence. Drop it, continue the turn.
    Filtered,
    /// Unrecoverable within this call. Apologise, disconnect, end.
    FatalCall,
    /// Process-wide failure. Exit; the supervisor restarts.
    FatalWorker,
}

#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Save conflict on call {call_id}")]
    Conflict { call_id: String },

    #[error("Lease lost for {key}")]
    LeaseLost { key: String },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("LLM driver error: {0}")]
    Llm(String),

    #[error("Media bridge error: {0}")]
    Media(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Content filtered: {categories:?}")]
    Filtered { categories: Vec<String> },

    #[error("Call failed: {0}")]
    FatalCall(String),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwitchboardError {
    /// Map this error into the policy class the orchestrator acts on.
    pub fn class(&self) -> ErrorClass {
        match self {
            SwitchboardError::Config(_) => ErrorClass::FatalWorker,
            SwitchboardError::Store(_) => ErrorClass::TransientRemote,
            SwitchboardError::Conflict { .. } => ErrorClass::Conflict,
            SwitchboardError::LeaseLost { .. } => ErrorClass::LeaseLost,
            SwitchboardError::Queue(_) => ErrorClass::TransientRemote,
            SwitchboardError::Llm(_) => ErrorClass::TransientRemote,
            SwitchboardError::Media(_) => ErrorClass::TransientRemote,
            SwitchboardError::Invalid(_) => ErrorClass::Invalid,
            SwitchboardError::Filtered { .. } => ErrorClass::Filtered,
            SwitchboardError::FatalCall(_) => ErrorClass::FatalCall,
            SwitchboardError::Timeout { .. } => ErrorClass::TransientRemote,
            SwitchboardError::Serialization(_) => ErrorClass::Invalid,
            SwitchboardError::Io(_) => ErrorClass::TransientRemote,
            SwitchboardError::Internal(_) => ErrorClass::FatalCall,
        }
    }

    /// Short error code string used in logs and operator incidents.
    pub fn code(&self) -> &'static str {
        match self {
            SwitchboardError::Config(_) => "CONFIG_ERROR",
            SwitchboardError::Store(_) => "STORE_ERROR",
            SwitchboardError::Conflict { .. } => "SAVE_CONFLICT",
            SwitchboardError::LeaseLost { .. } => "LEASE_LOST",
            SwitchboardError::Queue(_) => "QUEUE_ERROR",
            SwitchboardError::Llm(_) => "LLM_ERROR",
            SwitchboardError::Media(_) => "MEDIA_ERROR",
            SwitchboardError::Invalid(_) => "INVALID_INPUT",
            SwitchboardError::Filtered { .. } => "CONTENT_FILTERED",
            SwitchboardError::FatalCall(_) => "FATAL_CALL",
            SwitchboardError::Timeout { .. } => "TIMEOUT",
            SwitchboardError::Serialization(_) => "SERIALIZATION_ERROR",
            SwitchboardError::Io(_) => "IO_ERROR",
            SwitchboardError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
