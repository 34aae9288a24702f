use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("call not found: {id}")]
    NotFound { id: String },

    #[error("save conflict: call {id} at version {expected} was modified")]
    Conflict { id: String, expected: u64 },

    #[error("lease busy: {key}")]
    LeaseBusy { key: String },

    #[error("lease lost: {key}")]
    LeaseLost { key: String },

    #[error("invalid call mutation: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the caller may retry the same operation unchanged.
    ///
    /// `Database` covers lock contention that outlived the connection's
    /// busy_timeout; `LeaseLost` and `Conflict` are never transient, they
    /// need a state decision from the caller (abort the scope, or reload
    /// and re-apply).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
