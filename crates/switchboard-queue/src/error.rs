use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message no longer held: {id}")]
    ReceiptExpired { id: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
