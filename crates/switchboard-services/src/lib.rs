//! HTTP clients for the external collaborators the core leans on:
//! translation, content-safety, vector search, and SMS delivery.
//!
//! Each service is a small trait so the call crate can substitute mocks;
//! the HTTP implementations share one JSON request helper with retry.

pub mod safety;
pub mod search;
pub mod sms;
pub mod translate;

mod http;

pub use safety::{ContentSafety, HttpContentSafety, SafetyVerdict};
pub use search::{DocumentSearch, HttpDocumentSearch, SearchHit};
pub use sms::{HttpSmsSender, SmsSender};
pub use translate::{HttpTranslator, Translator};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("service not configured: {0}")]
    NotConfigured(&'static str),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Http(_) => true,
            ServiceError::Api { status, .. } => *status >= 500 || *status == 429,
            ServiceError::Parse(_) => false,
            ServiceError::NotConfigured(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
