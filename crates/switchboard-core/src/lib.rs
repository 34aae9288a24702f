pub mod cancel;
pub mod config;
pub mod error;
pub mod flags;
pub mod retry;
pub mod types;

pub use cancel::CancelScope;
pub use error::{ErrorClass, Result, SwitchboardError};
pub use flags::{FlagService, FlagSnapshot, FlagSource};
pub use types::{CallId, EventFingerprint, LangTag, PhoneNumber};
