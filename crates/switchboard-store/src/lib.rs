pub mod call;
pub mod db;
pub mod error;
pub mod flags_source;
pub mod lease;
pub mod store;

pub use call::{
    Call, ClaimField, ClaimFieldType, InitiateBlock, Message, MessageAction, NextAction, NextStep,
    Persona, PromptOverrides, Reminder, ReminderOwner, Satisfaction, Style, Synthesis,
    ToolCallRecord,
};
pub use error::{Result, StoreError};
pub use lease::{Lease, LeaseManager};
pub use store::CallStore;
