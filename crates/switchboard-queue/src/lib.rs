pub mod dispatcher;
pub mod error;
pub mod events;
pub mod queue;

pub use dispatcher::BackgroundDispatcher;
pub use error::{QueueError, Result};
pub use events::{
    CallEvent, InboundSms, JobKind, MediaEventKind, PostCallJob, TrainingJob,
};
pub use queue::{Delivery, QueueName, WorkQueue};
