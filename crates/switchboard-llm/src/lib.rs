pub mod driver;
pub mod openai;
pub mod provider;
pub mod repair;
pub mod stream;

pub use driver::TieredDriver;
pub use provider::{
    ChatMessage, CompletionRequest, LlmProvider, ModelTier, ProviderError, Role, ToolDefinition,
    ToolInvocation,
};
pub use stream::CompletionEvent;
