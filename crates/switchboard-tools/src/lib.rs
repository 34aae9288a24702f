//! Tool system for the conversation loop.
//!
//! Defines the `Tool` trait all tools implement, plus a registry that
//! produces the serializable definition list for the LLM driver and a
//! dispatch surface. Tools execute against a [`ToolCtx`] carrying the
//! Call document (exclusive, under the lease) and the per-turn scratch.

pub mod claim;
pub mod control;
pub mod reminders;
pub mod search;
pub mod sms;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use switchboard_core::types::PhoneNumber;
use switchboard_llm::provider::{ToolDefinition, ToolInvocation};
use switchboard_services::{DocumentSearch, SearchHit};
use switchboard_store::Call;

/// What a finished tool call tells the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirective {
    /// Speak the short claim acknowledgment cue.
    AcknowledgeClaim,
    /// Wrap up speech and hang up.
    EndCall,
    /// Wrap up speech and transfer to the agent number.
    TransferToAgent,
    /// Finalize this call and start a fresh one for the same caller.
    ResetClaim,
}

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
    /// Optional control-flow signal for the orchestrator.
    pub directive: Option<CallDirective>,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            directive: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            directive: None,
        }
    }

    pub fn with_directive(mut self, directive: CallDirective) -> Self {
        self.directive = Some(directive);
        self
    }
}

/// Per-turn scratch shared between tools and the prompt assembler.
#[derive(Debug, Default)]
pub struct TurnScratch {
    /// Retrieval hits produced by `search_documents` this turn; injected
    /// into the next completion as a system note.
    pub search_hits: Vec<SearchHit>,
    /// Set when the claim or reminders were mutated (training trigger).
    pub knowledge_produced: bool,
}

/// Outbound SMS sink. The gateway wires this to the SMS client; tests
/// substitute a recorder.
#[async_trait]
pub trait SmsOutbox: Send + Sync {
    async fn enqueue(&self, to: &PhoneNumber, body: &str) -> Result<(), String>;
}

/// Shared dependencies handed to tools at dispatch time.
pub struct ToolDeps {
    pub search: Option<Arc<dyn DocumentSearch>>,
    pub sms: Arc<dyn SmsOutbox>,
}

/// Execution context for one tool call. The Call is borrowed mutably:
/// claim and reminder mutations serialize against the document by
/// construction.
pub struct ToolCtx<'a> {
    pub call: &'a mut Call,
    pub turn: &'a mut TurnScratch,
    pub deps: &'a ToolDeps,
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "update_claim").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given input.
    async fn execute(&self, ctx: &mut ToolCtx<'_>, input: serde_json::Value) -> ToolOutcome;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Box<dyn Tool>>) -> Self {
        Self { tools }
    }

    /// The full built-in set.
    pub fn builtin() -> Self {
        Self::new(vec![
            Box::new(claim::UpdateClaimTool),
            Box::new(claim::NewClaimTool),
            Box::new(control::TalkToHumanTool),
            Box::new(control::EndCallTool),
            Box::new(reminders::NewReminderTool),
            Box::new(reminders::UpdatedReminderTool),
            Box::new(search::SearchDocumentsTool),
            Box::new(sms::SendSmsTool),
        ])
    }

    /// Serializable description list for the LLM driver.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect()
    }

    /// Find and execute the named tool. Unknown names become an error
    /// outcome the LLM can react to.
    pub async fn dispatch(
        &self,
        ctx: &mut ToolCtx<'_>,
        invocation: &ToolInvocation,
    ) -> ToolOutcome {
        match self.tools.iter().find(|t| t.name() == invocation.name) {
            Some(tool) => {
                debug!(tool = %invocation.name, "executing tool");
                tool.execute(ctx, invocation.arguments.clone()).await
            }
            None => ToolOutcome::error(format!("unknown tool: {}", invocation.name)),
        }
    }
}

/// Extract a required string argument, trimmed.
pub(crate) fn require_str<'v>(
    input: &'v serde_json::Value,
    key: &str,
) -> Result<&'v str, ToolOutcome> {
    match input.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(ToolOutcome::error(format!("'{key}' is required"))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;
    use switchboard_core::types::LangTag;
    use switchboard_store::{ClaimField, ClaimFieldType, InitiateBlock};

    pub fn sample_call() -> Call {
        Call::new(InitiateBlock {
            bot_name: "Emma".to_string(),
            bot_company: "Contoso Assurance".to_string(),
            agent_phone_number: "+33100000000".to_string(),
            caller_phone_number: PhoneNumber::parse("+33612345678").unwrap(),
            lang_default: LangTag::new("fr-FR"),
            languages_available: vec![LangTag::new("fr-FR"), LangTag::new("en-US")],
            task_description: "File an insurance claim".to_string(),
            claim_schema: vec![
                ClaimField {
                    name: "policy_number".to_string(),
                    field_type: ClaimFieldType::Text,
                    description: None,
                },
                ClaimField {
                    name: "contact_email".to_string(),
                    field_type: ClaimFieldType::Email,
                    description: None,
                },
            ],
            prompts_overrides: None,
        })
    }

    #[derive(Default)]
    pub struct RecordingOutbox {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SmsOutbox for RecordingOutbox {
        async fn enqueue(&self, to: &PhoneNumber, body: &str) -> Result<(), String> {
            self.sent
                .lock()
                .unwrap()
                .push((to.as_str().to_string(), body.to_string()));
            Ok(())
        }
    }

    pub fn deps() -> ToolDeps {
        ToolDeps {
            search: None,
            sms: Arc::new(RecordingOutbox::default()),
        }
    }

    pub fn deps_with_outbox(outbox: Arc<RecordingOutbox>) -> ToolDeps {
        ToolDeps {
            search: None,
            sms: outbox,
        }
    }
}
