//! `send_sms`: text the caller during or after the conversation.

use async_trait::async_trait;
use serde_json::{json, Value};

use switchboard_store::{Message, MessageAction, Persona, Style};

use crate::{require_str, Tool, ToolCtx, ToolOutcome};

pub struct SendSmsTool;

#[async_trait]
impl Tool for SendSmsTool {
    fn name(&self) -> &str {
        "send_sms"
    }

    fn description(&self) -> &str {
        "Send a text message to the caller's phone number, e.g. a link, a \
         reference number, or a summary they asked to receive in writing."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Message body to send."
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, ctx: &mut ToolCtx<'_>, input: Value) -> ToolOutcome {
        let text = match require_str(&input, "text") {
            Ok(t) => t.to_string(),
            Err(out) => return out,
        };
        let to = ctx.call.caller_phone().clone();
        match ctx.deps.sms.enqueue(&to, &text).await {
            Ok(()) => {
                ctx.call.append_message(Message {
                    created_at: chrono::Utc::now(),
                    action: MessageAction::Sms,
                    persona: Persona::Assistant,
                    content: text,
                    style: Style::None,
                    tool_calls: Vec::new(),
                });
                ToolOutcome::success(format!("SMS queued to {to}"))
            }
            Err(e) => ToolOutcome::error(format!("SMS delivery failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps_with_outbox, sample_call, RecordingOutbox};
    use crate::TurnScratch;
    use std::sync::Arc;

    #[tokio::test]
    async fn sms_is_queued_and_recorded() {
        let outbox = Arc::new(RecordingOutbox::default());
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = deps_with_outbox(outbox.clone());
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };

        let outcome = SendSmsTool
            .execute(&mut ctx, json!({"text": "Votre référence: B01371946"}))
            .await;
        assert!(!outcome.is_error);

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+33612345678");

        let last = call.messages.last().unwrap();
        assert_eq!(last.action, MessageAction::Sms);
        assert_eq!(last.persona, Persona::Assistant);
    }

    #[tokio::test]
    async fn missing_text_is_invalid() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = crate::test_support::deps();
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };
        let outcome = SendSmsTool.execute(&mut ctx, json!({})).await;
        assert!(outcome.is_error);
        assert!(call.messages.is_empty());
    }
}
