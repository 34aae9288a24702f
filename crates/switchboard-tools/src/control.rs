//! Call control tools: transfer and hangup.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{CallDirective, Tool, ToolCtx, ToolOutcome};

/// `talk_to_human`: end assistant speech and transfer to the agent
/// phone number from the initiate block.
pub struct TalkToHumanTool;

#[async_trait]
impl Tool for TalkToHumanTool {
    fn name(&self) -> &str {
        "talk_to_human"
    }

    fn description(&self) -> &str {
        "Transfer the caller to a human agent. Use when the caller asks for \
         a person or the request is beyond what you can handle."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, ctx: &mut ToolCtx<'_>, _input: Value) -> ToolOutcome {
        let agent = ctx.call.initiate.agent_phone_number.clone();
        ToolOutcome::success(format!("transferring the caller to {agent}"))
            .with_directive(CallDirective::TransferToAgent)
    }
}

/// `end_call`: end assistant speech and hang up.
pub struct EndCallTool;

#[async_trait]
impl Tool for EndCallTool {
    fn name(&self) -> &str {
        "end_call"
    }

    fn description(&self) -> &str {
        "End the call. Use once the caller's request is fully handled and \
         the goodbye has been said, or when the caller asks to hang up."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _ctx: &mut ToolCtx<'_>, _input: Value) -> ToolOutcome {
        ToolOutcome::success("ending the call").with_directive(CallDirective::EndCall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps, sample_call};
    use crate::TurnScratch;

    #[tokio::test]
    async fn control_tools_emit_directives() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = deps();
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };

        let outcome = TalkToHumanTool.execute(&mut ctx, json!({})).await;
        assert_eq!(outcome.directive, Some(CallDirective::TransferToAgent));
        assert!(outcome.content.contains("+33100000000"));

        let outcome = EndCallTool.execute(&mut ctx, json!({})).await;
        assert_eq!(outcome.directive, Some(CallDirective::EndCall));
    }
}
