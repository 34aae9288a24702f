//! Claim mutation tools.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{require_str, CallDirective, Tool, ToolCtx, ToolOutcome};

/// `update_claim`: validate and set one claim field, then cue a brief
/// spoken acknowledgment.
pub struct UpdateClaimTool;

#[async_trait]
impl Tool for UpdateClaimTool {
    fn name(&self) -> &str {
        "update_claim"
    }

    fn description(&self) -> &str {
        "Set one field of the claim record. The field must exist in the \
         claim schema and the value must match its declared type \
         (text, email, datetime, phone_number). Call this as soon as the \
         caller provides a piece of claim information."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "field": {
                    "type": "string",
                    "description": "Name of the claim field to set."
                },
                "value": {
                    "type": "string",
                    "description": "Value provided by the caller."
                }
            },
            "required": ["field", "value"]
        })
    }

    async fn execute(&self, ctx: &mut ToolCtx<'_>, input: Value) -> ToolOutcome {
        let field = match require_str(&input, "field") {
            Ok(f) => f,
            Err(out) => return out,
        };
        let value = match require_str(&input, "value") {
            Ok(v) => v,
            Err(out) => return out,
        };

        match ctx.call.set_claim_field(field, value) {
            Ok(()) => {
                ctx.turn.knowledge_produced = true;
                ToolOutcome::success(format!("claim field '{field}' set"))
                    .with_directive(CallDirective::AcknowledgeClaim)
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

/// `new_claim`: finalize the current Call and begin a new one for the
/// same caller. The orchestrator performs the actual rollover.
pub struct NewClaimTool;

#[async_trait]
impl Tool for NewClaimTool {
    fn name(&self) -> &str {
        "new_claim"
    }

    fn description(&self) -> &str {
        "Close the current claim and open a fresh one for the same caller. \
         Use when the caller wants to report a second, unrelated case."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _ctx: &mut ToolCtx<'_>, _input: Value) -> ToolOutcome {
        ToolOutcome::success("current claim closed, a new claim record is being opened")
            .with_directive(CallDirective::ResetClaim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps, sample_call};
    use crate::TurnScratch;

    #[tokio::test]
    async fn update_claim_sets_valid_field() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = deps();
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };

        let outcome = UpdateClaimTool
            .execute(
                &mut ctx,
                json!({"field": "policy_number", "value": "B01371946"}),
            )
            .await;

        assert!(!outcome.is_error);
        assert_eq!(outcome.directive, Some(CallDirective::AcknowledgeClaim));
        assert_eq!(call.claim["policy_number"], "B01371946");
        assert!(turn.knowledge_produced);
    }

    #[tokio::test]
    async fn update_claim_rejects_unknown_field_without_mutation() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = deps();
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };

        let outcome = UpdateClaimTool
            .execute(&mut ctx, json!({"field": "favourite_color", "value": "blue"}))
            .await;

        assert!(outcome.is_error);
        assert!(call.claim.is_empty());
        assert!(!turn.knowledge_produced);
    }

    #[tokio::test]
    async fn update_claim_rejects_bad_value() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = deps();
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };

        let outcome = UpdateClaimTool
            .execute(
                &mut ctx,
                json!({"field": "contact_email", "value": "not an email"}),
            )
            .await;
        assert!(outcome.is_error);

        let outcome = UpdateClaimTool
            .execute(&mut ctx, json!({"field": "policy_number"}))
            .await;
        assert!(outcome.is_error);
    }

    #[tokio::test]
    async fn new_claim_signals_reset() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = deps();
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };
        let outcome = NewClaimTool.execute(&mut ctx, json!({})).await;
        assert_eq!(outcome.directive, Some(CallDirective::ResetClaim));
    }
}
