//! Reminder tools for the follow-up items attached to the Call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use switchboard_store::{Reminder, ReminderOwner};

use crate::{require_str, Tool, ToolCtx, ToolOutcome};

fn parse_owner(raw: &str) -> Result<ReminderOwner, String> {
    match raw {
        "assistant" => Ok(ReminderOwner::Assistant),
        "human" => Ok(ReminderOwner::Human),
        other => Err(format!("owner must be 'assistant' or 'human', got '{other}'")),
    }
}

fn parse_due_at(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("'due_at' is not an RFC3339 datetime: {e}"))
}

/// `new_reminder`: append a follow-up item.
pub struct NewReminderTool;

#[async_trait]
impl Tool for NewReminderTool {
    fn name(&self) -> &str {
        "new_reminder"
    }

    fn description(&self) -> &str {
        "Create a follow-up reminder on this case, e.g. a call-back or a \
         document the caller must send. Use whenever a future action is \
         agreed during the conversation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short label for the reminder."
                },
                "description": {
                    "type": "string",
                    "description": "What needs to happen."
                },
                "due_at": {
                    "type": "string",
                    "description": "ISO-8601 UTC datetime when it is due."
                },
                "owner": {
                    "type": "string",
                    "enum": ["assistant", "human"],
                    "description": "Who is responsible for it."
                }
            },
            "required": ["title", "description", "due_at", "owner"]
        })
    }

    async fn execute(&self, ctx: &mut ToolCtx<'_>, input: Value) -> ToolOutcome {
        let title = match require_str(&input, "title") {
            Ok(v) => v.to_string(),
            Err(out) => return out,
        };
        let description = match require_str(&input, "description") {
            Ok(v) => v.to_string(),
            Err(out) => return out,
        };
        let due_at = match require_str(&input, "due_at").map(|raw| parse_due_at(raw)) {
            Ok(Ok(dt)) => dt,
            Ok(Err(msg)) => return ToolOutcome::error(msg),
            Err(out) => return out,
        };
        let owner = match require_str(&input, "owner").map(parse_owner) {
            Ok(Ok(o)) => o,
            Ok(Err(msg)) => return ToolOutcome::error(msg),
            Err(out) => return out,
        };

        ctx.call.add_reminder(Reminder {
            created_at: Utc::now(),
            title: title.clone(),
            description,
            due_at,
            owner,
        });
        ctx.turn.knowledge_produced = true;
        ToolOutcome::success(format!(
            "reminder '{title}' created, due {}",
            due_at.to_rfc3339()
        ))
    }
}

/// `updated_reminder`: patch an existing reminder by index.
pub struct UpdatedReminderTool;

#[async_trait]
impl Tool for UpdatedReminderTool {
    fn name(&self) -> &str {
        "updated_reminder"
    }

    fn description(&self) -> &str {
        "Modify an existing reminder by its position in the reminders \
         list (0-based). Only the provided fields change."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": {
                    "type": "integer",
                    "description": "0-based position in the reminders list."
                },
                "title": { "type": "string" },
                "description": { "type": "string" },
                "due_at": {
                    "type": "string",
                    "description": "ISO-8601 UTC datetime when it is due."
                },
                "owner": {
                    "type": "string",
                    "enum": ["assistant", "human"]
                }
            },
            "required": ["index"]
        })
    }

    async fn execute(&self, ctx: &mut ToolCtx<'_>, input: Value) -> ToolOutcome {
        let index = match input.get("index").and_then(|v| v.as_u64()) {
            Some(i) => i as usize,
            None => return ToolOutcome::error("'index' is required"),
        };
        let due_at = match input.get("due_at").and_then(|v| v.as_str()) {
            Some(raw) => match parse_due_at(raw) {
                Ok(dt) => Some(dt),
                Err(msg) => return ToolOutcome::error(msg),
            },
            None => None,
        };
        let owner = match input.get("owner").and_then(|v| v.as_str()) {
            Some(raw) => match parse_owner(raw) {
                Ok(o) => Some(o),
                Err(msg) => return ToolOutcome::error(msg),
            },
            None => None,
        };
        let title = input
            .get("title")
            .and_then(|v| v.as_str())
            .map(String::from);
        let description = input
            .get("description")
            .and_then(|v| v.as_str())
            .map(String::from);

        match ctx
            .call
            .update_reminder(index, title, description, due_at, owner)
        {
            Ok(()) => {
                ctx.turn.knowledge_produced = true;
                ToolOutcome::success(format!("reminder {index} updated"))
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}
