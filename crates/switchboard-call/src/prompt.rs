//! Prompt assembly — a pure function of the Call and the turn context.
//!
//! Layout: one system message built from the templates and Call state,
//! then the most recent history that fits the character budget, then an
//! optional retrieval note when the current turn produced search hits.

use chrono::{DateTime, Utc};

use switchboard_llm::provider::{ChatMessage, ToolInvocation};
use switchboard_services::SearchHit;
use switchboard_store::{Call, MessageAction, Persona};

/// Base persona template. Placeholders are substituted from Call state;
/// `initiate.prompts_overrides.default_system_tpl` replaces it per call.
const DEFAULT_SYSTEM_TPL: &str = "\
You are {bot_name}, a phone assistant for {bot_company}.
Today is {date}. You are speaking with the caller at {phone_number}; \
your own number is {bot_phone_number}.
Answer in {default_lang}. Keep replies short and conversational; they \
are spoken aloud, so never use markdown, lists, or code blocks.";

/// Conversation-task template, appended after the persona block.
const CHAT_SYSTEM_TPL: &str = "\
Your task: {task}.
Fill the claim record as the caller provides information, using the \
update_claim tool immediately for each piece. Current claim:
{claim}
Current reminders:
{reminders}";

/// Margin kept free for tool definitions and the model's own output.
const BUDGET_SAFETY_MARGIN: usize = 2_000;

/// Per-turn inputs that are not part of the Call document.
pub struct TurnContext<'a> {
    /// Injected clock — assembly stays a pure function.
    pub today: DateTime<Utc>,
    /// Retrieval hits from `search_documents` in the current turn.
    pub search_hits: &'a [SearchHit],
    /// Character budget for the whole prompt (model context minus margin).
    pub context_chars: usize,
}

/// Build the ordered message list for one completion.
pub fn assemble(call: &Call, ctx: &TurnContext<'_>) -> Vec<ChatMessage> {
    let system = system_prompt(call, ctx.today);

    let budget = ctx
        .context_chars
        .saturating_sub(system.len() + BUDGET_SAFETY_MARGIN);
    let mut messages = vec![ChatMessage::system(system)];
    messages.extend(history(call, budget));

    if !ctx.search_hits.is_empty() {
        let mut note = String::from(
            "Reference material retrieved for this turn (cite it, do not read it verbatim):\n",
        );
        for hit in ctx.search_hits {
            note.push_str("- ");
            note.push_str(&normalize(&hit.snippet));
            note.push('\n');
        }
        messages.push(ChatMessage::system(note.trim_end().to_string()));
    }

    messages
}

fn system_prompt(call: &Call, today: DateTime<Utc>) -> String {
    let overrides = call.initiate.prompts_overrides.as_ref();
    let default_tpl = overrides
        .and_then(|o| o.default_system_tpl.as_deref())
        .unwrap_or(DEFAULT_SYSTEM_TPL);
    let chat_tpl = overrides
        .and_then(|o| o.chat_system_tpl.as_deref())
        .unwrap_or(CHAT_SYSTEM_TPL);

    let text = format!("{default_tpl}\n\n{chat_tpl}");
    let filled = text
        .replace("{bot_name}", &call.initiate.bot_name)
        .replace("{bot_company}", &call.initiate.bot_company)
        .replace("{date}", &today.format("%Y-%m-%d").to_string())
        .replace("{phone_number}", call.caller_phone().as_str())
        .replace("{bot_phone_number}", &call.initiate.agent_phone_number)
        .replace("{default_lang}", call.lang_current_short_code.as_str())
        .replace("{task}", &call.initiate.task_description)
        .replace("{claim}", &render_claim(call))
        .replace("{reminders}", &render_reminders(call));
    normalize(&filled)
}

fn render_claim(call: &Call) -> String {
    if call.initiate.claim_schema.is_empty() {
        return "(no claim schema)".to_string();
    }
    let mut out = String::new();
    for field in &call.initiate.claim_schema {
        let value = call
            .claim
            .get(&field.name)
            .map(String::as_str)
            .unwrap_or("<empty>");
        out.push_str(&format!("- {}: {}\n", field.name, value));
    }
    out.trim_end().to_string()
}

fn render_reminders(call: &Call) -> String {
    if call.reminders.is_empty() {
        return "(none)".to_string();
    }
    let mut out = String::new();
    for (i, r) in call.reminders.iter().enumerate() {
        out.push_str(&format!(
            "- [{}] {} due {} ({:?})\n",
            i,
            r.title,
            r.due_at.format("%Y-%m-%d %H:%M"),
            r.owner
        ));
    }
    out.trim_end().to_string()
}

/// Map the Call's message log onto completion messages, newest-first
/// within `budget` characters, then restore chronological order. A
/// leading orphaned tool result (whose assistant turn fell outside the
/// budget) is dropped.
fn history(call: &Call, budget: usize) -> Vec<ChatMessage> {
    let mut picked: Vec<ChatMessage> = Vec::new();
    let mut used = 0usize;

    for message in call.messages.iter().rev() {
        let Some(mapped) = map_message(message) else {
            continue;
        };
        let cost = mapped.content.len() + 64;
        if used + cost > budget && !picked.is_empty() {
            break;
        }
        used += cost;
        picked.push(mapped);
    }
    picked.reverse();

    while picked
        .first()
        .map(|m| m.tool_call_id.is_some())
        .unwrap_or(false)
    {
        picked.remove(0);
    }
    picked
}

fn map_message(message: &switchboard_store::Message) -> Option<ChatMessage> {
    match (message.persona, message.action) {
        (Persona::Human, MessageAction::Sms) => Some(ChatMessage::user(format!(
            "[SMS from caller] {}",
            normalize(&message.content)
        ))),
        (Persona::Human, _) => Some(ChatMessage::user(normalize(&message.content))),
        (Persona::Assistant, MessageAction::Sms) => Some(ChatMessage::assistant(
            format!("[SMS sent to caller] {}", normalize(&message.content)),
            Vec::new(),
        )),
        (Persona::Assistant, _) => {
            let tool_calls: Vec<ToolInvocation> = message
                .tool_calls
                .iter()
                .map(|tc| ToolInvocation {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .collect();
            Some(ChatMessage::assistant(
                normalize(&message.content),
                tool_calls,
            ))
        }
        (Persona::Tool, _) => {
            let id = message.tool_calls.first()?.id.clone();
            Some(ChatMessage::tool_result(id, normalize(&message.content)))
        }
        // Internal bookkeeping (hangup records, transfer notes) stays out
        // of the model's view.
        (Persona::System, _) => None,
    }
}

/// Collapse runs of spaces/tabs, strip control characters, keep
/// intentional line breaks.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        match c {
            ' ' | '\t' => pending_space = true,
            '\n' => {
                while out.ends_with(' ') {
                    out.pop();
                }
                pending_space = false;
                out.push('\n');
            }
            c if c.is_control() => {}
            c => {
                if pending_space && !out.is_empty() && !out.ends_with('\n') {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::types::{LangTag, PhoneNumber};
    use switchboard_llm::provider::Role;
    use switchboard_store::{
        ClaimField, ClaimFieldType, InitiateBlock, Message, Style, ToolCallRecord,
    };

    fn sample_call() -> Call {
        Call::new(InitiateBlock {
            bot_name: "Emma".to_string(),
            bot_company: "Contoso Assurance".to_string(),
            agent_phone_number: "+33100000000".to_string(),
            caller_phone_number: PhoneNumber::parse("+33612345678").unwrap(),
            lang_default: LangTag::new("fr-FR"),
            languages_available: vec![LangTag::new("fr-FR")],
            task_description: "File an insurance claim".to_string(),
            claim_schema: vec![ClaimField {
                name: "policy_number".to_string(),
                field_type: ClaimFieldType::Text,
                description: None,
            }],
            prompts_overrides: None,
        })
    }

    fn ctx(hits: &[SearchHit]) -> TurnContext<'_> {
        TurnContext {
            today: "2026-08-01T10:00:00Z".parse().unwrap(),
            search_hits: hits,
            context_chars: 24_000,
        }
    }

    #[test]
    fn placeholders_are_substituted() {
        let mut call = sample_call();
        call.set_claim_field("policy_number", "B01371946").unwrap();
        let messages = assemble(&call, &ctx(&[]));

        let system = &messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.contains("Emma"));
        assert!(system.content.contains("Contoso Assurance"));
        assert!(system.content.contains("2026-08-01"));
        assert!(system.content.contains("+33612345678"));
        assert!(system.content.contains("fr-FR"));
        assert!(system.content.contains("policy_number: B01371946"));
        assert!(!system.content.contains('{'));
    }

    #[test]
    fn assembly_is_pure() {
        let mut call = sample_call();
        call.append_message(Message::human("bonjour"));
        let context = ctx(&[]);
        let a = assemble(&call, &context);
        let b = assemble(&call, &context);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.content, y.content);
        }
    }

    #[test]
    fn history_maps_personas_and_tools() {
        let mut call = sample_call();
        call.append_message(Message::human("je veux déclarer un sinistre"));
        let mut assistant = Message::assistant("", Style::None);
        assistant.tool_calls = vec![ToolCallRecord {
            id: "c1".to_string(),
            name: "update_claim".to_string(),
            arguments: serde_json::json!({"field": "policy_number", "value": "B01371946"}),
            result: Some("claim field 'policy_number' set".to_string()),
            error: None,
        }];
        call.append_message(assistant);
        call.append_message(Message::tool("c1", "claim field 'policy_number' set"));

        let messages = assemble(&call, &ctx(&[]));
        // system + user + assistant(tool_calls) + tool result
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[2].tool_calls[0].name, "update_claim");
        assert_eq!(messages[3].role, Role::Tool);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn old_history_is_truncated_and_orphans_dropped() {
        let mut call = sample_call();
        let mut assistant = Message::assistant("first reply", Style::None);
        assistant.tool_calls = vec![ToolCallRecord {
            id: "c0".to_string(),
            name: "update_claim".to_string(),
            arguments: serde_json::json!({}),
            result: None,
            error: None,
        }];
        call.append_message(assistant);
        call.append_message(Message::tool("c0", "ok"));
        for i in 0..50 {
            call.append_message(Message::human(format!("message {i} {}", "x".repeat(400))));
        }

        let context = TurnContext {
            today: Utc::now(),
            search_hits: &[],
            context_chars: 8_000,
        };
        let messages = assemble(&call, &context);
        // the oldest entries fell off, and nothing starts with a tool result
        assert!(messages.len() > 2);
        assert!(messages[1].tool_call_id.is_none());
        let total: usize = messages.iter().map(|m| m.content.len()).sum();
        assert!(total < 8_000);
    }

    #[test]
    fn search_hits_become_a_system_note() {
        let call = sample_call();
        let hits = vec![SearchHit {
            snippet: "Claims   must be reported\twithin 5 days.".to_string(),
            score: 0.9,
            source: None,
        }];
        let messages = assemble(&call, &ctx(&hits));
        let note = messages.last().unwrap();
        assert_eq!(note.role, Role::System);
        assert!(note.content.contains("Claims must be reported within 5 days."));
    }

    #[test]
    fn sms_messages_are_labelled() {
        let mut call = sample_call();
        call.append_message(Message {
            created_at: Utc::now(),
            action: MessageAction::Sms,
            persona: Persona::Human,
            content: "voici ma référence".to_string(),
            style: Style::None,
            tool_calls: Vec::new(),
        });
        let messages = assemble(&call, &ctx(&[]));
        assert!(messages[1].content.starts_with("[SMS from caller]"));
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize("a   b\t\tc"), "a b c");
        assert_eq!(normalize("line one  \nline two"), "line one\nline two");
        assert_eq!(normalize("bell\u{7}char"), "bellchar");
    }

    #[test]
    fn template_overrides_apply() {
        let mut call = sample_call();
        call.initiate.prompts_overrides = Some(switchboard_store::PromptOverrides {
            default_system_tpl: Some("You are {bot_name}, terse.".to_string()),
            chat_system_tpl: Some("Task: {task}".to_string()),
        });
        let messages = assemble(&call, &ctx(&[]));
        assert!(messages[0].content.starts_with("You are Emma, terse."));
        assert!(messages[0].content.contains("Task: File an insurance claim"));
    }
}
