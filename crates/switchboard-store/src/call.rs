//! The Call document — root entity of one telephone conversation.
//!
//! A Call is mutated only by the worker holding its lease; every method
//! here enforces the document invariants (append-only messages except the
//! trailing assistant turn, claim keys bound to the declared schema,
//! language within the available set, terminal blocks set exactly once).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use switchboard_core::types::{CallId, EventFingerprint, LangTag, PhoneNumber};

use crate::error::{Result, StoreError};

/// Immutable initialization block, fixed at call creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateBlock {
    pub bot_name: String,
    pub bot_company: String,
    pub agent_phone_number: String,
    pub caller_phone_number: PhoneNumber,
    pub lang_default: LangTag,
    pub languages_available: Vec<LangTag>,
    pub task_description: String,
    pub claim_schema: Vec<ClaimField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts_overrides: Option<PromptOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_system_tpl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_system_tpl: Option<String>,
}

/// One element of the per-call claim schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: ClaimFieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimFieldType {
    Text,
    Email,
    Datetime,
    PhoneNumber,
}

impl ClaimFieldType {
    /// Validate a raw value against this type. Returns the canonical form
    /// to store (e.g. trimmed text, RFC3339 datetime).
    pub fn validate(&self, value: &str) -> std::result::Result<String, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("value is empty".to_string());
        }
        match self {
            ClaimFieldType::Text => Ok(value.to_string()),
            ClaimFieldType::Email => {
                let (local, domain) = value
                    .split_once('@')
                    .ok_or_else(|| format!("'{value}' is not an email address"))?;
                if local.is_empty() || !domain.contains('.') || domain.ends_with('.') {
                    return Err(format!("'{value}' is not an email address"));
                }
                Ok(value.to_lowercase())
            }
            ClaimFieldType::Datetime => DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
                .map_err(|e| format!("'{value}' is not an RFC3339 datetime: {e}")),
            ClaimFieldType::PhoneNumber => {
                PhoneNumber::parse(value).map(|p| p.as_str().to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAction {
    Call,
    Hangup,
    Talk,
    Sms,
    Transfer,
    Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    Human,
    Assistant,
    Tool,
    System,
}

/// Emotional style the assistant selected for a spoken turn, carried
/// through to the synthesizer voice mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    None,
    Cheerful,
    Sad,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Style::None => "none",
            Style::Cheerful => "cheerful",
            Style::Sad => "sad",
        }
    }
}

/// A structured tool request emitted by the LLM within an assistant turn.
/// The `result`/`error` fields are filled once the tool has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub created_at: DateTime<Utc>,
    pub action: MessageAction,
    pub persona: Persona,
    pub content: String,
    #[serde(default)]
    pub style: Style,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            action: MessageAction::Talk,
            persona: Persona::Human,
            content: content.into(),
            style: Style::None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, style: Style) -> Self {
        Self {
            created_at: Utc::now(),
            action: MessageAction::Talk,
            persona: Persona::Assistant,
            content: content.into(),
            style,
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            action: MessageAction::Note,
            persona: Persona::Tool,
            content: content.into(),
            style: Style::None,
            tool_calls: vec![ToolCallRecord {
                id: tool_call_id.to_string(),
                name: String::new(),
                arguments: serde_json::Value::Null,
                result: None,
                error: None,
            }],
        }
    }

    pub fn system(action: MessageAction, content: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            action,
            persona: Persona::System,
            content: content.into(),
            style: Style::None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub due_at: DateTime<Utc>,
    pub owner: ReminderOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderOwner {
    Assistant,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    CaseClosed,
    CaseEscalated,
    CallBack,
    Silence,
}

/// Terminal disposition, set exactly once when the call ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextStep {
    pub action: NextAction,
    pub justification: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Satisfaction {
    Low,
    Medium,
    High,
    #[default]
    Unknown,
}

/// Post-call enrichment, set exactly once by the background worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub short: String,
    pub long: String,
    pub satisfaction: Satisfaction,
    pub improvement_suggestions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub call_id: CallId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped by the store on each save.
    #[serde(default)]
    pub version: u64,
    pub initiate: InitiateBlock,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub claim: BTreeMap<String, String>,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<Synthesis>,
    pub lang_current_short_code: LangTag,
    /// Transient: true while a worker holds the call.
    #[serde(default)]
    pub in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_uri: Option<String>,
    /// Fingerprints of inbound events already applied to this document.
    #[serde(default)]
    pub processed_events: BTreeSet<String>,
}

impl Call {
    pub fn new(initiate: InitiateBlock) -> Self {
        let now = Utc::now();
        let lang = initiate.lang_default.clone();
        Self {
            call_id: CallId::new(),
            created_at: now,
            updated_at: now,
            version: 0,
            initiate,
            messages: Vec::new(),
            claim: BTreeMap::new(),
            reminders: Vec::new(),
            next: None,
            synthesis: None,
            lang_current_short_code: lang,
            in_progress: false,
            recording_uri: None,
            processed_events: BTreeSet::new(),
        }
    }

    pub fn caller_phone(&self) -> &PhoneNumber {
        &self.initiate.caller_phone_number
    }

    /// Append a message. Non-assistant personas are append-only; assistant
    /// turns go through [`Call::rewrite_trailing_assistant`] for amendment.
    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    /// Rewrite the trailing assistant message while its turn is still being
    /// composed. Errors if the last message is not an assistant turn.
    pub fn rewrite_trailing_assistant(
        &mut self,
        content: String,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Result<()> {
        match self.messages.last_mut() {
            Some(last) if last.persona == Persona::Assistant => {
                last.content = content;
                last.tool_calls = tool_calls;
                self.touch();
                Ok(())
            }
            _ => Err(StoreError::Invalid(
                "no trailing assistant message to amend".to_string(),
            )),
        }
    }

    /// The declared schema entry for `field`, if any.
    pub fn claim_field(&self, field: &str) -> Option<&ClaimField> {
        self.initiate.claim_schema.iter().find(|f| f.name == field)
    }

    /// Validate and set one claim value. The field must be declared in the
    /// schema and the value must pass its type check; nothing is mutated
    /// otherwise.
    pub fn set_claim_field(&mut self, field: &str, value: &str) -> Result<()> {
        let schema = self.claim_field(field).ok_or_else(|| {
            StoreError::Invalid(format!("field '{field}' is not in the claim schema"))
        })?;
        let canonical = schema
            .field_type
            .validate(value)
            .map_err(StoreError::Invalid)?;
        self.claim.insert(field.to_string(), canonical);
        self.touch();
        Ok(())
    }

    pub fn add_reminder(&mut self, reminder: Reminder) {
        self.reminders.push(reminder);
        self.touch();
    }

    /// Patch an existing reminder in place. Reminders are append-only as a
    /// list; individual entries may be corrected by index.
    pub fn update_reminder(
        &mut self,
        index: usize,
        title: Option<String>,
        description: Option<String>,
        due_at: Option<DateTime<Utc>>,
        owner: Option<ReminderOwner>,
    ) -> Result<()> {
        let reminder = self.reminders.get_mut(index).ok_or_else(|| {
            StoreError::Invalid(format!("no reminder at index {index}"))
        })?;
        if let Some(t) = title {
            reminder.title = t;
        }
        if let Some(d) = description {
            reminder.description = d;
        }
        if let Some(at) = due_at {
            reminder.due_at = at;
        }
        if let Some(o) = owner {
            reminder.owner = o;
        }
        self.touch();
        Ok(())
    }

    /// Switch the active language. Must be one of `languages_available`.
    pub fn set_language(&mut self, lang: LangTag) -> Result<()> {
        if !self.initiate.languages_available.contains(&lang) {
            return Err(StoreError::Invalid(format!(
                "language '{lang}' is not available for this call"
            )));
        }
        self.lang_current_short_code = lang;
        self.touch();
        Ok(())
    }

    /// Set the terminal disposition. Allowed exactly once.
    pub fn set_next(&mut self, next: NextStep) -> Result<()> {
        if self.next.is_some() {
            return Err(StoreError::Invalid("next is already set".to_string()));
        }
        self.next = Some(next);
        self.touch();
        Ok(())
    }

    /// Set the post-call synthesis. Allowed exactly once.
    pub fn set_synthesis(&mut self, synthesis: Synthesis) -> Result<()> {
        if self.synthesis.is_some() {
            return Err(StoreError::Invalid("synthesis is already set".to_string()));
        }
        self.synthesis = Some(synthesis);
        self.touch();
        Ok(())
    }

    /// Record an inbound event fingerprint. Returns `false` when the event
    /// was already applied (the caller must drop the redelivery).
    pub fn record_event(&mut self, fingerprint: &EventFingerprint) -> bool {
        let fresh = self.processed_events.insert(fingerprint.as_str().to_string());
        if fresh {
            self.touch();
        }
        fresh
    }

    /// Bump `updated_at`, keeping it monotonically non-decreasing.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn schema() -> Vec<ClaimField> {
        vec![
            ClaimField {
                name: "policy_number".to_string(),
                field_type: ClaimFieldType::Text,
                description: Some("Policy reference".to_string()),
            },
            ClaimField {
                name: "contact_email".to_string(),
                field_type: ClaimFieldType::Email,
                description: None,
            },
            ClaimField {
                name: "incident_at".to_string(),
                field_type: ClaimFieldType::Datetime,
                description: None,
            },
            ClaimField {
                name: "policyholder_phone".to_string(),
                field_type: ClaimFieldType::PhoneNumber,
                description: None,
            },
        ]
    }

    pub(crate) fn sample_call() -> Call {
        Call::new(InitiateBlock {
            bot_name: "Emma".to_string(),
            bot_company: "Contoso Assurance".to_string(),
            agent_phone_number: "+33100000000".to_string(),
            caller_phone_number: PhoneNumber::parse("+33612345678").unwrap(),
            lang_default: LangTag::new("fr-FR"),
            languages_available: vec![LangTag::new("fr-FR"), LangTag::new("en-US")],
            task_description: "File an insurance claim".to_string(),
            claim_schema: schema(),
            prompts_overrides: None,
        })
    }

    #[test]
    fn claim_field_validation() {
        let mut call = sample_call();
        call.set_claim_field("policy_number", "B01371946").unwrap();
        assert_eq!(call.claim["policy_number"], "B01371946");

        call.set_claim_field("contact_email", "Jean.Dupont@Example.com")
            .unwrap();
        assert_eq!(call.claim["contact_email"], "jean.dupont@example.com");

        call.set_claim_field("policyholder_phone", "+33612345678")
            .unwrap();

        assert!(call.set_claim_field("contact_email", "not-an-email").is_err());
        assert!(call.set_claim_field("incident_at", "yesterday").is_err());
        assert!(call.set_claim_field("unknown_field", "x").is_err());
        // failed validations must not mutate the claim
        assert_eq!(call.claim.len(), 3);
    }

    #[test]
    fn datetime_canonicalised_to_utc() {
        let mut call = sample_call();
        call.set_claim_field("incident_at", "2026-07-12T10:30:00+02:00")
            .unwrap();
        assert_eq!(call.claim["incident_at"], "2026-07-12T08:30:00+00:00");
    }

    #[test]
    fn trailing_assistant_amendment() {
        let mut call = sample_call();
        call.append_message(Message::human("bonjour"));
        assert!(call
            .rewrite_trailing_assistant("x".to_string(), Vec::new())
            .is_err());

        call.append_message(Message::assistant("Bonj", Style::Cheerful));
        call.rewrite_trailing_assistant("Bonjour, je vous écoute.".to_string(), Vec::new())
            .unwrap();
        assert_eq!(call.messages.last().unwrap().content, "Bonjour, je vous écoute.");
        assert_eq!(call.messages.len(), 2);
    }

    #[test]
    fn language_must_be_available() {
        let mut call = sample_call();
        call.set_language(LangTag::new("en-US")).unwrap();
        assert!(call.set_language(LangTag::new("de-DE")).is_err());
        assert_eq!(call.lang_current_short_code, LangTag::new("en-US"));
    }

    #[test]
    fn next_and_synthesis_set_once() {
        let mut call = sample_call();
        call.set_next(NextStep {
            action: NextAction::CaseClosed,
            justification: "claim completed".to_string(),
        })
        .unwrap();
        assert!(call
            .set_next(NextStep {
                action: NextAction::CallBack,
                justification: "again".to_string(),
            })
            .is_err());

        call.set_synthesis(Synthesis {
            short: "ok".to_string(),
            long: "all good".to_string(),
            satisfaction: Satisfaction::High,
            improvement_suggestions: String::new(),
        })
        .unwrap();
        assert!(call
            .set_synthesis(Synthesis {
                short: String::new(),
                long: String::new(),
                satisfaction: Satisfaction::Unknown,
                improvement_suggestions: String::new(),
            })
            .is_err());
    }

    #[test]
    fn event_fingerprints_deduplicate() {
        let mut call = sample_call();
        let fp = EventFingerprint::new(&call.call_id, "evt-1");
        assert!(call.record_event(&fp));
        assert!(!call.record_event(&fp));
    }

    #[test]
    fn updated_at_monotonic() {
        let mut call = sample_call();
        let before = call.updated_at;
        call.touch();
        assert!(call.updated_at >= before);
    }

    #[test]
    fn round_trips_through_json() {
        let mut call = sample_call();
        call.append_message(Message::human("je veux déclarer un sinistre"));
        call.set_claim_field("policy_number", "B01371946").unwrap();
        let json = serde_json::to_string(&call).unwrap();
        let back: Call = serde_json::from_str(&json).unwrap();
        assert_eq!(back.call_id, call.call_id);
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.claim["policy_number"], "B01371946");
    }
}
