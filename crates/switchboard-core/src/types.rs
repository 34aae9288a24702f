use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a call (UUIDv7, time-sortable for log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lease key for exclusive ownership of this call.
    pub fn lease_key(&self) -> String {
        format!("call:{}", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// E.164 phone number. Construction validates shape; the store partitions
/// call documents by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accepts `+` followed by 7–15 digits.
    pub fn parse(s: &str) -> Result<Self, String> {
        let rest = s
            .strip_prefix('+')
            .ok_or_else(|| format!("phone number '{s}' must start with '+'"))?;
        if rest.len() < 7 || rest.len() > 15 || !rest.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("phone number '{s}' is not E.164"));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lease key for the per-phone default claim schema.
    pub fn schema_lease_key(&self) -> String {
        format!("claim_schema:{}", self.0)
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// BCP-47 style language tag, e.g. "fr-FR".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LangTag(pub String);

impl LangTag {
    pub fn new(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Primary subtag ("fr" for "fr-FR"), used to match STT detection
    /// against the configured language list.
    pub fn primary(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for LangTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LangTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Idempotency key for an inbound queue event: `(call_id, event_id)`.
/// The orchestrator records processed fingerprints on the Call and drops
/// redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFingerprint(pub String);

impl EventFingerprint {
    pub fn new(call_id: &CallId, event_id: &str) -> Self {
        Self(format!("{}:{}", call_id, event_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
