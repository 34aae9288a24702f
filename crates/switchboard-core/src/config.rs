use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Operational constants shared across crates.
pub const DEFAULT_PORT: u16 = 18920;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Call lease TTL (seconds). Renewal runs at half this interval.
pub const CALL_LEASE_TTL_SECS: u64 = 60;
/// Per-phone claim-schema lease TTL (seconds).
pub const SCHEMA_LEASE_TTL_SECS: u64 = 300;
/// Queue visibility timeout (seconds) — upper bound on handling a message
/// between extensions.
pub const VISIBILITY_TIMEOUT_SECS: u64 = 30;
/// Sentence buffer flush threshold (characters) when no terminator arrives.
pub const MAX_SENTENCE_CHARS: usize = 120;
/// Backpressure bound on the sentence channel into TTS.
pub const MAX_BUFFERED_SENTENCES: usize = 8;

/// Top-level config (switchboard.toml + SWITCHBOARD_* env overrides,
/// nested keys separated by `__`, e.g. SWITCHBOARD_LLM__FAST__ENDPOINT).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Two model tiers: `fast` answers conversational turns, `slow` is the
/// higher-quality fallback (and the default when `slow_llm_for_chat` is on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub fast: ModelTierConfig,
    pub slow: ModelTierConfig,
    /// Attempts per tier before falling back to the other one.
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTierConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Approximate context budget in characters for history truncation.
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// STT streaming endpoint (NDJSON recognition events).
    pub stt_endpoint: String,
    /// TTS synthesis endpoint.
    pub tts_endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Maps the assistant's emotional style to a provider voice variant.
    /// Keys: "none", "cheerful", "sad".
    #[serde(default)]
    pub voice_styles: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServicesConfig {
    pub translate: Option<EndpointConfig>,
    pub safety: Option<EndpointConfig>,
    pub search: Option<EndpointConfig>,
    pub sms: Option<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Defaults applied to calls whose initiate block leaves fields unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default = "default_bot_company")]
    pub bot_company: String,
    #[serde(default = "default_agent_phone")]
    pub agent_phone_number: String,
    /// Language the LLM prompts are authored in. Replies are translated to
    /// the caller's language before TTS when they differ.
    #[serde(default = "default_pivot_lang")]
    pub pivot_lang: String,
    #[serde(default = "default_lang")]
    pub default_lang: String,
    #[serde(default = "default_languages")]
    pub languages_available: Vec<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            bot_company: default_bot_company(),
            agent_phone_number: default_agent_phone(),
            pivot_lang: default_pivot_lang(),
            default_lang: default_lang(),
            languages_available: default_languages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent calls handled by this process.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Seconds in-flight calls get to reach Closed on graceful shutdown.
    #[serde(default = "default_drain_deadline")]
    pub drain_deadline_secs: u64,
    /// Queue long-poll interval in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            drain_deadline_secs: default_drain_deadline(),
            poll_interval_ms: default_poll_ms(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.switchboard/switchboard.db", home)
}
fn default_llm_retries() -> u32 {
    3
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_context_chars() -> usize {
    24_000
}
fn default_voice() -> String {
    "neutral-1".to_string()
}
fn default_bot_name() -> String {
    "Emma".to_string()
}
fn default_bot_company() -> String {
    "Switchboard".to_string()
}
fn default_agent_phone() -> String {
    "+33100000000".to_string()
}
fn default_pivot_lang() -> String {
    "en-US".to_string()
}
fn default_lang() -> String {
    "fr-FR".to_string()
}
fn default_languages() -> Vec<String> {
    vec!["fr-FR".to_string(), "en-US".to_string()]
}
fn default_pool_size() -> usize {
    4
}
fn default_drain_deadline() -> u64 {
    60
}
fn default_poll_ms() -> u64 {
    500
}

impl SwitchboardConfig {
    /// Load config from a TOML file with SWITCHBOARD_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SwitchboardConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SWITCHBOARD_").split("__"))
            .extract()
            .map_err(|e| crate::error::SwitchboardError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.switchboard/switchboard.toml", home)
}
