use async_trait::async_trait;
use serde::Deserialize;

use switchboard_core::config::EndpointConfig;

use crate::http::post_json;
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub categories_matched: Vec<String>,
}

/// Screens each sentence before it reaches the synthesizer. A blocked
/// sentence is dropped; the turn continues.
#[async_trait]
pub trait ContentSafety: Send + Sync {
    async fn check(&self, text: &str, categories: &[String]) -> Result<SafetyVerdict>;
}

pub struct HttpContentSafety {
    client: reqwest::Client,
    cfg: EndpointConfig,
}

impl HttpContentSafety {
    pub fn new(cfg: EndpointConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }
}

#[async_trait]
impl ContentSafety for HttpContentSafety {
    async fn check(&self, text: &str, categories: &[String]) -> Result<SafetyVerdict> {
        let body = serde_json::json!({
            "text": text,
            "categories": categories,
        });
        post_json(&self.client, &self.cfg, &body).await
    }
}
