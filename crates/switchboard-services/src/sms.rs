use async_trait::async_trait;
use serde::Deserialize;

use switchboard_core::config::EndpointConfig;
use switchboard_core::types::PhoneNumber;

use crate::http::post_json;
use crate::Result;

/// Outbound SMS delivery (report links, confirmations).
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &PhoneNumber, body: &str) -> Result<()>;
}

pub struct HttpSmsSender {
    client: reqwest::Client,
    cfg: EndpointConfig,
}

impl HttpSmsSender {
    pub fn new(cfg: EndpointConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct SendAck {
    id: Option<String>,
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    async fn send(&self, to: &PhoneNumber, body: &str) -> Result<()> {
        let payload = serde_json::json!({
            "to": to.as_str(),
            "body": body,
        });
        let _: SendAck = post_json(&self.client, &self.cfg, &payload).await?;
        Ok(())
    }
}
