use async_trait::async_trait;
use serde::Deserialize;

use switchboard_core::config::EndpointConfig;
use switchboard_core::types::LangTag;

use crate::http::post_json;
use crate::Result;

/// Translates assistant sentences from the pivot language into the
/// caller's language before synthesis.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: Option<&LangTag>,
        target: &LangTag,
    ) -> Result<String>;
}

pub struct HttpTranslator {
    client: reqwest::Client,
    cfg: EndpointConfig,
}

impl HttpTranslator {
    pub fn new(cfg: EndpointConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }
}

#[derive(Deserialize)]
struct TranslateResponse {
    text: String,
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source: Option<&LangTag>,
        target: &LangTag,
    ) -> Result<String> {
        let body = serde_json::json!({
            "text": text,
            "source_lang": source.map(|l| l.as_str()),
            "target_lang": target.as_str(),
        });
        let resp: TranslateResponse = post_json(&self.client, &self.cfg, &body).await?;
        Ok(resp.text)
    }
}
