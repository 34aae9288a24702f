use async_trait::async_trait;
use serde::Deserialize;

use switchboard_core::config::EndpointConfig;

use crate::http::post_json;
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub snippet: String,
    pub score: f64,
    #[serde(default)]
    pub source: Option<String>,
}

/// Vector search over the document corpus; hits are injected into the
/// next completion as a system note.
#[async_trait]
pub trait DocumentSearch: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;
}

pub struct HttpDocumentSearch {
    client: reqwest::Client,
    cfg: EndpointConfig,
}

impl HttpDocumentSearch {
    pub fn new(cfg: EndpointConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

#[async_trait]
impl DocumentSearch for HttpDocumentSearch {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let body = serde_json::json!({
            "query": query,
            "k": k,
        });
        let resp: SearchResponse = post_json(&self.client, &self.cfg, &body).await?;
        Ok(resp.hits)
    }
}
