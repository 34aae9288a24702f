use serde::de::DeserializeOwned;
use tracing::warn;

use switchboard_core::config::EndpointConfig;
use switchboard_core::retry::Backoff;

use crate::{Result, ServiceError};

/// POST a JSON body and decode a JSON response, retrying transient
/// failures with the standard remote backoff. Terminal failures (4xx,
/// undecodable bodies) are returned immediately.
pub(crate) async fn post_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    cfg: &EndpointConfig,
    body: &serde_json::Value,
) -> Result<T> {
    let mut backoff = Backoff::remote();
    loop {
        match post_once(client, cfg, body).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(err = %e, "service request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

async fn post_once<T: DeserializeOwned>(
    client: &reqwest::Client,
    cfg: &EndpointConfig,
    body: &serde_json::Value,
) -> Result<T> {
    let mut req = client.post(&cfg.endpoint).json(body);
    if let Some(key) = &cfg.api_key {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(ServiceError::Api { status, message });
    }
    resp.json::<T>()
        .await
        .map_err(|e| ServiceError::Parse(e.to_string()))
}
