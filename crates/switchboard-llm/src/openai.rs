use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use switchboard_core::cancel::CancelScope;
use switchboard_core::config::ModelTierConfig;

use crate::provider::{
    CompletionRequest, LlmProvider, ProviderError, Role, ToolInvocation,
};
use crate::repair::parse_or_repair;
use crate::stream::{parse_sse_line, CompletionEvent, SseParsed};

/// Streaming client for an OpenAI-compatible chat-completions endpoint.
/// One instance per model tier.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    provider_name: String,
    api_key: String,
    base_url: String,
    chat_path: String,
    model: String,
    default_max_tokens: u32,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, tier: &ModelTierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider_name: name.into(),
            api_key: tier.api_key.clone(),
            base_url: tier.endpoint.trim_end_matches('/').to_string(),
            chat_path: "/v1/chat/completions".to_string(),
            model: tier.model.clone(),
            default_max_tokens: tier.max_tokens,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete_stream(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<CompletionEvent>,
        cancel: &CancelScope,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, &self.model, self.default_max_tokens);
        let url = format!("{}{}", self.base_url, self.chat_path);

        debug!(model = %self.model, "sending streaming completion request");

        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send();
        let resp = match cancel.run(send).await {
            Some(resp) => resp?,
            None => return Err(ProviderError::Cancelled),
        };

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "streaming API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        process_stream(resp, tx, cancel).await
    }
}

fn build_request_body(
    req: &CompletionRequest,
    model: &str,
    default_max_tokens: u32,
) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(message_to_json).collect();

    let max_tokens = if req.max_tokens > 0 {
        req.max_tokens
    } else {
        default_max_tokens
    };

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
        "stream": true,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    body
}

fn message_to_json(m: &crate::provider::ChatMessage) -> serde_json::Value {
    match m.role {
        Role::Assistant if !m.tool_calls.is_empty() => {
            let calls: Vec<serde_json::Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(m.content)
            };
            serde_json::json!({
                "role": "assistant",
                "content": content,
                "tool_calls": calls,
            })
        }
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.as_deref().unwrap_or("call_0"),
            "content": m.content,
        }),
        _ => serde_json::json!({
            "role": m.role,
            "content": m.content,
        }),
    }
}

/// Consume the SSE byte stream, reassemble lines, and feed them through a
/// [`StreamState`]. Stops within one chunk of `cancel` firing — the
/// response is dropped, which closes the connection.
async fn process_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<CompletionEvent>,
    cancel: &CancelScope,
) -> Result<(), ProviderError> {
    use futures_util::StreamExt;

    let mut state = StreamState::default();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            chunk = byte_stream.next() => chunk,
            _ = cancel.cancelled() => {
                debug!("completion stream cancelled");
                return Err(ProviderError::Cancelled);
            }
        };
        let chunk = match chunk {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                let _ = tx
                    .send(CompletionEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return Err(ProviderError::Http(e));
            }
            None => break,
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(SseParsed::Data(data)) = parse_sse_line(line) {
                for event in state.on_data(&data) {
                    if tx.send(event).await.is_err() {
                        return Ok(()); // receiver dropped
                    }
                }
            }
        }

        line_buf = remainder;
    }

    if !state.produced_output() {
        return Err(ProviderError::Empty);
    }
    for event in state.finish() {
        let _ = tx.send(event).await;
    }
    Ok(())
}

/// Accumulates per-index tool-call deltas and yields complete events.
/// Kept free of I/O so the chunk grammar is testable in isolation.
#[derive(Default)]
struct StreamState {
    pending_calls: Vec<PendingToolCall>,
    finish_reason: String,
    saw_text: bool,
    done_emitted: bool,
}

#[derive(Default)]
struct PendingToolCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

impl StreamState {
    /// Process one SSE data payload, returning the events it completes.
    fn on_data(&mut self, data: &str) -> Vec<CompletionEvent> {
        if data.trim() == "[DONE]" {
            return self.finish();
        }
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut events = Vec::new();
        for choice in &chunk.choices {
            if let Some(reason) = &choice.finish_reason {
                if !reason.is_empty() {
                    self.finish_reason = reason.clone();
                }
            }
            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    self.saw_text = true;
                    events.push(CompletionEvent::TextDelta {
                        text: content.clone(),
                    });
                }
            }
            for delta in choice.delta.tool_calls.iter().flatten() {
                let slot = match self
                    .pending_calls
                    .iter_mut()
                    .find(|c| c.index == delta.index)
                {
                    Some(slot) => slot,
                    None => {
                        self.pending_calls.push(PendingToolCall {
                            index: delta.index,
                            ..Default::default()
                        });
                        self.pending_calls.last_mut().unwrap()
                    }
                };
                if let Some(id) = &delta.id {
                    slot.id = id.clone();
                }
                if let Some(f) = &delta.function {
                    if let Some(name) = &f.name {
                        slot.name.push_str(name);
                    }
                    if let Some(args) = &f.arguments {
                        slot.arguments.push_str(args);
                    }
                }
            }
        }
        events
    }

    /// Flush accumulated tool calls (through repair) and emit Done once.
    fn finish(&mut self) -> Vec<CompletionEvent> {
        if self.done_emitted {
            return Vec::new();
        }
        self.done_emitted = true;

        let mut events = Vec::new();
        for call in self.pending_calls.drain(..) {
            let id = if call.id.is_empty() {
                format!("call_{}", call.index)
            } else {
                call.id
            };
            match parse_or_repair(&call.arguments) {
                Some(arguments) => events.push(CompletionEvent::ToolCall(ToolInvocation {
                    id,
                    name: call.name,
                    arguments,
                })),
                None => {
                    warn!(name = %call.name, "tool-call arguments unrepairable");
                    events.push(CompletionEvent::ToolCallInvalid {
                        id,
                        name: call.name,
                        raw_arguments: call.arguments,
                    });
                }
            }
        }
        events.push(CompletionEvent::Done {
            finish_reason: std::mem::take(&mut self.finish_reason),
        });
        events
    }

    fn produced_output(&self) -> bool {
        self.saw_text || self.done_emitted || !self.pending_calls.is_empty()
    }
}

// Streaming chunk wire types.

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
