//! The call API: create an outbound-dial Call and inspect recent ones.
//!
//! Request:  `POST /call` with `{"phone_number": "+33612345678", "claim": [...]}`
//! Response: `{"call_id": "..."}`
//! Read:     `GET /call?phone_number=%2B33612345678`

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use switchboard_core::types::{LangTag, PhoneNumber};
use switchboard_queue::{CallEvent, QueueName};
use switchboard_store::{Call, ClaimField, InitiateBlock};

use crate::app::AppState;

#[derive(Deserialize)]
pub struct CreateCallRequest {
    pub phone_number: String,
    #[serde(default)]
    pub bot_company: Option<String>,
    #[serde(default)]
    pub bot_name: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub agent_phone_number: Option<String>,
    pub claim: Vec<ClaimField>,
    #[serde(default)]
    pub lang: Option<String>,
}

#[derive(Serialize)]
pub struct CreateCallReply {
    pub call_id: String,
}

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
}

type Rejection = (StatusCode, Json<ApiError>);

fn bad_request(message: impl Into<String>) -> Rejection {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

fn internal(message: impl Into<String>) -> Rejection {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

/// POST /call: create a Call for outbound dialing and enqueue the
/// trigger event a worker will pick up.
pub async fn create_call_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCallRequest>,
) -> Result<Json<CreateCallReply>, Rejection> {
    let phone = PhoneNumber::parse(&req.phone_number).map_err(bad_request)?;
    if req.claim.is_empty() {
        return Err(bad_request("'claim' must declare at least one field"));
    }

    let defaults = &state.config.conversation;
    let lang = req.lang.unwrap_or_else(|| defaults.default_lang.clone());
    if !defaults.languages_available.contains(&lang) {
        return Err(bad_request(format!("language '{lang}' is not available")));
    }

    let initiate = InitiateBlock {
        bot_name: req.bot_name.unwrap_or_else(|| defaults.bot_name.clone()),
        bot_company: req
            .bot_company
            .unwrap_or_else(|| defaults.bot_company.clone()),
        agent_phone_number: req
            .agent_phone_number
            .unwrap_or_else(|| defaults.agent_phone_number.clone()),
        caller_phone_number: phone.clone(),
        lang_default: LangTag::new(&lang),
        languages_available: defaults
            .languages_available
            .iter()
            .map(|l| LangTag::new(l))
            .collect(),
        task_description: req
            .task
            .unwrap_or_else(|| "Assist the caller with their request".to_string()),
        claim_schema: req.claim,
        prompts_overrides: None,
    };

    let call = Call::new(initiate);
    let call_id = call.call_id.to_string();
    state
        .store
        .create(&call)
        .map_err(|e| internal(e.to_string()))?;

    state
        .queue
        .enqueue(
            QueueName::CallEvents,
            &CallEvent::IncomingCall {
                caller_phone: phone.to_string(),
                callee_phone: call.initiate.agent_phone_number.clone(),
                correlation_id: Uuid::new_v4().to_string(),
            },
        )
        .map_err(|e| {
            warn!(err = %e, "outbound call enqueue failed");
            internal(e.to_string())
        })?;

    info!(%call_id, phone = %phone, "outbound call created");
    Ok(Json(CreateCallReply { call_id }))
}

#[derive(Deserialize)]
pub struct ListCallsQuery {
    pub phone_number: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// GET /call?phone_number=E164: recent Calls, newest first. Thin read
/// path; may lag the live document by the store's replication bound.
pub async fn list_calls_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListCallsQuery>,
) -> Result<Json<Vec<Call>>, Rejection> {
    let phone = PhoneNumber::parse(&query.phone_number).map_err(bad_request)?;
    let calls = state
        .store
        .list_by_phone(&phone, query.limit.min(100))
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(calls))
}
