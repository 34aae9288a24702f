use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use switchboard_core::config::SwitchboardConfig;
use switchboard_queue::WorkQueue;
use switchboard_store::CallStore;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: SwitchboardConfig,
    pub store: Arc<CallStore>,
    pub queue: Arc<WorkQueue>,
}

impl AppState {
    pub fn new(config: SwitchboardConfig, store: Arc<CallStore>, queue: Arc<WorkQueue>) -> Self {
        Self {
            config,
            store,
            queue,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/call",
            post(crate::http::call::create_call_handler)
                .get(crate::http::call::list_calls_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
