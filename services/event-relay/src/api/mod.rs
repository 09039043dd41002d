//! HTTP surface: health probes only.

mod health;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::bridge::EventBridge;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    bridge: Arc<EventBridge>,
}

impl AppState {
    pub fn new(bridge: Arc<EventBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.bridge
    }
}

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
