//! Health check endpoints.
//!
//! Liveness only says the process is up. Readiness requires the bridge to be
//! running with both connections healthy.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use super::AppState;
use crate::state::{BridgeState, ConnectionState};
use crate::stats::RelayStatsSnapshot;

const SERVICE: &str = "event-relay";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RelayStatsSnapshot>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub relay: BridgeState,
    pub notification_source: ConnectionState,
    pub message_bus: ConnectionState,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .route("/api/v1/health", get(healthz))
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
        stats: None,
    })
}

/// Returns 503 unless the relay is running with both connections up.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let bridge = state.bridge();
    let ready = bridge.is_ready();

    let response = HealthResponse {
        status: if ready { "ok" } else { "degraded" }.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(ComponentHealth {
            relay: bridge.state(),
            notification_source: bridge.source_state(),
            message_bus: bridge.bus_state(),
        }),
        stats: Some(bridge.stats()),
    };

    if ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::api::create_router;
    use crate::bridge::EventBridge;
    use crate::config::RelayConfig;
    use crate::testing::{RecordingBus, ScriptedSource};

    fn bridge() -> Arc<EventBridge> {
        Arc::new(EventBridge::new(
            RelayConfig::default(),
            Arc::new(ScriptedSource::new()),
            Arc::new(RecordingBus::new()),
        ))
    }

    async fn request(bridge: &Arc<EventBridge>, uri: &str) -> (StatusCode, Vec<u8>) {
        let app = create_router(AppState::new(Arc::clone(bridge)));
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_liveness_does_not_depend_on_bridge() {
        let bridge = bridge();
        for uri in ["/healthz", "/livez", "/api/v1/health"] {
            let (status, _) = request(&bridge, uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_readyz_follows_bridge_lifecycle() {
        let bridge = bridge();

        let (status, body) = request(&bridge, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        let components = health.components.unwrap();
        assert_eq!(components.relay, BridgeState::Uninitialized);
        assert_eq!(components.message_bus, ConnectionState::Disconnected);

        bridge.connect().await.unwrap();
        let (status, body) = request(&bridge, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.stats.unwrap().published, 0);

        bridge.disconnect().await;
        let (status, _) = request(&bridge, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
