//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;

use crate::admission::SessionInfo;
use crate::health::Health;
use crate::service::{HealthSnapshot, StreamService};
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub sessions: Vec<SessionInfo>,
    pub version: VersionInfo,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.state,
            active_sessions: snapshot.active_sessions,
            max_sessions: snapshot.max_sessions,
            sessions: snapshot.sessions,
            version: snapshot.version,
        }
    }
}

async fn health_check(State(service): State<Arc<StreamService>>) -> Json<HealthCheckResponse> {
    Json(service.health().into())
}

/// Admission happens before the upgrade: a refused client gets an empty 503 and
/// never sees a handshake.
async fn stream(
    State(service): State<Arc<StreamService>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let permit = match service.admit() {
        Ok(permit) => permit,
        Err(e) => {
            tracing::info!(error = %e, "Refusing stream");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = super::split(socket);
        if let Err(e) = service.run_session(permit, sink, stream).await {
            tracing::debug!(error = %e, "WebSocket session ended with error");
        }
    })
}

async fn shutdown(State(service): State<Arc<StreamService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<StreamService>) -> Router {
    Router::new()
        .route("/ws", get(stream))
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
