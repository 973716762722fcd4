//! Admin HTTP surface
//!
//! A small JSON API over [`TunnelService`] for listing tunnels and driving
//! binds by hand.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use tunnelmux_common::Error;

use crate::service::TunnelService;
use crate::tunnel::TunnelInfo;

/// Body of `POST /tunnels/{id}/bind`
#[derive(Debug, Deserialize)]
pub struct BindRequest {
    /// Node to bind the tunnel to
    pub node_id: u32,
    /// User performing the bind, recorded in the audit log
    #[serde(default)]
    pub user_id: u32,
}

/// Body of `POST /nodes/{id}/unbind`
#[derive(Debug, Deserialize)]
pub struct UnbindRequest {
    /// User performing the unbind, recorded in the audit log
    #[serde(default)]
    pub user_id: u32,
}

/// Tunnel error rendered as an HTTP response
#[derive(Debug)]
pub struct AdminError(Error);

impl From<Error> for AdminError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidArgument { not_found: true, .. } => StatusCode::NOT_FOUND,
            Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Error::OutOfState { .. } => StatusCode::CONFLICT,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::AgentError { .. } => StatusCode::BAD_GATEWAY,
            Error::Shutdown { .. } => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Admin request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "rcc": self.0.rcc(),
        });
        (status, Json(body)).into_response()
    }
}

/// Routes for the admin API
pub fn admin_router(service: Arc<TunnelService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tunnels", get(list_tunnels))
        .route("/tunnels/{tunnel_id}/bind", post(bind_tunnel))
        .route("/nodes/{node_id}/unbind", post(unbind_node))
        .with_state(service)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_tunnels(State(service): State<Arc<TunnelService>>) -> Json<Vec<TunnelInfo>> {
    Json(service.list_tunnels())
}

async fn bind_tunnel(
    State(service): State<Arc<TunnelService>>,
    Path(tunnel_id): Path<u32>,
    Json(request): Json<BindRequest>,
) -> Result<StatusCode, AdminError> {
    service
        .bind_tunnel(tunnel_id, request.node_id, request.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unbind_node(
    State(service): State<Arc<TunnelService>>,
    Path(node_id): Path<u32>,
    Json(request): Json<UnbindRequest>,
) -> Result<StatusCode, AdminError> {
    service.unbind_node(node_id, request.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
