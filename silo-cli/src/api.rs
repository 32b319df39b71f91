use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use serde_json::json;
use silo_core::error::ControlError;
use silo_core::keepalive::Keepaliver;
use silo_core::daemon::ControlPlane;

use crate::http;

/// Shared state behind every control-plane handler.
#[derive(Clone)]
pub struct ApiState {
    /// The daemon's control plane.
    pub core: Arc<ControlPlane>,
    /// The daemon's keepaliver (role-appropriate variant).
    pub keepaliver: Arc<Keepaliver>,
}

/// HTTP-facing error wrapper translating the core taxonomy into statuses
/// and a JSON error envelope.
#[derive(Debug)]
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = &self.0;
        let (status, code) = match err {
            ControlError::NotPrimary { .. } => (StatusCode::CONFLICT, "not-primary"),
            ControlError::ClusterIntegrity { .. } => (StatusCode::CONFLICT, "cluster-integrity"),
            ControlError::DuplicateDaemonId { .. } => (StatusCode::CONFLICT, "duplicate-daemon-id"),
            ControlError::NodeNotFound { .. } => (StatusCode::NOT_FOUND, "node-not-found"),
            ControlError::PrimaryNotReady { .. } | ControlError::Stopping => {
                (StatusCode::SERVICE_UNAVAILABLE, "primary-not-ready")
            }
            ControlError::RebalanceDisabled => {
                (StatusCode::SERVICE_UNAVAILABLE, "rebalance-disabled")
            }
            ControlError::Unreachable { .. } | ControlError::Transport(_) => {
                (StatusCode::BAD_GATEWAY, "unreachable")
            }
            ControlError::CommitFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "commit-failed")
            }
            ControlError::InvalidDescriptor(_)
            | ControlError::Serialization(_)
            | ControlError::NotEnoughTargets { .. } => (StatusCode::BAD_REQUEST, "invalid-request"),
        };
        let mut body = json!({
            "error": {
                "code": code,
                "message": err.to_string(),
            }
        });
        if let ControlError::NotPrimary {
            primary: Some(primary),
            ..
        } = err
        {
            body["error"]["primary"] = json!(primary.as_str());
        }
        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            if let Ok(value) = "2".parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Builds the full control-plane router served on the public and
/// intra-control listeners.
pub fn create_control_routes() -> Router<ApiState> {
    Router::new()
        .route("/v1/health", get(http::daemon::health))
        .route("/v1/cluster", get(http::cluster::cluster_get))
        .route("/v1/cluster", put(http::cluster::cluster_put))
        .route("/v1/cluster/self-join", post(http::cluster::self_join))
        .route("/v1/cluster/admin-join", post(http::cluster::admin_join))
        .route("/v1/cluster/keepalive", post(http::cluster::keepalive))
        .route("/v1/cluster/daemon/{id}", delete(http::cluster::remove_daemon))
        .route("/v1/daemon", get(http::daemon::daemon_get))
        .route("/v1/daemon/admin-join", put(http::daemon::admin_join_handshake))
        .route("/v1/daemon/proxy/{id}", put(http::daemon::set_primary_phase))
        .route("/v1/daemon/rm-self", delete(http::daemon::rm_self))
        .route("/v1/metasync", put(http::daemon::metasync_receive))
        .route("/v1/notifs/{kind}", post(http::notifs::receive))
}
