use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use silo_core::daemon::ClusterMetaBundle;
use silo_core::election;
use silo_core::error::ControlError;
use silo_core::keepalive::KaSignal;
use silo_core::node::NodeId;
use silo_core::revision::{ActionMsg, RevisionEnvelope};
use tracing::info;

use crate::api::{ApiError, ApiState};

/// GET /v1/health: readiness of this daemon.
pub async fn health(State(state): State<ApiState>) -> Response {
    if state.core.node_started() {
        StatusCode::OK.into_response()
    } else {
        // Still starting up; keepalive probes treat this as not-yet-failed.
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// GET /v1/daemon?what={snode,smap,config}
pub async fn daemon_get(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    match params.get("what").map(String::as_str) {
        Some("snode") => Ok(Json(&state.core.si).into_response()),
        Some("smap") | None => Ok(Json(&*state.core.smap()).into_response()),
        Some("config") => Ok(Json(&*state.core.owners.config.get()).into_response()),
        Some(other) => Err(ControlError::InvalidDescriptor(format!(
            "unknown query {other:?}"
        ))
        .into()),
    }
}

/// PUT /v1/daemon/admin-join, the handshake target: install the primary's
/// metadata bundle (the map follows via metasync) and acknowledge.
pub async fn admin_join_handshake(
    State(state): State<ApiState>,
    Json(meta): Json<ClusterMetaBundle>,
) -> Result<Response, ApiError> {
    state.core.install_meta(meta)?;
    info!("{}: installed cluster meta via admin-join handshake", state.core.si);
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, serde::Deserialize)]
pub struct PhaseQuery {
    prepare: bool,
}

/// PUT /v1/daemon/proxy/{id}?prepare={true,false}: two-phase primary
/// transition receiver. The prepare body carries cluster metadata.
pub async fn set_primary_phase(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<PhaseQuery>,
    body: Option<Json<ClusterMetaBundle>>,
) -> Result<Response, ApiError> {
    let candidate = NodeId::from(id.as_str());
    election::receive_set_primary(
        &state.core,
        &candidate,
        query.prepare,
        body.map(|Json(meta)| meta),
    )
    .await?;
    Ok(StatusCode::OK.into_response())
}

/// DELETE /v1/daemon/rm-self: the primary asks this node to leave.
pub async fn rm_self(
    State(state): State<ApiState>,
    Json(msg): Json<ActionMsg>,
) -> Response {
    info!("{}: asked to remove self ({:?})", state.core.si, msg.action);
    let keepaliver = state.keepaliver.clone();
    let core = state.core.clone();
    tokio::spawn(async move {
        keepaliver.send(KaSignal::Stop).await;
        core.stop();
    });
    StatusCode::OK.into_response()
}

/// PUT /v1/metasync: installs a revision batch from the primary.
pub async fn metasync_receive(
    State(state): State<ApiState>,
    Json(envelopes): Json<Vec<RevisionEnvelope>>,
) -> Result<Response, ApiError> {
    state.core.receive_batch(envelopes)?;
    Ok(StatusCode::OK.into_response())
}
