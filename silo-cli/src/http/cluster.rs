use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use silo_core::client::{HDR_CALLER_ID, ReqSpec};
use silo_core::config::ConfigUpdate;
use silo_core::daemon::{reset_cluster_config, set_cluster_config};
use silo_core::election;
use silo_core::error::ControlError;
use silo_core::join::{self, JoinOp, JoinRequest};
use silo_core::node::{NodeDescriptor, NodeId};
use silo_core::rebalance;
use silo_core::revision::{Action, ActionMsg};
use tracing::{info, warn};

use crate::api::{ApiError, ApiState};

/// GET /v1/cluster?what={smap,status,config}
pub async fn cluster_get(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    match params.get("what").map(String::as_str) {
        Some("smap") | None => Ok(Json(&*state.core.smap()).into_response()),
        Some("status") => Ok(Json(state.core.notifs.status()).into_response()),
        Some("config") => Ok(Json(&*state.core.owners.config.get()).into_response()),
        Some(other) => Err(ControlError::InvalidDescriptor(format!(
            "unknown query {other:?}"
        ))
        .into()),
    }
}

/// Relays a mutating request to the primary when this proxy is not it.
/// Returns `None` when the request should be handled locally.
async fn forward_to_primary(
    state: &ApiState,
    method: reqwest::Method,
    path_and_query: &str,
    body: Option<serde_json::Value>,
) -> Result<Option<Response>, ApiError> {
    let core = &state.core;
    if core.is_primary() {
        return Ok(None);
    }
    let smap = core.smap();
    let Some(primary) = smap.primary().cloned() else {
        return Err(core.err_not_primary("no primary to forward to").into());
    };
    let timeout = core.config().timeouts.cplane_operation;
    let mut spec = ReqSpec::new(method, path_and_query, timeout);
    spec.body = body;
    info!("forwarding {} {path_and_query} to primary {}", spec.method, primary.id);
    let resp = core.client.call(&primary, &spec).await.map_err(ApiError::from)?;
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok(Some((status, resp.body).into_response()))
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    #[serde(default)]
    non_electable: bool,
}

/// POST /v1/cluster/self-join
pub async fn self_join(
    State(state): State<ApiState>,
    Query(query): Query<JoinQuery>,
    Json(req): Json<JoinRequest>,
) -> Result<Response, ApiError> {
    let path = if query.non_electable {
        "/v1/cluster/self-join?non_electable=true".to_string()
    } else {
        "/v1/cluster/self-join".to_string()
    };
    if let Some(forwarded) = forward_to_primary(
        &state,
        reqwest::Method::POST,
        &path,
        Some(serde_json::to_value(&req).map_err(ControlError::from)?),
    )
    .await?
    {
        return Ok(forwarded);
    }
    let resp = join::handle_join(&state.core, req, JoinOp::SelfJoin, query.non_electable).await?;
    Ok(Json(resp).into_response())
}

/// POST /v1/cluster/admin-join
///
/// The operator supplies the node's endpoints; the canonical descriptor
/// (including its persisted id) is obtained from the node itself before
/// the handshake.
pub async fn admin_join(
    State(state): State<ApiState>,
    Query(query): Query<JoinQuery>,
    Json(mut nsi): Json<NodeDescriptor>,
) -> Result<Response, ApiError> {
    if let Some(forwarded) = forward_to_primary(
        &state,
        reqwest::Method::POST,
        "/v1/cluster/admin-join",
        Some(serde_json::to_value(&nsi).map_err(ControlError::from)?),
    )
    .await?
    {
        return Ok(forwarded);
    }
    let core = &state.core;
    let timeout = core.config().timeouts.cplane_operation;
    let spec = ReqSpec::new(reqwest::Method::GET, "/v1/daemon?what=snode", timeout);
    let resp = core.client.call(&nsi, &spec).await.map_err(|err| {
        ApiError(ControlError::Transport(format!(
            "failed to obtain node info from {nsi}: {err}"
        )))
    })?;
    let reported: NodeDescriptor = resp.json().map_err(ApiError::from)?;
    nsi.id = reported.id;

    let req = JoinRequest {
        si: nsi,
        smap: None,
        reb_interrupted: false,
    };
    let resp = join::handle_join(core, req, JoinOp::AdminJoin, query.non_electable).await?;
    Ok(Json(json!({
        "daemon_id": resp.daemon_id,
        "rebalance_id": resp.rebalance_id,
    }))
    .into_response())
}

/// POST /v1/cluster/keepalive
pub async fn keepalive(
    State(state): State<ApiState>,
    Json(req): Json<JoinRequest>,
) -> Result<Response, ApiError> {
    if let Some(forwarded) = forward_to_primary(
        &state,
        reqwest::Method::POST,
        "/v1/cluster/keepalive",
        Some(serde_json::to_value(&req).map_err(ControlError::from)?),
    )
    .await?
    {
        return Ok(forwarded);
    }
    let id = req.si.id.clone();
    let resp = join::handle_join(&state.core, req, JoinOp::Keepalive, false).await?;
    if !resp.rejoin {
        state.keepaliver.heard_from(&id, resp.updated);
    }
    Ok(Json(resp).into_response())
}

/// Value payload of the node-removal family of actions.
#[derive(Debug, Clone, Deserialize)]
pub struct RmNodeValue {
    /// Node to act on.
    pub daemon_id: String,
    /// Skip the data-moving rebalance (advanced usage).
    #[serde(default)]
    pub skip_rebalance: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterPutQuery {
    #[serde(default)]
    transient: bool,
}

/// PUT /v1/cluster: administrative actions carried in an [`ActionMsg`].
pub async fn cluster_put(
    State(state): State<ApiState>,
    Query(query): Query<ClusterPutQuery>,
    Json(msg): Json<ActionMsg>,
) -> Result<Response, ApiError> {
    if let Some(forwarded) = forward_to_primary(
        &state,
        reqwest::Method::PUT,
        "/v1/cluster",
        Some(serde_json::to_value(&msg).map_err(ControlError::from)?),
    )
    .await?
    {
        return Ok(forwarded);
    }
    let core = &state.core;
    match msg.action {
        Action::SetPrimary => {
            let name = required_name(&msg)?;
            election::set_primary(core, &NodeId::from(name)).await?;
            Ok(StatusCode::OK.into_response())
        }
        Action::StartMaintenance | Action::DecommissionNode | Action::ShutdownNode => {
            let value = rm_node_value(&msg)?;
            let reb_id = rebalance::rm_node(
                core,
                &NodeId::from(value.daemon_id.as_str()),
                msg.action,
                value.skip_rebalance,
            )
            .await?;
            Ok(reb_response(reb_id))
        }
        Action::StopMaintenance => {
            let value = rm_node_value(&msg)?;
            let reb_id =
                rebalance::stop_maintenance(core, &NodeId::from(value.daemon_id.as_str())).await?;
            Ok(reb_response(reb_id))
        }
        Action::Rebalance => {
            let reb_id = rebalance::rebalance_cluster(core).await?;
            Ok(reb_response(reb_id))
        }
        Action::SetConfig => {
            let value = msg.value.clone().ok_or_else(|| {
                ApiError(ControlError::InvalidDescriptor(
                    "set-config without a value".to_string(),
                ))
            })?;
            let upd: ConfigUpdate =
                serde_json::from_value(value).map_err(ControlError::from)?;
            set_cluster_config(core, upd, query.transient).await?;
            Ok(StatusCode::OK.into_response())
        }
        Action::ResetConfig => {
            reset_cluster_config(core).await?;
            Ok(StatusCode::OK.into_response())
        }
        other => Err(ControlError::InvalidDescriptor(format!(
            "unsupported cluster action {other:?}"
        ))
        .into()),
    }
}

/// DELETE /v1/cluster/daemon/{id}
///
/// Intra-cluster callers may only remove themselves; an operator call is a
/// forced, immediate removal.
pub async fn remove_daemon(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(forwarded) = forward_to_primary(
        &state,
        reqwest::Method::DELETE,
        &format!("/v1/cluster/daemon/{id}"),
        None,
    )
    .await?
    {
        return Ok(forwarded);
    }
    let core = &state.core;
    let node_id = NodeId::from(id.as_str());
    let smap = core.smap();
    let Some(node) = smap.get_node(&node_id) else {
        return Err(ControlError::NodeNotFound {
            id: node_id,
            smap_version: smap.version,
        }
        .into());
    };
    if smap.is_primary(&node.id) {
        return Err(ControlError::InvalidDescriptor(
            "cannot remove the primary proxy".to_string(),
        )
        .into());
    }
    let caller = headers
        .get(HDR_CALLER_ID)
        .and_then(|value| value.to_str().ok());
    match caller {
        Some(caller_id) if caller_id == id => {
            rebalance::unreg_node(core, &node_id, Action::SelfRemoval, false).await?;
        }
        Some(other) => {
            return Err(ControlError::InvalidDescriptor(format!(
                "expecting self-initiated removal ({other} != {id})"
            ))
            .into());
        }
        None => {
            // Forced removal: potential data loss, the operator asked.
            warn!("forced removal of {node_id} - skipping graceful drain");
            rebalance::unreg_node(core, &node_id, Action::DecommissionNode, false).await?;
        }
    }
    Ok(StatusCode::OK.into_response())
}

fn required_name(msg: &ActionMsg) -> Result<&str, ApiError> {
    msg.name.as_deref().ok_or_else(|| {
        ApiError(ControlError::InvalidDescriptor(format!(
            "{:?} requires a node name",
            msg.action
        )))
    })
}

fn rm_node_value(msg: &ActionMsg) -> Result<RmNodeValue, ApiError> {
    if let Some(value) = &msg.value {
        return Ok(serde_json::from_value(value.clone()).map_err(ControlError::from)?);
    }
    Ok(RmNodeValue {
        daemon_id: required_name(msg)?.to_string(),
        skip_rebalance: false,
    })
}

fn reb_response(reb_id: Option<String>) -> Response {
    match reb_id {
        Some(id) => Json(json!({ "rebalance_id": id })).into_response(),
        None => StatusCode::OK.into_response(),
    }
}
