use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use silo_core::client::HDR_CALLER_ID;
use silo_core::error::ControlError;
use silo_core::node::NodeId;
use silo_core::notifs::{Delivery, NotifMsg};
use tracing::trace;

use crate::api::{ApiError, ApiState};

/// POST /v1/notifs/{progress|finished}: notifier to primary (or IC member).
///
/// Unknown uuids are acknowledged with 200 and dropped: late arrivals after
/// listener cleanup are expected, not errors.
pub async fn receive(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(msg): Json<NotifMsg>,
) -> Result<Response, ApiError> {
    let Some(caller) = headers
        .get(HDR_CALLER_ID)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(ControlError::InvalidDescriptor(
            "notification without caller id".to_string(),
        )
        .into());
    };
    let from = NodeId::from(caller);
    let delivery = match kind.as_str() {
        "progress" => state.core.notifs.handle_progress(&from, &msg),
        "finished" => state.core.notifs.handle_finished(&from, &msg),
        other => {
            return Err(ControlError::InvalidDescriptor(format!(
                "unknown notification kind {other:?}"
            ))
            .into());
        }
    };
    if delivery == Delivery::Dropped {
        trace!(uuid = %msg.uuid, peer = %from, "dropping notification for unknown action");
    }
    Ok(StatusCode::OK.into_response())
}
