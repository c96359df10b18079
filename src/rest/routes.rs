// rest/routes.rs — Route handlers for the distributor HTTP surface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::GridError;
use crate::secret::Secret;
use crate::status::NodeStatus;
use crate::GridContext;

type ErrorResponse = (StatusCode, Json<Value>);

/// WebDriver-style error envelope plus the mapped status code.
fn error_response(err: GridError) -> ErrorResponse {
    (
        err.http_status(),
        Json(json!({
            "value": {
                "error": err.wire_kind(),
                "message": err.to_string(),
                "stacktrace": "",
            }
        })),
    )
}

pub async fn create_session(
    State(ctx): State<Arc<GridContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ErrorResponse> {
    match ctx.distributor.new_session(&body).await {
        Ok(session) => Ok(Json(json!({
            "value": {
                "sessionId": session.id.to_string(),
                "capabilities": session.capabilities,
            }
        }))),
        Err(e) => Err(error_response(e)),
    }
}

#[derive(Deserialize)]
pub struct RegisterNodeBody {
    pub status: NodeStatus,
    #[serde(default)]
    pub secret: Option<Secret>,
}

/// Register an in-process node by id. The wire body carries the node's
/// status snapshot plus its registration secret; the handshake itself runs
/// inside `Distributor::add`.
pub async fn register_node(
    State(ctx): State<Arc<GridContext>>,
    Json(body): Json<RegisterNodeBody>,
) -> Result<Json<Value>, ErrorResponse> {
    let node_id = body.status.node_id;
    let Some(node) = ctx.hosted_nodes.get(node_id).await else {
        return Err(error_response(GridError::NotFound(format!(
            "node {node_id}"
        ))));
    };
    // A posted secret must agree with the one the node itself presents.
    if let Some(posted) = body.secret {
        if posted != *node.registration_secret() {
            return Err(error_response(GridError::NodeRejected(node_id)));
        }
    }
    match ctx.distributor.add(node).await {
        Ok(()) => Ok(Json(json!({ "value": { "nodeId": node_id.to_string() } }))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn remove_node(
    State(ctx): State<Arc<GridContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ErrorResponse> {
    match ctx.distributor.remove(id).await {
        Ok(()) => Ok(Json(json!({ "value": null }))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn drain_node(
    State(ctx): State<Arc<GridContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ErrorResponse> {
    match ctx.distributor.drain(id).await {
        Ok(()) => Ok(Json(json!({ "value": null }))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn status(State(ctx): State<Arc<GridContext>>) -> Json<Value> {
    let status = ctx.distributor.status().await;
    Json(json!({ "value": status }))
}
