//! Push endpoints used by the logic tier.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use comet_common::Op;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::dispatcher::DEFAULT_PUSH_OP;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push/users", post(push_users))
        .route("/push/room", post(push_room))
        .route("/broadcast", post(broadcast))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PushUsersRequest {
    pub user_ids: Vec<String>,
    /// Operation code; defaults to SEND_MSG_REPLY (5).
    pub op: Option<u32>,
    /// Frame body, standard base64.
    pub body: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PushRoomRequest {
    pub room_id: String,
    pub op: Option<u32>,
    pub body: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BroadcastRequest {
    pub op: Option<u32>,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PushResponse {
    /// Channels that accepted the frame into their queue.
    pub delivered: usize,
}

fn decode_body(state: &AppState, body: &str) -> Result<Bytes, ApiError> {
    let raw = STANDARD.decode(body)?;
    let max = state.server.config().max_body;
    if raw.len() > max {
        return Err(ApiError::payload_too_large(format!(
            "body is {} bytes, limit is {max}",
            raw.len()
        )));
    }
    Ok(Bytes::from(raw))
}

fn op_or_default(op: Option<u32>) -> Op {
    op.map(Op).unwrap_or(DEFAULT_PUSH_OP)
}

// ---------------------------------------------------------------------------
// POST /api/v1/push/users
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/push/users",
    tag = "Push",
    request_body = PushUsersRequest,
    responses(
        (status = 200, description = "Frame enqueued", body = PushResponse),
        (status = 400, description = "Invalid request", body = ApiErrorBody),
        (status = 413, description = "Body exceeds the frame limit", body = ApiErrorBody),
    ),
)]
pub async fn push_users(
    State(state): State<AppState>,
    Json(req): Json<PushUsersRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    if req.user_ids.is_empty() {
        return Err(ApiError::bad_request("user_ids must not be empty"));
    }
    let body = decode_body(&state, &req.body)?;
    let delivered = state
        .dispatcher
        .push_to_users(&req.user_ids, op_or_default(req.op), body);
    Ok(Json(PushResponse { delivered }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/push/room
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/push/room",
    tag = "Push",
    request_body = PushRoomRequest,
    responses(
        (status = 200, description = "Frame enqueued", body = PushResponse),
        (status = 400, description = "Invalid request", body = ApiErrorBody),
        (status = 413, description = "Body exceeds the frame limit", body = ApiErrorBody),
    ),
)]
pub async fn push_room(
    State(state): State<AppState>,
    Json(req): Json<PushRoomRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    if req.room_id.trim().is_empty() {
        return Err(ApiError::bad_request("room_id must not be empty"));
    }
    let body = decode_body(&state, &req.body)?;
    let delivered = state
        .dispatcher
        .push_to_room(&req.room_id, op_or_default(req.op), body);
    Ok(Json(PushResponse { delivered }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/broadcast
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/broadcast",
    tag = "Push",
    request_body = BroadcastRequest,
    responses(
        (status = 200, description = "Frame enqueued", body = PushResponse),
        (status = 400, description = "Invalid request", body = ApiErrorBody),
        (status = 413, description = "Body exceeds the frame limit", body = ApiErrorBody),
    ),
)]
pub async fn broadcast(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    let body = decode_body(&state, &req.body)?;
    let delivered = state.dispatcher.broadcast(op_or_default(req.op), body);
    Ok(Json(PushResponse { delivered }))
}
