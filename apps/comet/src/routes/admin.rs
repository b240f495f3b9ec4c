//! Read-only views of the connection index.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/stats", get(stats))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RoomOnline {
    pub room_id: String,
    pub online: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RoomsResponse {
    pub rooms: Vec<RoomOnline>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BucketStats {
    pub index: usize,
    pub channels: usize,
    pub ips: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    pub started_at: DateTime<Utc>,
    pub channels: usize,
    pub ips: usize,
    pub buckets: Vec<BucketStats>,
}

#[utoipa::path(
    get,
    path = "/api/v1/rooms",
    tag = "Admin",
    responses((status = 200, description = "Online count per room", body = RoomsResponse)),
)]
pub async fn list_rooms(State(state): State<AppState>) -> Json<RoomsResponse> {
    let rooms = state
        .server
        .room_counts()
        .into_iter()
        .map(|(room_id, online)| RoomOnline { room_id, online })
        .collect();
    Json(RoomsResponse { rooms })
}

#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "Admin",
    responses((status = 200, description = "Connection counts", body = StatsResponse)),
)]
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let server = &state.server;
    let buckets = server
        .buckets()
        .iter()
        .map(|b| BucketStats {
            index: b.index(),
            channels: b.channel_count(),
            ips: b.ip_count().len(),
        })
        .collect();
    Json(StatsResponse {
        started_at: server.started_at(),
        channels: server.channel_count(),
        ips: server.ips().len(),
        buckets,
    })
}
