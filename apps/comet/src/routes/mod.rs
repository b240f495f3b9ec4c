pub mod admin;
pub mod health;
pub mod push;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/v1", push::router().merge(admin::router()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Push
        push::push_users,
        push::push_room,
        push::broadcast,
        // Admin
        admin::list_rooms,
        admin::stats,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            health::HealthResponse,
            push::PushUsersRequest,
            push::PushRoomRequest,
            push::BroadcastRequest,
            push::PushResponse,
            admin::RoomOnline,
            admin::RoomsResponse,
            admin::BucketStats,
            admin::StatsResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Push", description = "Deliver frames to connected clients"),
        (name = "Admin", description = "Connection index views"),
    )
)]
pub struct ApiDoc;
