pub mod conversations;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod state;

use axum::{
    Json, Router, middleware as axum_middleware,
    routing::{delete, get, patch, post},
};
use serde_json::{Value, json};

pub use state::{AppState, AppStateInner};

/// Every route the service exposes. Layers such as CORS and request
/// tracing are added by the binary.
pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route("/conversations/{conversation_id}/messages", get(conversations::get_messages))
        .route("/conversations/{conversation_id}/read", post(conversations::mark_conversation_read))
        .route("/conversations/{conversation_id}/participants", post(conversations::add_participant))
        .route(
            "/conversations/{conversation_id}/participants/me",
            delete(conversations::leave_conversation),
        )
        .route("/messages", post(messages::send_message))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route(
            "/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/read", post(notifications::mark_read))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route(
            "/notifications/preferences",
            get(notifications::get_preferences).put(notifications::put_preferences),
        )
        .route("/notifications/{notification_id}", delete(notifications::delete_notification))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/gateway", get(gateway::upgrade));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
