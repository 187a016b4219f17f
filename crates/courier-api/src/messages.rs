use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use courier_core::OutgoingMessage;
use courier_types::api::{Claims, EditMessageRequest, SendMessageRequest};
use courier_types::models::Message;

use crate::error::ApiResult;
use crate::state::AppState;

/// Same path as the gateway `send-message` command. The response is the
/// stored message; online recipients get it pushed as well.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let outgoing = OutgoingMessage {
        conversation_id: req.conversation_id,
        receiver_id: req.receiver_id,
        content: req.content,
        client_ref: None,
    };
    let message = state.courier.send_message(claims.sub, outgoing).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.courier.mark_read(claims.sub, message_id).await?))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<Message>> {
    let message = state.courier.edit_message(claims.sub, message_id, req.text).await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.courier.delete_message(claims.sub, message_id).await?))
}
