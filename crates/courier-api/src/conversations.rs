use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

use courier_core::{ChatError, MAX_PAGE_SIZE, PairOptions};
use courier_types::api::{
    AddParticipantRequest, Claims, ConversationPage, ConversationResponse,
    CreateConversationRequest, MarkedResponse, MessagePage,
};
use courier_types::models::{Conversation, ConversationMetadata, ConversationType};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Sequence number of the oldest message the client already holds.
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<ConversationPage>> {
    let (rows, has_more) = state
        .courier
        .list_conversations(claims.sub, query.page, query.limit)
        .await?;

    let conversations = rows
        .into_iter()
        .map(|(conversation, unread_count)| ConversationResponse {
            conversation,
            unread_count,
        })
        .collect();
    Ok(Json(ConversationPage {
        conversations,
        page: query.page.unwrap_or(1).max(1),
        limit: query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE),
        has_more,
    }))
}

/// Pair requests are deduplicated; asking twice returns the same conversation.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<Json<Conversation>> {
    let metadata = ConversationMetadata {
        job_id: req.job_id,
        application_id: req.application_id,
    };

    let conversation = match (req.conversation_type, req.participant_id) {
        (Some(ConversationType::Group), _) => {
            state
                .courier
                .create_group(claims.sub, req.participant_ids, metadata)
                .await?
        }
        (conversation_type, Some(other)) => {
            let options = PairOptions {
                conversation_type,
                metadata,
            };
            state.courier.find_or_create(claims.sub, other, options).await?
        }
        (_, None) => {
            return Err(ChatError::InvalidParticipant("participant_id is required".into()).into());
        }
    };
    Ok(Json(conversation))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state.courier.conversation_for(claims.sub, conversation_id).await?;
    Ok(Json(conversation))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<Json<MessagePage>> {
    let (messages, has_more) = state
        .courier
        .get_messages(claims.sub, conversation_id, query.before, query.limit)
        .await?;
    Ok(Json(MessagePage { messages, has_more }))
}

pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<MarkedResponse>> {
    let marked = state.courier.mark_conversation_read(claims.sub, conversation_id).await?;
    Ok(Json(MarkedResponse { marked }))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<AddParticipantRequest>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .courier
        .add_participant(claims.sub, conversation_id, req.user_id)
        .await?;
    Ok(Json(conversation))
}

pub async fn leave_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state.courier.leave_conversation(claims.sub, conversation_id).await?;
    Ok(Json(conversation))
}
