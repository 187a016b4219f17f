use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

use courier_core::MAX_PAGE_SIZE;
use courier_types::api::{Claims, MarkNotificationsRequest, NotificationPage, UnreadCountResponse};
use courier_types::models::NotificationPreferences;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub unread_only: bool,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Json<NotificationPage>> {
    let (notifications, unread_count) = state
        .courier
        .list_notifications(claims.sub, query.unread_only, query.page, query.limit)
        .await?;
    Ok(Json(NotificationPage {
        notifications,
        unread_count,
        page: query.page.unwrap_or(1).max(1),
        limit: query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE),
    }))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<UnreadCountResponse>> {
    let unread_count = state.courier.unread_count(claims.sub).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkNotificationsRequest>,
) -> ApiResult<Json<UnreadCountResponse>> {
    let unread_count = state.courier.mark_notifications_read(claims.sub, req.ids).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<UnreadCountResponse>> {
    let unread_count = state.courier.mark_all_notifications_read(claims.sub).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<Json<UnreadCountResponse>> {
    let unread_count = state.courier.delete_notification(claims.sub, notification_id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn get_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<NotificationPreferences>> {
    Ok(Json(state.courier.preferences(claims.sub).await?))
}

pub async fn put_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(preferences): Json<NotificationPreferences>,
) -> ApiResult<Json<NotificationPreferences>> {
    Ok(Json(state.courier.update_preferences(claims.sub, preferences).await?))
}
