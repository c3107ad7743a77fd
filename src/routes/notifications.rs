use axum::extract::{Json, Path, Query, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::page_bounds;
use crate::{
    auth::AuthenticatedUser, error::AppResult, models::Notification, notifications,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(params): Query<NotificationQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Notification>>> {
    let mut conn = state.db()?;
    let (limit, _) = page_bounds(params.limit, None);
    let rows = notifications::list_for_user(&mut conn, user.user_id, params.unread_only, limit)?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub count: i64,
}

pub async fn unread_count(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UnreadCountResponse>> {
    let mut conn = state.db()?;
    let count = notifications::unread_count(&mut conn, user.user_id)?;
    Ok(Json(UnreadCountResponse { count }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Notification>> {
    let mut conn = state.db()?;
    let updated = notifications::mark_read(&mut conn, user.user_id, notification_id)?;
    Ok(Json(updated))
}

#[derive(Debug, Serialize)]
pub struct MarkAllReadResponse {
    pub updated: usize,
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<MarkAllReadResponse>> {
    let mut conn = state.db()?;
    let updated = notifications::mark_all_read(&mut conn, user.user_id)?;
    Ok(Json(MarkAllReadResponse { updated }))
}
