use axum::extract::{Json, Query, State};
use chrono::{Days, NaiveDate};
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use super::page_bounds;
use crate::{
    audit::{self, VerifyReport},
    auth::{permissions::require_admin, AuthenticatedUser},
    error::{AppError, AppResult},
    models::{AuditEntry, LoginAudit},
    schema::{audit_trail, login_audit},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct AuditTrailQuery {
    pub user_id: Option<Uuid>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `from` and `to` are whole days; both ends are inclusive.
pub async fn list_trail(
    State(state): State<AppState>,
    Query(params): Query<AuditTrailQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<AuditEntry>>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;
    let (limit, offset) = page_bounds(params.limit, params.offset);

    if let (Some(from), Some(to)) = (params.from, params.to) {
        if from > to {
            return Err(AppError::bad_request("from must not be after to"));
        }
    }

    let mut query = audit_trail::table.into_boxed();
    if let Some(user_id) = params.user_id {
        query = query.filter(audit_trail::user_id.eq(user_id));
    }
    if let Some(resource_type) = non_empty(params.resource_type) {
        query = query.filter(audit_trail::resource_type.eq(resource_type));
    }
    if let Some(resource_id) = non_empty(params.resource_id) {
        query = query.filter(audit_trail::resource_id.eq(resource_id));
    }
    if let Some(action) = non_empty(params.action) {
        query = query.filter(audit_trail::action.eq(action));
    }
    if let Some(from) = params.from {
        query = query.filter(audit_trail::created_at.ge(from.and_time(chrono::NaiveTime::MIN)));
    }
    if let Some(to) = params.to {
        let end = to
            .checked_add_days(Days::new(1))
            .ok_or_else(|| AppError::bad_request("to is out of range"))?;
        query = query.filter(audit_trail::created_at.lt(end.and_time(chrono::NaiveTime::MIN)));
    }

    let entries = query
        .order((audit_trail::created_at.desc(), audit_trail::id.desc()))
        .limit(limit)
        .offset(offset)
        .load(&mut conn)?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct LoginAuditQuery {
    pub username: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<i64>,
}

pub async fn list_logins(
    State(state): State<AppState>,
    Query(params): Query<LoginAuditQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<LoginAudit>>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;
    let (limit, _) = page_bounds(params.limit, None);

    let mut query = login_audit::table.into_boxed();
    if let Some(username) = non_empty(params.username) {
        query = query.filter(login_audit::username.eq(username));
    }
    if let Some(success) = params.success {
        query = query.filter(login_audit::success.eq(success));
    }

    let attempts = query
        .order(login_audit::created_at.desc())
        .limit(limit)
        .load(&mut conn)?;
    Ok(Json(attempts))
}

pub async fn verify_trail(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<VerifyReport>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;
    Ok(Json(audit::verify_all(&mut conn)?))
}
