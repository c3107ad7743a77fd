use axum::extract::{Json, Path, State};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_SETTING},
    auth::{permissions::require_admin, AuthenticatedUser},
    error::{AppError, AppResult},
    models::SystemSetting,
    settings,
    state::AppState,
};

const MAX_KEY_LENGTH: usize = 100;

pub async fn list_settings(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<SystemSetting>>> {
    let mut conn = state.db()?;
    Ok(Json(settings::list(&mut conn)?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingRequest {
    pub value: Value,
    pub description: Option<String>,
}

pub async fn put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<UpdateSettingRequest>,
) -> AppResult<Json<SystemSetting>> {
    let key = key.trim().to_string();
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(AppError::bad_request("invalid setting key"));
    }

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let stored = conn.transaction::<_, AppError, _>(|conn| {
        let previous = settings::get(conn, &key)?;
        let stored = settings::upsert(
            conn,
            &key,
            payload.value,
            payload.description.as_deref().map(str::trim),
            Some(user.user_id),
        )?;

        let mut event = AuditEvent::new(
            Some(user.user_id),
            "setting.update",
            RESOURCE_SETTING,
            &key,
            format!("Updated setting {key}"),
        )
        .new_values(json!({ "value": stored.value, "description": stored.description }));
        if let Some(previous) = previous {
            event = event.old(json!({ "value": previous.value, "description": previous.description }));
        }
        audit::record(conn, event, &client)?;
        Ok(stored)
    })?;

    Ok(Json(stored))
}
