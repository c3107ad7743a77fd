use std::collections::HashMap;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_PLACEHOLDER},
    auth::{permissions::require_admin, AuthenticatedUser},
    error::{AppError, AppResult},
    models::{NewPlaceholderDefinition, PlaceholderDefinition},
    placeholders::{self, DataSource, ResolvedPlaceholder},
    schema::placeholder_definitions,
    state::AppState,
    utils::json::required_if_present,
};

pub async fn list_placeholders(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<PlaceholderDefinition>>> {
    let mut conn = state.db()?;
    let definitions = placeholder_definitions::table
        .order(placeholder_definitions::name.asc())
        .load(&mut conn)?;
    Ok(Json(definitions))
}

#[derive(Debug, Deserialize)]
pub struct CreatePlaceholderRequest {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub data_source: String,
    #[serde(default)]
    pub field_path: String,
    #[serde(default)]
    pub default_value: String,
}

fn definition_view(definition: &PlaceholderDefinition) -> Value {
    json!({
        "name": definition.name,
        "display_name": definition.display_name,
        "data_source": definition.data_source,
        "field_path": definition.field_path,
        "default_value": definition.default_value,
        "is_active": definition.is_active,
    })
}

pub async fn create_placeholder(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<CreatePlaceholderRequest>,
) -> AppResult<(StatusCode, Json<PlaceholderDefinition>)> {
    let name = payload.name.trim().to_string();
    placeholders::validate_name(&name).map_err(AppError::bad_request)?;
    let data_source: DataSource = payload.data_source.parse().map_err(AppError::bad_request)?;
    let display_name = payload.display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(AppError::bad_request("display_name is required"));
    }

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let created = conn.transaction::<_, AppError, _>(|conn| {
        let created: PlaceholderDefinition =
            diesel::insert_into(placeholder_definitions::table)
                .values(NewPlaceholderDefinition {
                    id: Uuid::new_v4(),
                    name,
                    display_name,
                    description: payload.description.trim().to_string(),
                    data_source: data_source.as_str().to_string(),
                    field_path: payload.field_path.trim().to_string(),
                    default_value: payload.default_value,
                })
                .get_result(conn)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "placeholder.create",
                RESOURCE_PLACEHOLDER,
                created.id,
                format!("Created placeholder {}", created.name),
            )
            .new_values(definition_view(&created)),
            &client,
        )?;
        Ok(created)
    })?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_placeholder(
    State(state): State<AppState>,
    Path(placeholder_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<Value>,
) -> AppResult<Json<PlaceholderDefinition>> {
    let display_name: Option<String> =
        required_if_present(&payload, "display_name").map_err(AppError::bad_request)?;
    let description: Option<String> =
        required_if_present(&payload, "description").map_err(AppError::bad_request)?;
    let data_source: Option<String> =
        required_if_present(&payload, "data_source").map_err(AppError::bad_request)?;
    let field_path: Option<String> =
        required_if_present(&payload, "field_path").map_err(AppError::bad_request)?;
    let default_value: Option<String> =
        required_if_present(&payload, "default_value").map_err(AppError::bad_request)?;
    let is_active: Option<bool> =
        required_if_present(&payload, "is_active").map_err(AppError::bad_request)?;

    if display_name.is_none()
        && description.is_none()
        && data_source.is_none()
        && field_path.is_none()
        && default_value.is_none()
        && is_active.is_none()
    {
        return Err(AppError::bad_request("no changes provided"));
    }
    let data_source = data_source
        .map(|value| value.parse::<DataSource>())
        .transpose()
        .map_err(AppError::bad_request)?;
    if let Some(display_name) = &display_name {
        if display_name.trim().is_empty() {
            return Err(AppError::bad_request("display_name must not be empty"));
        }
    }

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let current: PlaceholderDefinition = placeholder_definitions::table
            .find(placeholder_id)
            .for_update()
            .first(conn)?;

        let updated: PlaceholderDefinition =
            diesel::update(placeholder_definitions::table.find(placeholder_id))
                .set((
                    placeholder_definitions::display_name.eq(display_name
                        .as_deref()
                        .map(str::trim)
                        .unwrap_or(current.display_name.as_str())),
                    placeholder_definitions::description
                        .eq(description.as_deref().unwrap_or(current.description.as_str())),
                    placeholder_definitions::data_source.eq(data_source
                        .map(|source| source.as_str())
                        .unwrap_or(current.data_source.as_str())),
                    placeholder_definitions::field_path
                        .eq(field_path.as_deref().map(str::trim).unwrap_or(current.field_path.as_str())),
                    placeholder_definitions::default_value
                        .eq(default_value.as_deref().unwrap_or(current.default_value.as_str())),
                    placeholder_definitions::is_active.eq(is_active.unwrap_or(current.is_active)),
                    placeholder_definitions::updated_at.eq(Utc::now().naive_utc()),
                ))
                .get_result(conn)?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "placeholder.update",
                RESOURCE_PLACEHOLDER,
                placeholder_id,
                format!("Updated placeholder {}", updated.name),
            )
            .old(definition_view(&current))
            .new_values(definition_view(&updated)),
            &client,
        )?;
        Ok(updated)
    })?;

    Ok(Json(updated))
}

pub async fn resolve_placeholders(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<ResolvedPlaceholder>>> {
    let mut conn = state.db()?;
    let resolved =
        placeholders::resolve_for_document(&mut conn, document_id, Utc::now().naive_utc())?;
    Ok(Json(resolved))
}

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub document_id: Uuid,
    pub template: String,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub rendered: String,
    pub placeholders: Vec<ResolvedPlaceholder>,
}

pub async fn render_template(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Json(payload): Json<RenderRequest>,
) -> AppResult<Json<RenderResponse>> {
    let mut conn = state.db()?;
    let resolved =
        placeholders::resolve_for_document(&mut conn, payload.document_id, Utc::now().naive_utc())?;
    let values: HashMap<String, String> = resolved
        .iter()
        .map(|placeholder| (placeholder.name.clone(), placeholder.value.clone()))
        .collect();

    Ok(Json(RenderResponse {
        rendered: placeholders::render(&payload.template, &values),
        placeholders: resolved,
    }))
}
