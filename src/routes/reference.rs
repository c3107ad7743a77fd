use axum::{extract::State, http::StatusCode, Json};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_DOCUMENT_SOURCE, RESOURCE_DOCUMENT_TYPE},
    auth::{permissions::require_admin, AuthenticatedUser},
    error::{AppError, AppResult},
    models::{DocumentSource, DocumentType, NewDocumentSource, NewDocumentType},
    schema::{document_sources, document_types},
    state::AppState,
};

/// 2 to 10 uppercase letters or digits.
pub fn validate_type_code(code: &str) -> Result<(), String> {
    let valid = (2..=10).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(format!(
            "invalid type code '{code}': use 2-10 uppercase letters or digits"
        ))
    }
}

pub async fn list_document_types(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentType>>> {
    let mut conn = state.db()?;
    let types = document_types::table
        .order(document_types::code.asc())
        .load(&mut conn)?;
    Ok(Json(types))
}

#[derive(Deserialize)]
pub struct CreateDocumentTypeRequest {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub async fn create_document_type(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<CreateDocumentTypeRequest>,
) -> AppResult<(StatusCode, Json<DocumentType>)> {
    let code = payload.code.trim().to_string();
    validate_type_code(&code).map_err(AppError::bad_request)?;
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let created = conn.transaction::<_, AppError, _>(|conn| {
        let created: DocumentType = diesel::insert_into(document_types::table)
            .values(NewDocumentType {
                id: Uuid::new_v4(),
                code,
                name,
                description: payload.description.trim().to_string(),
            })
            .get_result(conn)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "document_type.create",
                RESOURCE_DOCUMENT_TYPE,
                created.id,
                format!("Created document type {}", created.code),
            )
            .new_values(json!({ "code": created.code, "name": created.name })),
            &client,
        )?;
        Ok(created)
    })?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_document_sources(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentSource>>> {
    let mut conn = state.db()?;
    let sources = document_sources::table
        .order(document_sources::name.asc())
        .load(&mut conn)?;
    Ok(Json(sources))
}

#[derive(Deserialize)]
pub struct CreateDocumentSourceRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub async fn create_document_source(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<CreateDocumentSourceRequest>,
) -> AppResult<(StatusCode, Json<DocumentSource>)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let created = conn.transaction::<_, AppError, _>(|conn| {
        let created: DocumentSource = diesel::insert_into(document_sources::table)
            .values(NewDocumentSource {
                id: Uuid::new_v4(),
                name,
                description: payload.description.trim().to_string(),
            })
            .get_result(conn)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "document_source.create",
                RESOURCE_DOCUMENT_SOURCE,
                created.id,
                format!("Created document source {}", created.name),
            )
            .new_values(json!({ "name": created.name })),
            &client,
        )?;
        Ok(created)
    })?;

    Ok((StatusCode::CREATED, Json(created)))
}

#[cfg(test)]
mod tests {
    use super::validate_type_code;

    #[test]
    fn accepts_short_uppercase_codes() {
        assert!(validate_type_code("SOP").is_ok());
        assert!(validate_type_code("WI2").is_ok());
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(validate_type_code("S").is_err());
        assert!(validate_type_code("sop").is_err());
        assert!(validate_type_code("TOO-LONG").is_err());
        assert!(validate_type_code("ABCDEFGHIJK").is_err());
    }
}
