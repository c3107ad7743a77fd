use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use chrono::{NaiveDate, Utc};
use diesel::{dsl::count_star, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::page_bounds;
use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_DOCUMENT},
    auth::{
        permissions::{load_permissions, require_level, PermissionLevel, UserPermissions},
        AuthenticatedUser,
    },
    error::{AppError, AppResult},
    models::{Document, DocumentDependency, DocumentType, DocumentWorkflow, NewDocumentDependency},
    schema::{
        document_dependencies, document_transitions, document_types, document_workflows,
        documents,
    },
    state::AppState,
    storage::{attachment_disposition, document_object_key},
    utils::json::{classify_nullable, required_if_present, Patch},
    workflow::{
        available_actions,
        dependencies::{ensure_acyclic, DEPENDENCY_TYPES},
        service::{self, Actor, DocumentDraft},
        DocumentStatus, WorkflowAction, WorkflowError,
    },
};

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;
const MAX_VERSION_CHAIN: usize = 1_000;

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub status: Option<String>,
    pub document_type: Option<String>,
    pub author: Option<Uuid>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    #[serde(flatten)]
    pub document: Document,
    pub version: String,
    pub document_type_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DependencyResponse {
    pub id: Uuid,
    pub document_id: Uuid,
    pub depends_on_id: Uuid,
    pub dependency_type: String,
    pub document_number: String,
    pub title: String,
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct DocumentDetailResponse {
    pub document: DocumentResponse,
    pub workflow: Option<DocumentWorkflow>,
    pub dependencies: Vec<DependencyResponse>,
    pub available_actions: Vec<WorkflowAction>,
}

#[derive(Serialize)]
pub struct DocumentDownloadResponse {
    pub url: String,
    pub expires_in: u64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
}

fn version_label(document: &Document) -> String {
    format!("{}.{}", document.version_major, document.version_minor)
}

fn type_codes(conn: &mut PgConnection) -> AppResult<HashMap<Uuid, String>> {
    let types: Vec<DocumentType> = document_types::table.load(conn)?;
    Ok(types.into_iter().map(|kind| (kind.id, kind.code)).collect())
}

fn to_document_response(document: Document, codes: &HashMap<Uuid, String>) -> DocumentResponse {
    DocumentResponse {
        version: version_label(&document),
        document_type_code: codes.get(&document.document_type_id).cloned(),
        document,
    }
}

fn load_document(conn: &mut PgConnection, document_id: Uuid) -> AppResult<Document> {
    let document = documents::table.find(document_id).first(conn)?;
    Ok(document)
}

fn to_dependency_response(dependency: DocumentDependency, target: &Document) -> DependencyResponse {
    DependencyResponse {
        id: dependency.id,
        document_id: dependency.document_id,
        depends_on_id: dependency.depends_on_id,
        dependency_type: dependency.dependency_type,
        document_number: target.document_number.clone(),
        title: target.title.clone(),
        status: target.status.clone(),
        version: version_label(target),
    }
}

fn load_dependencies(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> AppResult<Vec<DependencyResponse>> {
    let rows: Vec<(DocumentDependency, Document)> = document_dependencies::table
        .inner_join(documents::table.on(documents::id.eq(document_dependencies::depends_on_id)))
        .filter(document_dependencies::document_id.eq(document_id))
        .order(documents::document_number.asc())
        .select((document_dependencies::all_columns, documents::all_columns))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(dependency, target)| to_dependency_response(dependency, &target))
        .collect())
}

pub(crate) fn load_detail(
    conn: &mut PgConnection,
    document: Document,
    viewer: &UserPermissions,
) -> AppResult<DocumentDetailResponse> {
    let workflow: Option<DocumentWorkflow> = document_workflows::table
        .filter(document_workflows::document_id.eq(document.id))
        .first(conn)
        .optional()?;
    let dependencies = load_dependencies(conn, document.id)?;

    let actor = Actor::User(viewer.clone());
    let ctx = service::context_for(conn, &document, &actor, service::today())?;
    let status = service::parse_status(&document)?;
    let actions = available_actions(status, &ctx);

    let codes = type_codes(conn)?;
    Ok(DocumentDetailResponse {
        document: to_document_response(document, &codes),
        workflow,
        dependencies,
        available_actions: actions,
    })
}

/// Author or administrator, and only while the document is still a draft.
fn ensure_editable(document: &Document, permissions: &UserPermissions) -> AppResult<()> {
    if document.author_id != permissions.user_id && !permissions.is_admin() {
        return Err(AppError::forbidden("only the author may edit this document"));
    }
    let status = service::parse_status(document)?;
    if status != DocumentStatus::Draft {
        return Err(
            AppError::conflict("only draft documents can be edited").with_detail(status.as_str())
        );
    }
    Ok(())
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<DocumentListQuery>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let mut conn = state.db()?;
    let (limit, offset) = page_bounds(params.limit, params.offset);

    let mut query = documents::table.into_boxed();

    if let Some(status) = params.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let status: DocumentStatus = status
            .parse()
            .map_err(|err: WorkflowError| AppError::bad_request(err.to_string()))?;
        query = query.filter(documents::status.eq(status.as_str()));
    }

    if let Some(kind) = params
        .document_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        match Uuid::parse_str(kind) {
            Ok(type_id) => query = query.filter(documents::document_type_id.eq(type_id)),
            Err(_) => {
                let code = kind.to_ascii_uppercase();
                query = query.filter(
                    documents::document_type_id.eq_any(
                        document_types::table
                            .filter(document_types::code.eq(code))
                            .select(document_types::id),
                    ),
                );
            }
        }
    }

    if let Some(author) = params.author {
        query = query.filter(documents::author_id.eq(author));
    }

    if let Some(search) = params.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search.replace('%', "\\%").replace('_', "\\_"));
        query = query.filter(
            documents::title
                .ilike(pattern.clone())
                .or(documents::document_number.ilike(pattern)),
        );
    }

    let rows: Vec<Document> = query
        .order((
            documents::document_number.asc(),
            documents::version_major.desc(),
            documents::version_minor.desc(),
        ))
        .limit(limit)
        .offset(offset)
        .load(&mut conn)?;

    let codes = type_codes(&mut conn)?;
    Ok(Json(
        rows.into_iter()
            .map(|document| to_document_response(document, &codes))
            .collect(),
    ))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentDetailResponse>> {
    let mut conn = state.db()?;
    let permissions = load_permissions(&mut conn, user.user_id)?;
    let document = load_document(&mut conn, document_id)?;
    Ok(Json(load_detail(&mut conn, document, &permissions)?))
}

#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub document_type_id: Uuid,
    pub document_source_id: Option<Uuid>,
    pub reviewer_id: Option<Uuid>,
    pub approver_id: Option<Uuid>,
    #[serde(default)]
    pub reason_for_change: String,
    pub effective_date: Option<NaiveDate>,
}

pub async fn create_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<CreateDocumentRequest>,
) -> AppResult<(StatusCode, Json<DocumentDetailResponse>)> {
    let mut conn = state.db()?;
    let permissions = require_level(&mut conn, &user, PermissionLevel::Write)?;

    if payload.reviewer_id == Some(user.user_id) || payload.approver_id == Some(user.user_id) {
        return Err(AppError::bad_request(
            "the author cannot be the reviewer or approver",
        ));
    }

    let document = service::create_document(
        &mut conn,
        &permissions,
        DocumentDraft {
            title: payload.title,
            description: payload.description,
            document_type_id: payload.document_type_id,
            document_source_id: payload.document_source_id,
            reviewer_id: payload.reviewer_id,
            approver_id: payload.approver_id,
            reason_for_change: payload.reason_for_change,
            effective_date: payload.effective_date,
        },
        &client,
    )?;

    let detail = load_detail(&mut conn, document, &permissions)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn update_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<Value>,
) -> AppResult<Json<DocumentDetailResponse>> {
    let title: Option<String> =
        required_if_present(&payload, "title").map_err(AppError::bad_request)?;
    let description: Option<String> =
        required_if_present(&payload, "description").map_err(AppError::bad_request)?;
    let reason_for_change: Option<String> =
        required_if_present(&payload, "reason_for_change").map_err(AppError::bad_request)?;
    let reviewer: Patch<Uuid> =
        classify_nullable(&payload, "reviewer_id").map_err(AppError::bad_request)?;
    let approver: Patch<Uuid> =
        classify_nullable(&payload, "approver_id").map_err(AppError::bad_request)?;
    let effective_date: Patch<NaiveDate> =
        classify_nullable(&payload, "effective_date").map_err(AppError::bad_request)?;

    if title.is_none()
        && description.is_none()
        && reason_for_change.is_none()
        && reviewer.is_omitted()
        && approver.is_omitted()
        && effective_date.is_omitted()
    {
        return Err(AppError::bad_request("no changes provided"));
    }
    if let Some(title) = &title {
        if title.trim().is_empty() {
            return Err(AppError::bad_request("title must not be empty"));
        }
    }

    let mut conn = state.db()?;
    let permissions = load_permissions(&mut conn, user.user_id)?;

    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let current: Document = documents::table
            .find(document_id)
            .for_update()
            .first(conn)?;
        ensure_editable(&current, &permissions)?;

        let reviewer_id = reviewer.apply(current.reviewer_id);
        let approver_id = approver.apply(current.approver_id);
        if reviewer_id == Some(current.author_id) || approver_id == Some(current.author_id) {
            return Err(AppError::bad_request(
                "the author cannot be the reviewer or approver",
            ));
        }
        if reviewer_id != current.reviewer_id {
            if let Some(reviewer_id) = reviewer_id {
                service::ensure_assignable(conn, reviewer_id, PermissionLevel::Review)?;
            }
        }
        if approver_id != current.approver_id {
            if let Some(approver_id) = approver_id {
                service::ensure_assignable(conn, approver_id, PermissionLevel::Approve)?;
            }
        }

        let updated: Document = diesel::update(documents::table.find(document_id))
            .set((
                documents::title.eq(title
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or(current.title.as_str())),
                documents::description.eq(description.as_deref().unwrap_or(current.description.as_str())),
                documents::reason_for_change
                    .eq(reason_for_change.as_deref().unwrap_or(current.reason_for_change.as_str())),
                documents::reviewer_id.eq(reviewer_id),
                documents::approver_id.eq(approver_id),
                documents::effective_date.eq(effective_date.clone().apply(current.effective_date)),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .get_result(conn)?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "document.update",
                RESOURCE_DOCUMENT,
                document_id,
                format!("Updated draft {}", updated.document_number),
            )
            .old(editable_view(&current))
            .new_values(editable_view(&updated)),
            &client,
        )?;
        Ok(updated)
    })?;

    Ok(Json(load_detail(&mut conn, updated, &permissions)?))
}

fn editable_view(document: &Document) -> Value {
    json!({
        "title": document.title,
        "description": document.description,
        "reason_for_change": document.reason_for_change,
        "reviewer_id": document.reviewer_id,
        "approver_id": document.approver_id,
        "effective_date": document.effective_date,
    })
}

pub async fn upload_file(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    mut multipart: Multipart,
) -> AppResult<Json<DocumentDetailResponse>> {
    let permissions = {
        let mut conn = state.db()?;
        let permissions = load_permissions(&mut conn, user.user_id)?;
        let document = load_document(&mut conn, document_id)?;
        ensure_editable(&document, &permissions)?;
        permissions
    };

    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        original_name = field.file_name().map(|name| name.to_string());
        content_type = field.content_type().map(|mime| mime.to_string());
        let data = field.bytes().await.map_err(|err| {
            error!(error = %err, "failed to read file bytes");
            AppError::bad_request(format!("failed to read file bytes: {err}"))
        })?;
        file_bytes = Some(data.to_vec());
    }

    let file_bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if file_bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    let original_name = original_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::bad_request("filename is required"))?;
    let content_type = content_type
        .filter(|value| value != "application/octet-stream")
        .or_else(|| {
            mime_guess::from_path(&original_name)
                .first()
                .map(|mime| mime.to_string())
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let checksum = hex::encode(Sha256::digest(&file_bytes));
    let key = document_object_key(document_id, &checksum);
    let size = file_bytes.len() as i64;

    state
        .storage
        .put_object(
            &key,
            file_bytes,
            Some(content_type.clone()),
            Some(attachment_disposition(&original_name)),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to store file: {err}")))?;

    let mut conn = state.db()?;
    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let current: Document = documents::table
            .find(document_id)
            .for_update()
            .first(conn)?;
        ensure_editable(&current, &permissions)?;

        let updated: Document = diesel::update(documents::table.find(document_id))
            .set((
                documents::file_key.eq(Some(key.as_str())),
                documents::file_name.eq(Some(original_name.as_str())),
                documents::file_content_type.eq(Some(content_type.as_str())),
                documents::file_size.eq(Some(size)),
                documents::file_checksum.eq(Some(checksum.as_str())),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .get_result(conn)?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "document.upload_file",
                RESOURCE_DOCUMENT,
                document_id,
                format!("Attached {} to {}", original_name, updated.document_number),
            )
            .old(json!({ "file_name": current.file_name, "file_checksum": current.file_checksum }))
            .new_values(json!({ "file_name": original_name, "file_checksum": checksum, "file_size": size })),
            &client,
        )?;
        Ok(updated)
    })?;

    info!(document_id = %document_id, size, "document file uploaded");
    Ok(Json(load_detail(&mut conn, updated, &permissions)?))
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
) -> AppResult<Json<DocumentDownloadResponse>> {
    let document = {
        let mut conn = state.db()?;
        let document = load_document(&mut conn, document_id)?;
        audit::record(
            &mut conn,
            AuditEvent::new(
                Some(user.user_id),
                "document.download",
                RESOURCE_DOCUMENT,
                document_id,
                format!("Downloaded {} v{}", document.document_number, version_label(&document)),
            ),
            &client,
        )?;
        document
    };
    let key = document
        .file_key
        .as_deref()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "document has no file"))?;

    let url = state
        .storage
        .presign_get_object(key, Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS))
        .await
        .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))?;

    Ok(Json(DocumentDownloadResponse {
        url,
        expires_in: PRESIGNED_URL_EXPIRY_SECONDS,
        filename: document.file_name.clone(),
        content_type: document.file_content_type.clone(),
        size_bytes: document.file_size,
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let permissions = load_permissions(&mut conn, user.user_id)?;

    let removed = conn.transaction::<_, AppError, _>(|conn| {
        let document: Document = documents::table
            .find(document_id)
            .for_update()
            .first(conn)?;
        ensure_editable(&document, &permissions)?;

        let transitions: i64 = document_transitions::table
            .inner_join(document_workflows::table)
            .filter(document_workflows::document_id.eq(document_id))
            .select(count_star())
            .first(conn)?;
        let untouched = document.version_major == 1
            && document.version_minor == 0
            && document.supersedes_id.is_none()
            && transitions <= 1;
        if !untouched {
            return Err(AppError::conflict(
                "document has workflow history; terminate it instead",
            ));
        }

        diesel::delete(documents::table.find(document_id)).execute(conn)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "document.delete",
                RESOURCE_DOCUMENT,
                document_id,
                format!("Deleted draft {}", document.document_number),
            )
            .old(json!({
                "document_number": document.document_number,
                "title": document.title,
                "file_key": document.file_key,
            })),
            &client,
        )?;
        Ok(document)
    })?;

    if let Some(key) = removed.file_key.as_deref() {
        let shared: i64 = documents::table
            .filter(documents::file_key.eq(key))
            .count()
            .get_result(&mut conn)?;
        drop(conn);
        if shared == 0 {
            if let Err(err) = state.storage.delete_object(key).await {
                warn!(document_id = %document_id, key = %key, error = %err, "failed to delete stored file");
            }
        }
    }

    info!(document_id = %document_id, "draft document deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_dependencies(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<DependencyResponse>>> {
    let mut conn = state.db()?;
    load_document(&mut conn, document_id)?;
    Ok(Json(load_dependencies(&mut conn, document_id)?))
}

#[derive(Deserialize)]
pub struct AddDependencyRequest {
    pub depends_on_id: Uuid,
    pub dependency_type: Option<String>,
}

pub async fn add_dependency(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<AddDependencyRequest>,
) -> AppResult<(StatusCode, Json<DependencyResponse>)> {
    let dependency_type = payload
        .dependency_type
        .as_deref()
        .map(|value| value.trim().to_ascii_uppercase())
        .unwrap_or_else(|| DEPENDENCY_TYPES[0].to_string());
    if !DEPENDENCY_TYPES.contains(&dependency_type.as_str()) {
        return Err(AppError::bad_request(format!(
            "invalid dependency type '{dependency_type}'. Allowed: {}",
            DEPENDENCY_TYPES.join(", ")
        )));
    }
    if payload.depends_on_id == document_id {
        return Err(AppError::bad_request("a document cannot depend on itself"));
    }

    let mut conn = state.db()?;
    require_level(&mut conn, &user, PermissionLevel::Write)?;

    let created = conn.transaction::<_, AppError, _>(|conn| {
        let document: Document = documents::table
            .find(document_id)
            .for_update()
            .first(conn)?;
        let target: Document = documents::table
            .find(payload.depends_on_id)
            .first(conn)
            .optional()?
            .ok_or_else(|| AppError::bad_request("dependency target not found"))?;

        ensure_acyclic(conn, document_id, target.id)?;

        let dependency: DocumentDependency = diesel::insert_into(document_dependencies::table)
            .values(NewDocumentDependency {
                id: Uuid::new_v4(),
                document_id,
                depends_on_id: target.id,
                dependency_type,
                created_by: Some(user.user_id),
            })
            .get_result(conn)?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "document.add_dependency",
                RESOURCE_DOCUMENT,
                document_id,
                format!(
                    "{} now depends on {}",
                    document.document_number, target.document_number
                ),
            )
            .new_values(json!({
                "depends_on_id": target.id,
                "dependency_type": dependency.dependency_type,
            })),
            &client,
        )?;
        Ok(to_dependency_response(dependency, &target))
    })?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn remove_dependency(
    State(state): State<AppState>,
    Path((document_id, dependency_id)): Path<(Uuid, Uuid)>,
    user: AuthenticatedUser,
    client: ClientInfo,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    require_level(&mut conn, &user, PermissionLevel::Write)?;

    conn.transaction::<_, AppError, _>(|conn| {
        let dependency: DocumentDependency = document_dependencies::table
            .filter(document_dependencies::document_id.eq(document_id))
            .filter(
                document_dependencies::id
                    .eq(dependency_id)
                    .or(document_dependencies::depends_on_id.eq(dependency_id)),
            )
            .first(conn)?;
        diesel::delete(document_dependencies::table.find(dependency.id)).execute(conn)?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "document.remove_dependency",
                RESOURCE_DOCUMENT,
                document_id,
                "Dependency removed",
            )
            .old(json!({
                "depends_on_id": dependency.depends_on_id,
                "dependency_type": dependency.dependency_type,
            })),
            &client,
        )?;
        Ok(())
    })?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_dependents(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let mut conn = state.db()?;
    load_document(&mut conn, document_id)?;

    let dependents: Vec<Document> = documents::table
        .filter(
            documents::id.eq_any(
                document_dependencies::table
                    .filter(document_dependencies::depends_on_id.eq(document_id))
                    .select(document_dependencies::document_id),
            ),
        )
        .order(documents::document_number.asc())
        .load(&mut conn)?;

    let codes = type_codes(&mut conn)?;
    Ok(Json(
        dependents
            .into_iter()
            .map(|document| to_document_response(document, &codes))
            .collect(),
    ))
}

/// Predecessors through `supersedes`, the document itself, and every later version.
fn version_chain(conn: &mut PgConnection, document: Document) -> AppResult<Vec<Document>> {
    let mut chain = vec![];
    let mut seen: HashSet<Uuid> = HashSet::from([document.id]);

    let mut previous = document.supersedes_id;
    while let Some(previous_id) = previous {
        if chain.len() >= MAX_VERSION_CHAIN || !seen.insert(previous_id) {
            break;
        }
        let Some(older) = documents::table
            .find(previous_id)
            .first::<Document>(conn)
            .optional()?
        else {
            break;
        };
        previous = older.supersedes_id;
        chain.push(older);
    }

    let mut queue = VecDeque::from([document.id]);
    chain.push(document);
    while let Some(current) = queue.pop_front() {
        if chain.len() >= MAX_VERSION_CHAIN {
            break;
        }
        let newer: Vec<Document> = documents::table
            .filter(documents::supersedes_id.eq(current))
            .load(conn)?;
        for successor in newer {
            if seen.insert(successor.id) {
                queue.push_back(successor.id);
                chain.push(successor);
            }
        }
    }

    chain.sort_by(|a, b| {
        (a.version_major, a.version_minor, a.created_at)
            .cmp(&(b.version_major, b.version_minor, b.created_at))
    });
    Ok(chain)
}

pub async fn list_versions(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let mut conn = state.db()?;
    let document = load_document(&mut conn, document_id)?;
    let chain = version_chain(&mut conn, document)?;
    let codes = type_codes(&mut conn)?;
    Ok(Json(
        chain
            .into_iter()
            .map(|document| to_document_response(document, &codes))
            .collect(),
    ))
}
