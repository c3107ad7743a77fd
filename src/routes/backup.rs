use std::path::Path as FsPath;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use super::page_bounds;
use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_BACKUP},
    auth::{permissions::require_admin, AuthenticatedUser},
    backup::{self, BackupFrequency, BackupType, PruneReport, RestoreReport, JOB_COMPLETED},
    error::{AppError, AppResult},
    models::{BackupConfiguration, BackupJob, NewBackupConfiguration},
    schema::{backup_configurations, backup_jobs},
    state::AppState,
    storage::attachment_disposition,
    utils::json::required_if_present,
};

const PACKAGE_CONTENT_TYPE: &str = "application/gzip";

fn configuration_view(configuration: &BackupConfiguration) -> Value {
    json!({
        "name": configuration.name,
        "backup_type": configuration.backup_type,
        "frequency": configuration.frequency,
        "retention_days": configuration.retention_days,
        "is_enabled": configuration.is_enabled,
    })
}

fn validate_retention(days: i32) -> AppResult<i32> {
    if days < 1 {
        return Err(AppError::bad_request("retention_days must be at least 1"));
    }
    Ok(days)
}

pub async fn list_configurations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<BackupConfiguration>>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;
    let configurations = backup_configurations::table
        .order(backup_configurations::name.asc())
        .load(&mut conn)?;
    Ok(Json(configurations))
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigurationRequest {
    pub name: String,
    pub backup_type: String,
    pub frequency: String,
    pub retention_days: i32,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_configuration(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<CreateConfigurationRequest>,
) -> AppResult<(StatusCode, Json<BackupConfiguration>)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }
    let backup_type: BackupType = payload.backup_type.parse().map_err(AppError::bad_request)?;
    let frequency: BackupFrequency = payload.frequency.parse().map_err(AppError::bad_request)?;
    let retention_days = validate_retention(payload.retention_days)?;

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let created = conn.transaction::<_, AppError, _>(|conn| {
        let created: BackupConfiguration = diesel::insert_into(backup_configurations::table)
            .values(NewBackupConfiguration {
                id: Uuid::new_v4(),
                name,
                backup_type: backup_type.as_str().to_string(),
                frequency: frequency.as_str().to_string(),
                retention_days,
                is_enabled: payload.is_enabled,
                created_by: Some(user.user_id),
            })
            .get_result(conn)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "backup.create_configuration",
                RESOURCE_BACKUP,
                created.id,
                format!("Created backup configuration {}", created.name),
            )
            .new_values(configuration_view(&created)),
            &client,
        )?;
        Ok(created)
    })?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_configuration(
    State(state): State<AppState>,
    Path(configuration_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<Value>,
) -> AppResult<Json<BackupConfiguration>> {
    let backup_type: Option<String> =
        required_if_present(&payload, "backup_type").map_err(AppError::bad_request)?;
    let frequency: Option<String> =
        required_if_present(&payload, "frequency").map_err(AppError::bad_request)?;
    let retention_days: Option<i32> =
        required_if_present(&payload, "retention_days").map_err(AppError::bad_request)?;
    let is_enabled: Option<bool> =
        required_if_present(&payload, "is_enabled").map_err(AppError::bad_request)?;

    if backup_type.is_none() && frequency.is_none() && retention_days.is_none() && is_enabled.is_none()
    {
        return Err(AppError::bad_request("no changes provided"));
    }
    let backup_type = backup_type
        .map(|value| value.parse::<BackupType>())
        .transpose()
        .map_err(AppError::bad_request)?;
    let frequency = frequency
        .map(|value| value.parse::<BackupFrequency>())
        .transpose()
        .map_err(AppError::bad_request)?;
    let retention_days = retention_days.map(validate_retention).transpose()?;

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let current: BackupConfiguration = backup_configurations::table
            .find(configuration_id)
            .for_update()
            .first(conn)?;

        let updated: BackupConfiguration =
            diesel::update(backup_configurations::table.find(configuration_id))
                .set((
                    backup_configurations::backup_type.eq(backup_type
                        .map(|kind| kind.as_str())
                        .unwrap_or(current.backup_type.as_str())),
                    backup_configurations::frequency.eq(frequency
                        .map(|frequency| frequency.as_str())
                        .unwrap_or(current.frequency.as_str())),
                    backup_configurations::retention_days
                        .eq(retention_days.unwrap_or(current.retention_days)),
                    backup_configurations::is_enabled.eq(is_enabled.unwrap_or(current.is_enabled)),
                    backup_configurations::updated_at.eq(Utc::now().naive_utc()),
                ))
                .get_result(conn)?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "backup.update_configuration",
                RESOURCE_BACKUP,
                configuration_id,
                format!("Updated backup configuration {}", updated.name),
            )
            .old(configuration_view(&current))
            .new_values(configuration_view(&updated)),
            &client,
        )?;
        Ok(updated)
    })?;

    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct BackupJobListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<BackupJobListQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<BackupJob>>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;
    let (limit, offset) = page_bounds(params.limit, params.offset);
    let jobs = backup_jobs::table
        .order((backup_jobs::created_at.desc(), backup_jobs::id.desc()))
        .limit(limit)
        .offset(offset)
        .load(&mut conn)?;
    Ok(Json(jobs))
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueBackupRequest {
    pub configuration_id: Option<Uuid>,
    pub backup_type: Option<String>,
}

/// Without a configuration the backup type defaults to FULL.
pub async fn queue_job(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    payload: Option<Json<QueueBackupRequest>>,
) -> AppResult<(StatusCode, Json<BackupJob>)> {
    let payload = payload.map(|Json(payload)| payload).unwrap_or_default();
    let requested_type = payload
        .backup_type
        .as_deref()
        .map(str::parse::<BackupType>)
        .transpose()
        .map_err(AppError::bad_request)?;

    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let configuration: Option<BackupConfiguration> = match payload.configuration_id {
        Some(id) => Some(
            backup_configurations::table
                .find(id)
                .first(&mut conn)
                .optional()?
                .ok_or_else(|| AppError::bad_request("backup configuration not found"))?,
        ),
        None => None,
    };
    let backup_type = match (requested_type, &configuration) {
        (Some(kind), _) => kind,
        (None, Some(configuration)) => configuration
            .backup_type
            .parse()
            .map_err(AppError::internal)?,
        (None, None) => BackupType::Full,
    };

    let job = backup::queue_backup(&mut conn, configuration.as_ref(), backup_type, Some(user.user_id))?;
    audit::record(
        &mut conn,
        AuditEvent::new(
            Some(user.user_id),
            "backup.queue",
            RESOURCE_BACKUP,
            job.id,
            format!("Queued {} backup {}", backup_type, job.job_name),
        )
        .new_values(json!({
            "backup_type": backup_type,
            "configuration_id": job.configuration_id,
        })),
        &client,
    )?;
    info!(backup_job_id = %job.id, backup_type = %backup_type, "backup queued");

    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<BackupJob>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;
    let job = backup_jobs::table.find(job_id).first(&mut conn)?;
    Ok(Json(job))
}

pub async fn download_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
) -> AppResult<(HeaderMap, Vec<u8>)> {
    let job: BackupJob = {
        let mut conn = state.db()?;
        require_admin(&mut conn, &user)?;
        let job: BackupJob = backup_jobs::table.find(job_id).first(&mut conn)?;
        if job.status != JOB_COMPLETED {
            return Err(AppError::conflict("backup is not available").with_detail(job.status));
        }
        audit::record(
            &mut conn,
            AuditEvent::new(
                Some(user.user_id),
                "backup.download",
                RESOURCE_BACKUP,
                job.id,
                format!("Downloaded backup {}", job.job_name),
            ),
            &client,
        )?;
        job
    };

    let path = job
        .backup_file_path
        .as_deref()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "backup file missing"))?;
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        error!(backup_job_id = %job.id, path = %path, error = %err, "failed to read backup file");
        AppError::new(StatusCode::NOT_FOUND, "backup file missing")
    })?;

    let file_name = FsPath::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("backup.tar.gz");
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PACKAGE_CONTENT_TYPE));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&attachment_disposition(file_name)).map_err(AppError::internal)?,
    );
    Ok((headers, bytes))
}

pub async fn restore(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    mut multipart: Multipart,
) -> AppResult<Json<RestoreReport>> {
    {
        let mut conn = state.db()?;
        require_admin(&mut conn, &user)?;
    }

    let mut package: Option<Vec<u8>> = None;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() != Some("package") {
            continue;
        }
        let data = field.bytes().await.map_err(|err| {
            error!(error = %err, "failed to read package bytes");
            AppError::bad_request(format!("failed to read package bytes: {err}"))
        })?;
        package = Some(data.to_vec());
    }
    let package = package
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| AppError::bad_request("package field is required"))?;

    let report = backup::restore_from_package(&state, package, false).await?;

    let mut conn = state.db()?;
    audit::record(
        &mut conn,
        AuditEvent::new(
            Some(user.user_id),
            "backup.restore",
            RESOURCE_BACKUP,
            report.package_created_at,
            format!("Restored {} package", report.backup_type),
        )
        .new_values(json!({
            "tables": report.tables,
            "storage_objects": report.storage_objects,
        })),
        &client,
    )?;
    info!(backup_type = %report.backup_type, "package restored");

    Ok(Json(report))
}

pub async fn prune(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
) -> AppResult<Json<PruneReport>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let report = backup::prune_expired_backups(&mut conn, Utc::now().naive_utc())?;
    audit::record(
        &mut conn,
        AuditEvent::new(
            Some(user.user_id),
            "backup.prune",
            RESOURCE_BACKUP,
            "retention",
            format!("Pruned {} expired backups", report.expired_jobs.len()),
        )
        .new_values(json!({ "expired_jobs": report.expired_jobs })),
        &client,
    )?;
    Ok(Json(report))
}
