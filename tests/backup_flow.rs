mod common;

use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::http::{header, StatusCode};
use chrono::{Duration, Utc};
use common::{acquire_db_lock, body_to_vec, expect_json, TestApp};
use diesel::prelude::*;
use edms::auth::permissions::PermissionLevel;
use edms::backup::{self, BackupType};
use edms::jobs::JOB_RUN_BACKUP;
use edms::schema::backup_jobs;
use serde_json::{json, Value};
use uuid::Uuid;

async fn document_with_file(app: &TestApp, author: &str, title: &str) -> Result<Uuid> {
    let sop = app.document_type_id("SOP").await?;
    let created = expect_json(
        app.post_json(
            "/api/v1/documents",
            &json!({ "title": title, "document_type_id": sop }),
            Some(author),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let id: Uuid = created["document"]["id"]
        .as_str()
        .context("document id missing")?
        .parse()?;
    expect_json(
        app.upload(
            &format!("/api/v1/documents/{id}/file"),
            "file",
            "procedure.txt",
            "text/plain",
            title.as_bytes(),
            author,
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    Ok(id)
}

async fn document_count(app: &TestApp, token: &str) -> Result<usize> {
    let listed = expect_json(app.get("/api/v1/documents", Some(token)).await?, StatusCode::OK).await?;
    Ok(listed.as_array().map(Vec::len).unwrap_or_default())
}

#[tokio::test]
async fn queued_backup_runs_downloads_and_restores() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;
    let (_, author) = app.user_with_token("author", PermissionLevel::Write).await?;
    document_with_file(&app, &author, "Original procedure").await?;

    let forbidden = app.post_empty("/api/v1/backup/jobs", Some(&author)).await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let queued = expect_json(
        app.post_empty("/api/v1/backup/jobs", Some(&admin)).await?,
        StatusCode::ACCEPTED,
    )
    .await?;
    assert_eq!(queued["status"], json!("PENDING"));
    assert_eq!(queued["backup_type"], json!("FULL"));
    let job_id: Uuid = queued["id"].as_str().context("job id missing")?.parse()?;
    assert_eq!(app.jobs_by_type(JOB_RUN_BACKUP).await?.len(), 1);

    let early = app
        .get(&format!("/api/v1/backup/jobs/{job_id}/download"), Some(&admin))
        .await?;
    assert_eq!(early.status(), StatusCode::CONFLICT);

    let finished = backup::run_backup_job(&app.state, job_id).await?;
    assert_eq!(finished.status, backup::JOB_COMPLETED);
    assert!(finished.file_size.unwrap_or_default() > 0);

    let download = app
        .get(&format!("/api/v1/backup/jobs/{job_id}/download"), Some(&admin))
        .await?;
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(
        download
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("application/gzip")
    );
    let package = body_to_vec(download.into_body()).await?;

    document_with_file(&app, &author, "Added after the backup").await?;
    assert_eq!(document_count(&app, &admin).await?, 2);
    app.storage().clear().await;

    let report: Value = expect_json(
        app.upload(
            "/api/v1/backup/restore",
            "package",
            "backup.tar.gz",
            "application/gzip",
            &package,
            &admin,
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(report["backup_type"], json!("FULL"));
    assert_eq!(report["tables"]["documents"], json!(1));
    assert_eq!(report["storage_objects"], json!(1));

    assert_eq!(document_count(&app, &admin).await?, 1);
    assert_eq!(app.storage().object_count().await, 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn files_only_package_leaves_rows_alone() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, author) = app.user_with_token("author", PermissionLevel::Write).await?;
    document_with_file(&app, &author, "Stored file").await?;

    let artifact = backup::create_backup(&app.state, BackupType::Files, None).await?;
    assert!(artifact.path.exists());
    assert_eq!(artifact.metadata.backup_type, BackupType::Files);

    document_with_file(&app, &author, "Second file").await?;
    let bytes = tokio::fs::read(&artifact.path).await?;
    let report = backup::restore_from_package(&app.state, bytes, false).await?;

    assert!(report.tables.is_empty());
    assert_eq!(report.storage_objects, 1);
    assert!(!report.storage_skipped);
    assert_eq!(document_count(&app, &author).await?, 2);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn configurations_validate_retention() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;

    let invalid = app
        .post_json(
            "/api/v1/backup/configurations",
            &json!({
                "name": "nightly",
                "backup_type": "FULL",
                "frequency": "DAILY",
                "retention_days": 0,
            }),
            Some(&admin),
        )
        .await?;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let created = expect_json(
        app.post_json(
            "/api/v1/backup/configurations",
            &json!({
                "name": "nightly",
                "backup_type": "database",
                "frequency": "daily",
                "retention_days": 14,
            }),
            Some(&admin),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(created["backup_type"], json!("DATABASE"));
    let configuration_id = created["id"].clone();

    let queued = expect_json(
        app.post_json(
            "/api/v1/backup/jobs",
            &json!({ "configuration_id": configuration_id }),
            Some(&admin),
        )
        .await?,
        StatusCode::ACCEPTED,
    )
    .await?;
    assert_eq!(queued["backup_type"], json!("DATABASE"));
    assert_eq!(queued["configuration_id"], configuration_id);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn prune_expires_backups_past_retention() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;
    let (_, author) = app.user_with_token("author", PermissionLevel::Write).await?;
    document_with_file(&app, &author, "Retained procedure").await?;

    let configuration = expect_json(
        app.post_json(
            "/api/v1/backup/configurations",
            &json!({
                "name": "short-lived",
                "backup_type": "FILES",
                "frequency": "DAILY",
                "retention_days": 1,
            }),
            Some(&admin),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let queue = json!({ "configuration_id": configuration["id"] });

    let old = expect_json(
        app.post_json("/api/v1/backup/jobs", &queue, Some(&admin))
            .await?,
        StatusCode::ACCEPTED,
    )
    .await?;
    let old_id: Uuid = old["id"].as_str().context("job id missing")?.parse()?;
    let finished = backup::run_backup_job(&app.state, old_id).await?;
    assert_eq!(finished.status, backup::JOB_COMPLETED);
    let old_path = PathBuf::from(finished.backup_file_path.context("backup file missing")?);
    assert!(old_path.exists());

    let fresh = expect_json(
        app.post_json("/api/v1/backup/jobs", &queue, Some(&admin))
            .await?,
        StatusCode::ACCEPTED,
    )
    .await?;
    let fresh_id: Uuid = fresh["id"].as_str().context("job id missing")?.parse()?;
    backup::run_backup_job(&app.state, fresh_id).await?;

    app.with_conn(move |conn| {
        diesel::update(backup_jobs::table.find(old_id))
            .set(backup_jobs::completed_at.eq(Some(Utc::now().naive_utc() - Duration::days(3))))
            .execute(conn)?;
        Ok(())
    })
    .await?;

    let forbidden = app.post_empty("/api/v1/backup/prune", Some(&author)).await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let report = expect_json(
        app.post_empty("/api/v1/backup/prune", Some(&admin)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(report["expired_jobs"], json!([old_id]));
    assert_eq!(report["files_removed"], json!(1));
    assert!(!old_path.exists());

    let expired = expect_json(
        app.get(&format!("/api/v1/backup/jobs/{old_id}"), Some(&admin))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(expired["status"], json!(backup::JOB_EXPIRED));
    let kept = expect_json(
        app.get(&format!("/api/v1/backup/jobs/{fresh_id}"), Some(&admin))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(kept["status"], json!(backup::JOB_COMPLETED));

    let repeat = expect_json(
        app.post_empty("/api/v1/backup/prune", Some(&admin)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(repeat["expired_jobs"], json!([]));

    app.cleanup().await?;
    Ok(())
}
