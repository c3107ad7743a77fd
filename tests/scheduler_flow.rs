mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, Utc};
use common::{acquire_db_lock, expect_json, TestApp};
use diesel::prelude::*;
use edms::auth::permissions::PermissionLevel;
use edms::jobs::{
    self, JOB_PRUNE_BACKUPS, JOB_RUN_BACKUP, JOB_SYSTEM_HEALTH_CHECK, PROCESSING_LEASE_SECONDS,
    STATUS_PROCESSING, STATUS_QUEUED, STATUS_SUCCEEDED,
};
use edms::schema::jobs as jobs_table;
use edms::settings::{self, LAST_DAILY_RUN, LAST_HEALTH_CHECK};
use edms::{default_handlers, scheduler, Worker};
use serde_json::json;

#[tokio::test]
async fn trigger_queues_once_and_status_reports_the_run() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;
    let (_, author) = app.user_with_token("author", PermissionLevel::Write).await?;
    let path = format!("/api/v1/scheduler/trigger/{JOB_SYSTEM_HEALTH_CHECK}");

    let forbidden = app.post_empty(&path, Some(&author)).await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let unknown = app
        .post_empty("/api/v1/scheduler/trigger/reindex-everything", Some(&admin))
        .await?;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

    let first = expect_json(app.post_empty(&path, Some(&admin)).await?, StatusCode::ACCEPTED).await?;
    assert_eq!(first["task"], json!(JOB_SYSTEM_HEALTH_CHECK));
    assert_eq!(first["queued"], json!(true));
    assert_eq!(first["job"]["status"], json!(STATUS_QUEUED));

    let second = expect_json(app.post_empty(&path, Some(&admin)).await?, StatusCode::ACCEPTED).await?;
    assert_eq!(second["queued"], json!(false));
    assert!(second["job"].is_null());
    assert_eq!(app.jobs_by_type(JOB_SYSTEM_HEALTH_CHECK).await?.len(), 1);

    let worker = Worker::new(
        Arc::new(app.state.clone()),
        default_handlers(),
        Duration::from_millis(10),
    );
    assert_eq!(worker.drain().await?, 1);

    let stored = app
        .with_conn(|conn| Ok(settings::get(conn, LAST_HEALTH_CHECK)?))
        .await?
        .context("health check result not stored")?;
    assert_eq!(stored.value["status"], json!("healthy"));
    assert_eq!(stored.value["database"], json!(true));

    let status = expect_json(
        app.get("/api/v1/scheduler/status", Some(&author)).await?,
        StatusCode::OK,
    )
    .await?;
    let task = &status["tasks"][JOB_SYSTEM_HEALTH_CHECK];
    assert_eq!(task["last_status"], json!(STATUS_SUCCEEDED));
    assert_eq!(task["attempts"], json!(1));
    assert_eq!(task["recent_runs"], json!(1));
    assert_eq!(status["last_health_check"]["status"], json!("healthy"));
    assert!(status["last_daily_run"].is_null());

    let anonymous = app.get("/api/v1/scheduler/status", None).await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn daily_pass_queues_backups_and_retention_once() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;

    expect_json(
        app.post_json(
            "/api/v1/backup/configurations",
            &json!({
                "name": "nightly",
                "backup_type": "FULL",
                "frequency": "DAILY",
                "retention_days": 7,
            }),
            Some(&admin),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    expect_json(
        app.post_json(
            "/api/v1/backup/configurations",
            &json!({
                "name": "paused",
                "backup_type": "DATABASE",
                "frequency": "DAILY",
                "retention_days": 7,
                "is_enabled": false,
            }),
            Some(&admin),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let now = Utc::now().naive_utc();
    let report = app
        .with_conn(move |conn| Ok(scheduler::run_daily(conn, now)?))
        .await?;
    assert_eq!(report.backups_queued, vec!["nightly".to_string()]);
    assert!(report.prune_queued);
    assert_eq!(app.jobs_by_type(JOB_RUN_BACKUP).await?.len(), 1);
    assert_eq!(app.jobs_by_type(JOB_PRUNE_BACKUPS).await?.len(), 1);

    let recorded = app
        .with_conn(|conn| Ok(settings::get(conn, LAST_DAILY_RUN)?))
        .await?
        .context("daily run not recorded")?;
    assert_eq!(recorded.value["date"], json!(now.date()));
    assert!(!scheduler::daily_run_due(Some(now.date()), now.date()));

    // The backup is still pending and retention is still queued.
    let again = app
        .with_conn(move |conn| Ok(scheduler::run_daily(conn, now)?))
        .await?;
    assert!(again.backups_queued.is_empty());
    assert!(!again.prune_queued);
    assert_eq!(app.jobs_by_type(JOB_RUN_BACKUP).await?.len(), 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn stale_processing_job_no_longer_blocks_the_queue() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.with_conn(|conn| {
        let queued = jobs::enqueue_unique(conn, JOB_SYSTEM_HEALTH_CHECK, json!({}))?
            .context("first enqueue should insert")?;
        let reserved = jobs::reserve_job(conn, &[JOB_SYSTEM_HEALTH_CHECK])?
            .context("job should be reserved")?;
        assert_eq!(reserved.id, queued.id);
        assert_eq!(reserved.status, STATUS_PROCESSING);

        // A live worker holds it.
        assert!(jobs::enqueue_unique(conn, JOB_SYSTEM_HEALTH_CHECK, json!({}))?.is_none());
        assert!(jobs::has_pending_job(conn, JOB_SYSTEM_HEALTH_CHECK)?);

        let abandoned =
            Utc::now().naive_utc() - ChronoDuration::seconds(PROCESSING_LEASE_SECONDS * 2);
        diesel::update(jobs_table::table.find(queued.id))
            .set(jobs_table::updated_at.eq(abandoned))
            .execute(conn)?;
        assert!(!jobs::has_pending_job(conn, JOB_SYSTEM_HEALTH_CHECK)?);

        let revived = jobs::enqueue_unique(conn, JOB_SYSTEM_HEALTH_CHECK, json!({}))?
            .context("stale job should be requeued")?;
        assert_eq!(revived.id, queued.id);
        assert_eq!(revived.status, STATUS_QUEUED);
        assert_eq!(revived.last_error.as_deref(), Some("processing lease expired"));

        let rows: i64 = jobs_table::table
            .filter(jobs_table::job_type.eq(JOB_SYSTEM_HEALTH_CHECK))
            .count()
            .get_result(conn)?;
        assert_eq!(rows, 1);

        // A second crash is picked up by the next reservation.
        jobs::reserve_job(conn, &[JOB_SYSTEM_HEALTH_CHECK])?.context("job should be reserved")?;
        diesel::update(jobs_table::table.find(queued.id))
            .set(jobs_table::updated_at.eq(abandoned))
            .execute(conn)?;
        let retaken = jobs::reserve_job(conn, &[JOB_SYSTEM_HEALTH_CHECK])?
            .context("stale job should be reserved again")?;
        assert_eq!(retaken.id, queued.id);
        assert_eq!(retaken.status, STATUS_PROCESSING);
        assert_eq!(retaken.attempts, 3);
        Ok(())
    })
    .await?;

    app.cleanup().await?;
    Ok(())
}
