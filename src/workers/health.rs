use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{error, info, warn};

use super::{JobExecution, JobHandler};
use crate::{
    jobs::{count_by_status, count_failed_since, JOB_SYSTEM_HEALTH_CHECK, STATUS_QUEUED},
    models::Job,
    settings::{self, LAST_HEALTH_CHECK},
    state::AppState,
};

/// Queue depth above which the system reports degraded.
pub const QUEUE_DEPTH_WARNING: i64 = 100;
/// Failed jobs in the last day above which the system reports degraded.
pub const FAILED_JOBS_WARNING: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: String,
    pub checked_at: NaiveDateTime,
    pub database: bool,
    pub queued_jobs: i64,
    pub failed_jobs_24h: i64,
    pub issues: Vec<String>,
}

pub fn evaluate(
    checked_at: NaiveDateTime,
    database: bool,
    queued_jobs: i64,
    failed_jobs_24h: i64,
) -> HealthReport {
    let mut issues = Vec::new();
    if !database {
        issues.push("database unreachable".to_string());
    }
    if queued_jobs > QUEUE_DEPTH_WARNING {
        issues.push(format!("{queued_jobs} jobs waiting in queue"));
    }
    if failed_jobs_24h > FAILED_JOBS_WARNING {
        issues.push(format!("{failed_jobs_24h} jobs failed in the last 24h"));
    }

    let status = if !database {
        "unhealthy"
    } else if issues.is_empty() {
        "healthy"
    } else {
        "degraded"
    };

    HealthReport {
        status: status.to_string(),
        checked_at,
        database,
        queued_jobs,
        failed_jobs_24h,
        issues,
    }
}

pub fn database_reachable(conn: &mut PgConnection) -> bool {
    diesel::sql_query("SELECT 1").execute(conn).is_ok()
}

/// Checks the system and stores the result under the last-health-check setting.
pub fn run_health_check(state: &AppState) -> Result<HealthReport, String> {
    let now = Utc::now().naive_utc();
    let mut conn = match state.db() {
        Ok(conn) => conn,
        Err(err) => {
            warn!(error = %err, "health check could not reach the database");
            return Ok(evaluate(now, false, 0, 0));
        }
    };

    let database = database_reachable(&mut conn);
    let queued = count_by_status(&mut conn, STATUS_QUEUED).map_err(|err| err.to_string())?;
    let failed = count_failed_since(&mut conn, now - ChronoDuration::hours(24))
        .map_err(|err| err.to_string())?;
    let report = evaluate(now, database, queued, failed);

    let value = serde_json::to_value(&report).map_err(|err| err.to_string())?;
    settings::upsert(
        &mut conn,
        LAST_HEALTH_CHECK,
        value,
        Some("Result of the most recent scheduled health check"),
        None,
    )
    .map_err(|err| err.to_string())?;

    Ok(report)
}

pub struct SystemHealthCheckJob;

impl SystemHealthCheckJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemHealthCheckJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for SystemHealthCheckJob {
    fn job_type(&self) -> &'static str {
        JOB_SYSTEM_HEALTH_CHECK
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        match task::spawn_blocking(move || run_health_check(&state)).await {
            Ok(Ok(report)) => {
                if report.issues.is_empty() {
                    info!(job_id = %job.id, status = %report.status, "health check passed");
                } else {
                    warn!(job_id = %job.id, status = %report.status, issues = ?report.issues, "health check found issues");
                }
                JobExecution::Success
            }
            Ok(Err(err)) => JobExecution::Retry {
                delay: Duration::from_secs(60),
                error: err,
            },
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "health check task panicked");
                JobExecution::Failed {
                    error: format!("worker panicked: {join_err}"),
                }
            }
        }
    }
}
