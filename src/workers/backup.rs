use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::task;
use tracing::{error, info};
use uuid::Uuid;

use super::{JobExecution, JobHandler};
use crate::{
    backup::{self, BackupError},
    jobs::{JOB_PRUNE_BACKUPS, JOB_RUN_BACKUP},
    models::Job,
    state::AppState,
};

#[derive(Debug, Deserialize)]
struct RunBackupPayload {
    backup_job_id: Uuid,
}

pub struct RunBackupJob;

impl RunBackupJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RunBackupJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for RunBackupJob {
    fn job_type(&self) -> &'static str {
        JOB_RUN_BACKUP
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: RunBackupPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid backup payload: {err}"),
                }
            }
        };

        match backup::run_backup_job(&state, payload.backup_job_id).await {
            Ok(record) => {
                info!(
                    job_id = %job.id,
                    backup_job_id = %record.id,
                    status = %record.status,
                    "backup job finished"
                );
                JobExecution::Success
            }
            // Pool errors leave the row PENDING, so a later attempt can still run it.
            Err(err @ BackupError::Unavailable(_)) => JobExecution::Retry {
                delay: Duration::from_secs(120),
                error: err.to_string(),
            },
            Err(err) => JobExecution::Failed {
                error: err.to_string(),
            },
        }
    }
}

pub struct PruneBackupsJob;

impl PruneBackupsJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PruneBackupsJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for PruneBackupsJob {
    fn job_type(&self) -> &'static str {
        JOB_PRUNE_BACKUPS
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let outcome = task::spawn_blocking(move || {
            let mut conn = state.db().map_err(|err| err.to_string())?;
            backup::prune_expired_backups(&mut conn, Utc::now().naive_utc())
                .map_err(|err| err.to_string())
        })
        .await;

        match outcome {
            Ok(Ok(report)) => {
                info!(job_id = %job.id, expired = report.expired_jobs.len(), "backup retention applied");
                JobExecution::Success
            }
            Ok(Err(err)) => JobExecution::Retry {
                delay: Duration::from_secs(300),
                error: err,
            },
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "prune task panicked");
                JobExecution::Failed {
                    error: format!("worker panicked: {join_err}"),
                }
            }
        }
    }
}
