use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task;
use tracing::{error, info};

use super::{JobExecution, JobHandler};
use crate::{
    jobs::JOB_ACTIVATE_PENDING_DOCUMENTS,
    models::Job,
    state::AppState,
    workflow::service::{activate_due_documents, today},
};

pub struct ActivatePendingDocumentsJob;

impl ActivatePendingDocumentsJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ActivatePendingDocumentsJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ActivatePendingDocumentsJob {
    fn job_type(&self) -> &'static str {
        JOB_ACTIVATE_PENDING_DOCUMENTS
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let outcome = task::spawn_blocking(move || {
            let mut conn = state.db().map_err(|err| err.to_string())?;
            activate_due_documents(&mut conn, today(), false).map_err(|err| err.to_string())
        })
        .await;

        match outcome {
            Ok(Ok(report)) => {
                info!(
                    job_id = %job.id,
                    activated = report.activated.len(),
                    obsoleted = report.obsoleted.len(),
                    failed = report.failed.len(),
                    "scheduled document transitions applied"
                );
                JobExecution::Success
            }
            Ok(Err(err)) => JobExecution::Retry {
                delay: Duration::from_secs(60),
                error: err,
            },
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "activation task panicked");
                JobExecution::Failed {
                    error: format!("worker panicked: {join_err}"),
                }
            }
        }
    }
}
