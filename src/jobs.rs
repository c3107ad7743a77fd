use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::dsl::exists;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const JOB_ACTIVATE_PENDING_DOCUMENTS: &str = "activate-pending-documents";
pub const JOB_SYSTEM_HEALTH_CHECK: &str = "system-health-check";
pub const JOB_SEND_NOTIFICATION: &str = "send-notification";
pub const JOB_RUN_BACKUP: &str = "run-backup";
pub const JOB_PRUNE_BACKUPS: &str = "prune-backups";

/// A `processing` row untouched for this long belongs to a worker that died.
/// Reservation stamps `updated_at`, so that column carries the lease.
pub const PROCESSING_LEASE_SECONDS: i64 = 60 * 60;

/// Tasks that may be queued on demand through the scheduler API.
pub const TRIGGERABLE_JOBS: [&str; 3] = [
    JOB_ACTIVATE_PENDING_DOCUMENTS,
    JOB_SYSTEM_HEALTH_CHECK,
    JOB_PRUNE_BACKUPS,
];

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

impl From<JobQueueError> for AppError {
    fn from(value: JobQueueError) -> Self {
        match value {
            JobQueueError::Database(err) => AppError::from(err),
        }
    }
}

pub fn enqueue_job(
    conn: &mut PgConnection,
    job_type: &str,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> JobQueueResult<Job> {
    let new_job = NewJob {
        id: Uuid::new_v4(),
        job_type: job_type.to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        run_after: run_after.unwrap_or_else(|| Utc::now().naive_utc()),
    };

    diesel::insert_into(jobs::table)
        .values(&new_job)
        .execute(conn)?;

    let job = jobs::table.find(new_job.id).first(conn)?;
    Ok(job)
}

/// Returns stale `processing` rows of `job_types` to the queue. Returns their ids.
pub fn requeue_stale_jobs(
    conn: &mut PgConnection,
    job_types: &[&str],
    now: NaiveDateTime,
) -> JobQueueResult<Vec<Uuid>> {
    let cutoff = now - ChronoDuration::seconds(PROCESSING_LEASE_SECONDS);
    let requeued: Vec<Uuid> = diesel::update(
        jobs::table
            .filter(jobs::status.eq(STATUS_PROCESSING))
            .filter(jobs::updated_at.lt(cutoff))
            .filter(jobs::job_type.eq_any(job_types)),
    )
    .set((
        jobs::status.eq(STATUS_QUEUED),
        jobs::run_after.eq(now),
        jobs::last_error.eq(Some("processing lease expired")),
        jobs::updated_at.eq(now),
    ))
    .returning(jobs::id)
    .get_results(conn)?;

    if !requeued.is_empty() {
        warn!(jobs = ?requeued, "requeued jobs whose worker stopped responding");
    }
    Ok(requeued)
}

/// Whether a job of `job_type` is queued or held by a live worker.
pub fn has_pending_job(conn: &mut PgConnection, job_type: &str) -> JobQueueResult<bool> {
    let cutoff = Utc::now().naive_utc() - ChronoDuration::seconds(PROCESSING_LEASE_SECONDS);
    let pending = diesel::select(exists(
        jobs::table.filter(jobs::job_type.eq(job_type)).filter(
            jobs::status.eq(STATUS_QUEUED).or(jobs::status
                .eq(STATUS_PROCESSING)
                .and(jobs::updated_at.ge(cutoff))),
        ),
    ))
    .get_result(conn)?;
    Ok(pending)
}

/// Queues `job_type` unless one is already waiting or running. A run whose
/// worker died is put back on the queue and returned instead of a new row.
pub fn enqueue_unique(
    conn: &mut PgConnection,
    job_type: &str,
    payload: Value,
) -> JobQueueResult<Option<Job>> {
    let now = Utc::now().naive_utc();
    if let Some(revived) = requeue_stale_jobs(conn, &[job_type], now)?.first() {
        let job = jobs::table.find(*revived).first(conn)?;
        return Ok(Some(job));
    }
    if has_pending_job(conn, job_type)? {
        return Ok(None);
    }
    enqueue_job(conn, job_type, payload, None).map(Some)
}

pub fn reserve_job(conn: &mut PgConnection, job_types: &[&str]) -> JobQueueResult<Option<Job>> {
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        requeue_stale_jobs(conn, job_types, now).map_err(|JobQueueError::Database(err)| err)?;
        let job_opt = jobs::table
            .filter(jobs::status.eq(STATUS_QUEUED))
            .filter(jobs::run_after.le(now))
            .filter(jobs::job_type.eq_any(job_types))
            .order(jobs::run_after.asc())
            .for_update()
            .skip_locked()
            .first::<Job>(conn)
            .optional()?;

        if let Some(job) = job_opt {
            diesel::update(jobs::table.find(job.id))
                .set((
                    jobs::status.eq(STATUS_PROCESSING),
                    jobs::attempts.eq(job.attempts + 1),
                    jobs::updated_at.eq(now),
                ))
                .execute(conn)?;

            let refreshed = jobs::table.find(job.id).first(conn)?;
            Ok::<Option<Job>, diesel::result::Error>(Some(refreshed))
        } else {
            Ok::<Option<Job>, diesel::result::Error>(None)
        }
    })
    .map_err(JobQueueError::from)
}

pub fn mark_job_succeeded(conn: &mut PgConnection, job_id: Uuid) -> JobQueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_SUCCEEDED),
            jobs::last_error.eq::<Option<String>>(None),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn retry_job_after(
    conn: &mut PgConnection,
    job_id: Uuid,
    delay: Duration,
    error_message: &str,
) -> JobQueueResult<()> {
    let next_run = Utc::now()
        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_QUEUED),
            jobs::run_after.eq(next_run.naive_utc()),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_job_failed(
    conn: &mut PgConnection,
    job_id: Uuid,
    error_message: &str,
) -> JobQueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_FAILED),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn count_by_status(conn: &mut PgConnection, status: &str) -> JobQueueResult<i64> {
    let count = jobs::table
        .filter(jobs::status.eq(status))
        .count()
        .get_result(conn)?;
    Ok(count)
}

pub fn count_failed_since(conn: &mut PgConnection, since: NaiveDateTime) -> JobQueueResult<i64> {
    let count = jobs::table
        .filter(jobs::status.eq(STATUS_FAILED))
        .filter(jobs::updated_at.ge(since))
        .count()
        .get_result(conn)?;
    Ok(count)
}

pub fn recent_jobs(conn: &mut PgConnection, limit: i64) -> JobQueueResult<Vec<Job>> {
    let jobs = jobs::table
        .order(jobs::created_at.desc())
        .limit(limit)
        .load(conn)?;
    Ok(jobs)
}
