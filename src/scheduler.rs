//! Periodic enqueueing of maintenance jobs. Execution happens in the worker.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::PgConnection;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{task, time::sleep};
use tracing::{error, info, warn};

use crate::{
    backup::{self, BackupType},
    error::{AppError, AppResult},
    jobs::{
        enqueue_unique, recent_jobs, JOB_ACTIVATE_PENDING_DOCUMENTS, JOB_PRUNE_BACKUPS,
        JOB_SYSTEM_HEALTH_CHECK, TRIGGERABLE_JOBS,
    },
    models::Job,
    settings::{self, LAST_DAILY_RUN, LAST_HEALTH_CHECK},
    state::AppState,
};

const TICK: Duration = Duration::from_secs(15);
const STATUS_WINDOW: i64 = 200;

/// Whether a task last enqueued at `last` is due again at `now`.
pub fn interval_elapsed(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= interval,
    }
}

/// The daily pass runs once per calendar day (UTC).
pub fn daily_run_due(last_run: Option<NaiveDate>, today: NaiveDate) -> bool {
    last_run.map_or(true, |last| last < today)
}

fn last_daily_run(conn: &mut PgConnection) -> AppResult<Option<NaiveDate>> {
    let stored = settings::get(conn, LAST_DAILY_RUN)?;
    Ok(stored
        .and_then(|setting| setting.value.get("date").cloned())
        .and_then(|date| serde_json::from_value(date).ok()))
}

#[derive(Debug, Default, Serialize)]
pub struct DailyRunReport {
    pub backups_queued: Vec<String>,
    pub prune_queued: bool,
}

/// Queues due backups and retention, then records the day as done.
pub fn run_daily(conn: &mut PgConnection, now: NaiveDateTime) -> AppResult<DailyRunReport> {
    let mut report = DailyRunReport::default();

    for configuration in backup::due_configurations(conn, now)? {
        let backup_type: BackupType = match configuration.backup_type.parse() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(configuration = %configuration.name, error = %err, "skipping backup configuration");
                continue;
            }
        };
        backup::queue_backup(conn, Some(&configuration), backup_type, None)?;
        report.backups_queued.push(configuration.name);
    }

    report.prune_queued = enqueue_unique(conn, JOB_PRUNE_BACKUPS, json!({}))?.is_some();

    settings::upsert(
        conn,
        LAST_DAILY_RUN,
        json!({
            "date": now.date(),
            "backups_queued": report.backups_queued,
        }),
        Some("Date of the last daily scheduler pass"),
        None,
    )?;

    Ok(report)
}

/// Queues one of the periodic tasks now. `None` means one is already waiting.
pub fn trigger(conn: &mut PgConnection, task: &str) -> AppResult<Option<Job>> {
    if !TRIGGERABLE_JOBS.contains(&task) {
        return Err(AppError::bad_request(format!(
            "unknown task '{task}'. Allowed: {}",
            TRIGGERABLE_JOBS.join(", ")
        )));
    }
    Ok(enqueue_unique(conn, task, json!({ "triggered": true }))?)
}

#[derive(Debug, Serialize)]
pub struct TaskStatus {
    pub last_status: String,
    pub last_run_at: NaiveDateTime,
    pub last_error: Option<String>,
    pub attempts: i32,
    pub recent_runs: usize,
}

#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    pub tasks: BTreeMap<String, TaskStatus>,
    pub last_health_check: Option<Value>,
    pub last_daily_run: Option<Value>,
}

pub fn status(conn: &mut PgConnection) -> AppResult<SchedulerStatus> {
    let jobs = recent_jobs(conn, STATUS_WINDOW)?;
    let mut tasks: BTreeMap<String, TaskStatus> = BTreeMap::new();
    // Newest first, so the first row seen per type is its latest run.
    for job in jobs {
        tasks
            .entry(job.job_type.clone())
            .and_modify(|task| task.recent_runs += 1)
            .or_insert(TaskStatus {
                last_status: job.status,
                last_run_at: job.updated_at,
                last_error: job.last_error,
                attempts: job.attempts,
                recent_runs: 1,
            });
    }

    Ok(SchedulerStatus {
        tasks,
        last_health_check: settings::get(conn, LAST_HEALTH_CHECK)?.map(|setting| setting.value),
        last_daily_run: settings::get(conn, LAST_DAILY_RUN)?.map(|setting| setting.value),
    })
}

struct PeriodicTask {
    job_type: &'static str,
    interval: Duration,
    last: Option<Instant>,
}

pub struct Scheduler {
    state: Arc<AppState>,
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        let tasks = vec![
            PeriodicTask {
                job_type: JOB_ACTIVATE_PENDING_DOCUMENTS,
                interval: Duration::from_secs(state.config.activation_interval_seconds.max(1)),
                last: None,
            },
            PeriodicTask {
                job_type: JOB_SYSTEM_HEALTH_CHECK,
                interval: Duration::from_secs(state.config.health_check_interval_seconds.max(1)),
                last: None,
            },
        ];
        Self { state, tasks }
    }

    pub async fn run(mut self) {
        info!(tasks = self.tasks.len(), "scheduler started");
        loop {
            self.tick().await;
            sleep(TICK).await;
        }
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        let due: Vec<&'static str> = self
            .tasks
            .iter()
            .filter(|task| interval_elapsed(task.last, task.interval, now))
            .map(|task| task.job_type)
            .collect();

        let state = self.state.clone();
        let outcome = task::spawn_blocking(move || -> AppResult<Vec<&'static str>> {
            let mut conn = state.db()?;
            let mut queued = Vec::new();
            for job_type in &due {
                if enqueue_unique(&mut conn, job_type, json!({}))?.is_some() {
                    queued.push(*job_type);
                }
            }
            if !queued.is_empty() {
                info!(jobs = ?queued, "periodic jobs queued");
            }

            let now = Utc::now().naive_utc();
            if daily_run_due(last_daily_run(&mut conn)?, now.date()) {
                let report = run_daily(&mut conn, now)?;
                info!(
                    backups = report.backups_queued.len(),
                    prune = report.prune_queued,
                    "daily scheduler pass queued"
                );
            }
            Ok(due)
        })
        .await;

        match outcome {
            Ok(Ok(handled)) => {
                for task in self.tasks.iter_mut() {
                    if handled.contains(&task.job_type) {
                        task.last = Some(now);
                    }
                }
            }
            Ok(Err(err)) => warn!(error = %err, "scheduler tick failed"),
            Err(join_err) => error!(error = %join_err, "scheduler tick panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_is_always_due() {
        assert!(interval_elapsed(None, Duration::from_secs(300), Instant::now()));
    }

    #[test]
    fn waits_for_the_full_interval() {
        let start = Instant::now();
        let interval = Duration::from_secs(300);
        assert!(!interval_elapsed(Some(start), interval, start + Duration::from_secs(299)));
        assert!(interval_elapsed(Some(start), interval, start + interval));
    }

    #[test]
    fn daily_pass_runs_once_per_day() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2026, 3, 13).unwrap();
        assert!(daily_run_due(None, today));
        assert!(daily_run_due(Some(yesterday), today));
        assert!(!daily_run_due(Some(today), today));
    }
}
