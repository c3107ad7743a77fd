//! Migration packages: export, restore, scheduling and retention of backups.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    str::FromStr,
};

use chrono::{Duration, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    jobs::{enqueue_job, JobQueueError, JOB_RUN_BACKUP},
    models::{BackupConfiguration, BackupJob, NewBackupJob},
    schema::{backup_configurations, backup_jobs},
    state::AppState,
};

pub mod fixture;
pub mod package;

use fixture::Fixture;
use package::{Package, PackageMetadata};

pub const JOB_PENDING: &str = "PENDING";
pub const JOB_RUNNING: &str = "RUNNING";
pub const JOB_COMPLETED: &str = "COMPLETED";
pub const JOB_FAILED: &str = "FAILED";
pub const JOB_EXPIRED: &str = "EXPIRED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupType {
    Database,
    Files,
    Full,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Database => "DATABASE",
            BackupType::Files => "FILES",
            BackupType::Full => "FULL",
        }
    }

    pub fn includes_database(self) -> bool {
        matches!(self, BackupType::Database | BackupType::Full)
    }

    pub fn includes_storage(self) -> bool {
        matches!(self, BackupType::Files | BackupType::Full)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DATABASE" => Ok(BackupType::Database),
            "FILES" => Ok(BackupType::Files),
            "FULL" => Ok(BackupType::Full),
            _ => Err(format!(
                "invalid backup type '{value}'. Allowed: DATABASE, FILES, FULL"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupFrequency {
    Daily,
    Weekly,
    Monthly,
    OnDemand,
}

impl BackupFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupFrequency::Daily => "DAILY",
            BackupFrequency::Weekly => "WEEKLY",
            BackupFrequency::Monthly => "MONTHLY",
            BackupFrequency::OnDemand => "ON_DEMAND",
        }
    }

    pub fn period(self) -> Option<Duration> {
        match self {
            BackupFrequency::Daily => Some(Duration::days(1)),
            BackupFrequency::Weekly => Some(Duration::days(7)),
            BackupFrequency::Monthly => Some(Duration::days(30)),
            BackupFrequency::OnDemand => None,
        }
    }
}

impl FromStr for BackupFrequency {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DAILY" => Ok(BackupFrequency::Daily),
            "WEEKLY" => Ok(BackupFrequency::Weekly),
            "MONTHLY" => Ok(BackupFrequency::Monthly),
            "ON_DEMAND" => Ok(BackupFrequency::OnDemand),
            _ => Err(format!(
                "invalid frequency '{value}'. Allowed: DAILY, WEEKLY, MONTHLY, ON_DEMAND"
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup package: {0}")]
    InvalidPackage(String),
    #[error("checksum mismatch for {entry}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        entry: String,
        expected: String,
        actual: String,
    },
    #[error("row count mismatch for {table}: expected {expected}, found {actual}")]
    CountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Unavailable(String),
}

pub type BackupResult<T> = Result<T, BackupError>;

impl From<AppError> for BackupError {
    fn from(value: AppError) -> Self {
        BackupError::Unavailable(value.message().to_string())
    }
}

impl From<JobQueueError> for BackupError {
    fn from(value: JobQueueError) -> Self {
        match value {
            JobQueueError::Database(err) => BackupError::Database(err),
        }
    }
}

impl From<BackupError> for AppError {
    fn from(value: BackupError) -> Self {
        match value {
            BackupError::InvalidPackage(message) => AppError::bad_request(message),
            err @ BackupError::ChecksumMismatch { .. } => AppError::bad_request(err.to_string()),
            BackupError::Database(err) => AppError::from(err),
            other => AppError::internal(other),
        }
    }
}

pub fn backup_file_name(at: NaiveDateTime) -> String {
    format!("edms-backup-{}.tar.gz", at.format("%Y%m%d-%H%M%S-%3f"))
}

/// Collects rows and stored files for a package of `backup_type`.
pub async fn build_package(state: &AppState, backup_type: BackupType) -> BackupResult<Package> {
    let fixture = {
        let mut conn = state.db()?;
        fixture::export(&mut conn)?
    };
    let keys = fixture.storage_keys();

    let (counts, database) = if backup_type.includes_database() {
        (fixture.counts(), serde_json::to_vec(&fixture)?)
    } else {
        let empty = Fixture::default();
        (empty.counts(), serde_json::to_vec(&empty)?)
    };

    let mut storage = Vec::new();
    if backup_type.includes_storage() {
        for key in keys {
            let bytes = state
                .storage
                .get_object(&key)
                .await
                .map_err(|err| BackupError::Storage(format!("{key}: {err}")))?;
            storage.push((key, bytes));
        }
    }

    Ok(Package::new(
        backup_type,
        Utc::now().naive_utc(),
        counts,
        database,
        storage,
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub metadata: PackageMetadata,
}

/// Builds a package and writes it to `output`, or into the backup directory.
pub async fn create_backup(
    state: &AppState,
    backup_type: BackupType,
    output: Option<PathBuf>,
) -> BackupResult<BackupArtifact> {
    let built = build_package(state, backup_type).await?;
    let (bytes, metadata) = tokio::task::spawn_blocking(move || {
        package::encode(&built).map(|bytes| (bytes, built.metadata))
    })
    .await
    .map_err(|err| BackupError::Unavailable(format!("backup task panicked: {err}")))??;

    let path = output.unwrap_or_else(|| {
        state
            .config
            .backup_dir
            .join(backup_file_name(metadata.created_at))
    });
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let checksum = package::sha256_hex(&bytes);
    let size = bytes.len() as u64;
    tokio::fs::write(&path, bytes).await?;

    info!(
        path = %path.display(),
        size,
        backup_type = %backup_type,
        "backup package written"
    );

    Ok(BackupArtifact {
        path,
        size,
        checksum,
        metadata,
    })
}

/// Records a PENDING backup job and queues its execution.
pub fn queue_backup(
    conn: &mut PgConnection,
    configuration: Option<&BackupConfiguration>,
    backup_type: BackupType,
    triggered_by: Option<Uuid>,
) -> BackupResult<BackupJob> {
    let now = Utc::now().naive_utc();
    let job_name = match configuration {
        Some(configuration) => format!("{} {}", configuration.name, now.format("%Y-%m-%d %H:%M")),
        None => format!("manual {} {}", backup_type, now.format("%Y-%m-%d %H:%M")),
    };

    conn.transaction::<_, BackupError, _>(|conn| {
        let job: BackupJob = diesel::insert_into(backup_jobs::table)
            .values(NewBackupJob {
                id: Uuid::new_v4(),
                configuration_id: configuration.map(|configuration| configuration.id),
                job_name,
                backup_type: backup_type.as_str().to_string(),
                status: JOB_PENDING.to_string(),
                triggered_by,
            })
            .get_result(conn)?;
        enqueue_job(conn, JOB_RUN_BACKUP, json!({ "backup_job_id": job.id }), None)?;
        Ok(job)
    })
}

/// Runs a queued backup job through RUNNING to COMPLETED or FAILED.
pub async fn run_backup_job(state: &AppState, backup_job_id: Uuid) -> BackupResult<BackupJob> {
    let job: BackupJob = {
        let mut conn = state.db()?;
        backup_jobs::table.find(backup_job_id).first(&mut conn)?
    };
    if job.status != JOB_PENDING {
        info!(backup_job_id = %job.id, status = %job.status, "backup job already handled");
        return Ok(job);
    }
    let backup_type: BackupType = job
        .backup_type
        .parse()
        .map_err(BackupError::InvalidPackage)?;

    let started_at = Utc::now().naive_utc();
    {
        let mut conn = state.db()?;
        diesel::update(backup_jobs::table.find(job.id))
            .set((
                backup_jobs::status.eq(JOB_RUNNING),
                backup_jobs::started_at.eq(Some(started_at)),
            ))
            .execute(&mut conn)?;
    }

    let result = create_backup(state, backup_type, None).await;
    let completed_at = Utc::now().naive_utc();
    let duration = (completed_at - started_at).num_seconds().max(0) as i32;
    let mut conn = state.db()?;

    match result {
        Ok(artifact) => {
            let updated = diesel::update(backup_jobs::table.find(job.id))
                .set((
                    backup_jobs::status.eq(JOB_COMPLETED),
                    backup_jobs::backup_file_path.eq(Some(artifact.path.display().to_string())),
                    backup_jobs::file_size.eq(Some(artifact.size as i64)),
                    backup_jobs::checksum.eq(Some(artifact.checksum)),
                    backup_jobs::completed_at.eq(Some(completed_at)),
                    backup_jobs::duration_seconds.eq(Some(duration)),
                ))
                .get_result(&mut conn)?;
            Ok(updated)
        }
        Err(err) => {
            diesel::update(backup_jobs::table.find(job.id))
                .set((
                    backup_jobs::status.eq(JOB_FAILED),
                    backup_jobs::error_message.eq(Some(err.to_string())),
                    backup_jobs::completed_at.eq(Some(completed_at)),
                    backup_jobs::duration_seconds.eq(Some(duration)),
                ))
                .execute(&mut conn)?;
            Err(err)
        }
    }
}

pub fn verify_counts(
    expected: &BTreeMap<String, usize>,
    actual: &BTreeMap<String, usize>,
) -> BackupResult<()> {
    for (table, expected) in expected {
        let found = actual.get(table).copied().unwrap_or(0);
        if found != *expected {
            return Err(BackupError::CountMismatch {
                table: table.clone(),
                expected: *expected,
                actual: found,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct RestoreReport {
    pub backup_type: BackupType,
    pub package_created_at: NaiveDateTime,
    pub tables: BTreeMap<String, usize>,
    pub storage_objects: usize,
    pub storage_skipped: bool,
}

/// Replaces domain data (and stored files) with the contents of a package.
pub async fn restore_from_package(
    state: &AppState,
    bytes: Vec<u8>,
    skip_storage: bool,
) -> BackupResult<RestoreReport> {
    let unpacked = tokio::task::spawn_blocking(move || package::read_package(bytes.as_slice()))
        .await
        .map_err(|err| BackupError::Unavailable(format!("restore task panicked: {err}")))??;
    unpacked.validate()?;
    let metadata = unpacked.metadata.clone();

    let fixture: Fixture = serde_json::from_slice(&unpacked.database)
        .map_err(|err| BackupError::InvalidPackage(format!("invalid database.json: {err}")))?;
    let content_types: HashMap<String, String> = fixture
        .documents
        .iter()
        .filter_map(|document| {
            Some((document.file_key.clone()?, document.file_content_type.clone()?))
        })
        .collect();

    let mut tables = BTreeMap::new();
    if metadata.backup_type.includes_database() {
        verify_counts(&metadata.table_counts, &fixture.counts())?;

        let mut conn = state.db()?;
        tables = conn.transaction::<_, BackupError, _>(|conn| {
            fixture::truncate_domain_tables(conn)?;
            fixture::import(conn, &fixture)?;
            let restored = fixture::table_counts(conn)?;
            verify_counts(&metadata.table_counts, &restored)?;
            Ok(restored)
        })?;
        info!(tables = tables.len(), "database restored from package");
    }

    let storage_skipped = skip_storage || !metadata.backup_type.includes_storage();
    let mut storage_objects = 0;
    if !storage_skipped {
        for (key, bytes) in unpacked.storage {
            let content_type = content_types.get(&key).cloned().or_else(|| {
                mime_guess::from_path(&key)
                    .first()
                    .map(|mime| mime.to_string())
            });
            state
                .storage
                .put_object(&key, bytes, content_type, None)
                .await
                .map_err(|err| BackupError::Storage(format!("{key}: {err}")))?;
            storage_objects += 1;
        }
        info!(storage_objects, "storage restored from package");
    }

    Ok(RestoreReport {
        backup_type: metadata.backup_type,
        package_created_at: metadata.created_at,
        tables,
        storage_objects,
        storage_skipped,
    })
}

/// Whether a configuration with `frequency`, last completed at `last_completed`, should run.
/// Runs are allowed an hour early so a daily tick never drifts a whole day.
pub fn is_due(
    frequency: BackupFrequency,
    last_completed: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> bool {
    let Some(period) = frequency.period() else {
        return false;
    };
    match last_completed {
        None => true,
        Some(last) => now - last >= period - Duration::hours(1),
    }
}

pub fn due_configurations(
    conn: &mut PgConnection,
    now: NaiveDateTime,
) -> BackupResult<Vec<BackupConfiguration>> {
    let configurations: Vec<BackupConfiguration> = backup_configurations::table
        .filter(backup_configurations::is_enabled.eq(true))
        .order(backup_configurations::name.asc())
        .load(conn)?;

    let mut due = Vec::new();
    for configuration in configurations {
        let Ok(frequency) = configuration.frequency.parse::<BackupFrequency>() else {
            warn!(configuration = %configuration.name, "unknown backup frequency");
            continue;
        };

        let in_flight: i64 = backup_jobs::table
            .filter(backup_jobs::configuration_id.eq(configuration.id))
            .filter(backup_jobs::status.eq_any([JOB_PENDING, JOB_RUNNING]))
            .count()
            .get_result(conn)?;
        if in_flight > 0 {
            continue;
        }

        let last_completed: Option<NaiveDateTime> = backup_jobs::table
            .filter(backup_jobs::configuration_id.eq(configuration.id))
            .filter(backup_jobs::status.eq_any([JOB_COMPLETED, JOB_EXPIRED]))
            .select(diesel::dsl::max(backup_jobs::completed_at))
            .first(conn)?;

        if is_due(frequency, last_completed, now) {
            due.push(configuration);
        }
    }
    Ok(due)
}

#[derive(Debug, Default, Serialize)]
pub struct PruneReport {
    pub expired_jobs: Vec<Uuid>,
    pub files_removed: usize,
}

/// Deletes completed packages older than their configuration's retention.
pub fn prune_expired_backups(
    conn: &mut PgConnection,
    now: NaiveDateTime,
) -> BackupResult<PruneReport> {
    let configurations: Vec<BackupConfiguration> = backup_configurations::table.load(conn)?;
    let mut report = PruneReport::default();

    for configuration in configurations {
        let cutoff = now - Duration::days(i64::from(configuration.retention_days));
        let expired: Vec<BackupJob> = backup_jobs::table
            .filter(backup_jobs::configuration_id.eq(configuration.id))
            .filter(backup_jobs::status.eq(JOB_COMPLETED))
            .filter(backup_jobs::completed_at.lt(cutoff))
            .load(conn)?;

        for job in expired {
            if let Some(path) = &job.backup_file_path {
                match std::fs::remove_file(path) {
                    Ok(()) => report.files_removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(backup_job_id = %job.id, path = %path, error = %err, "failed to remove backup file");
                        continue;
                    }
                }
            }
            diesel::update(backup_jobs::table.find(job.id))
                .set(backup_jobs::status.eq(JOB_EXPIRED))
                .execute(conn)?;
            report.expired_jobs.push(job.id);
        }
    }

    if !report.expired_jobs.is_empty() {
        info!(expired = report.expired_jobs.len(), "pruned expired backups");
    }
    Ok(report)
}
