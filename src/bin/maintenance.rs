use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use edms::{
    auth::{jwt::JwtService, password},
    backup::{self, BackupType},
    config::AppConfig,
    db, init_tracing, s3, seed,
    state::AppState,
    workflow::service,
};

const GENERATED_PASSWORD_LENGTH: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "maintenance", version)]
#[command(about = "Operational commands for the document management system")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a migration package to disk.
    CreateBackup {
        #[arg(long = "type", value_enum, default_value_t = BackupKind::Full)]
        backup_type: BackupKind,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Replace all domain data with the contents of a package.
    RestoreFromPackage {
        path: PathBuf,
        #[arg(long)]
        skip_storage: bool,
    },
    /// Wipe domain data and seed defaults plus an administrator.
    SystemReinit {
        #[arg(long)]
        confirm: bool,
        #[arg(long, default_value = "admin")]
        admin_username: String,
        #[arg(long)]
        admin_password: Option<String>,
    },
    /// Activate or obsolete documents whose dates have arrived.
    ActivatePendingDocuments {
        #[arg(long)]
        dry_run: bool,
    },
    /// Print an argon2 hash for a password.
    HashPassword { password: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackupKind {
    Full,
    Database,
    Files,
}

impl From<BackupKind> for BackupType {
    fn from(value: BackupKind) -> Self {
        match value {
            BackupKind::Full => Self::Full,
            BackupKind::Database => Self::Database,
            BackupKind::Files => Self::Files,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::HashPassword { password } => {
            println!("{}", password::hash_password(&password)?);
        }
        Command::CreateBackup {
            backup_type,
            output,
        } => {
            let state = build_state().await?;
            let artifact = backup::create_backup(&state, backup_type.into(), output)
                .await
                .context("backup failed")?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
        }
        Command::RestoreFromPackage { path, skip_storage } => {
            let state = build_state().await?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let report = backup::restore_from_package(&state, bytes, skip_storage)
                .await
                .context("restore failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::SystemReinit {
            confirm,
            admin_username,
            admin_password,
        } => {
            if !confirm {
                bail!("system-reinit deletes all data; pass --confirm to proceed");
            }
            let generated = admin_password.is_none();
            let admin_password = admin_password
                .unwrap_or_else(|| password::generate_password(GENERATED_PASSWORD_LENGTH));

            let state = build_state().await?;
            let password_for_seed = admin_password.clone();
            let report = tokio::task::spawn_blocking(move || -> Result<seed::SeedReport> {
                let mut conn = state.db()?;
                Ok(seed::system_reinit(
                    &mut conn,
                    &admin_username,
                    &password_for_seed,
                )?)
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if generated {
                println!("Generated administrator password: {admin_password}");
            }
        }
        Command::ActivatePendingDocuments { dry_run } => {
            let state = build_state().await?;
            let report = tokio::task::spawn_blocking(move || -> Result<service::ActivationReport> {
                let mut conn = state.db()?;
                Ok(service::activate_due_documents(
                    &mut conn,
                    service::today(),
                    dry_run,
                )?)
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn build_state() -> Result<Arc<AppState>> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let storage = Arc::new(s3::connect_storage(&config).await?);
    let jwt = JwtService::from_config(&config)?;
    Ok(Arc::new(AppState::new(pool, config, storage, jwt)))
}

