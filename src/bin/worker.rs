use std::{sync::Arc, time::Duration};

use tokio::signal;

use edms::{
    auth::jwt::JwtService, config::AppConfig, db, default_handlers, init_tracing,
    s3::connect_storage, state::AppState, Scheduler, Worker,
};

const WORKER_POOL_SIZE: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = WORKER_POOL_SIZE,
        s3_bucket = %config.s3_bucket,
        webhook_enabled = config.notification_webhook_url.is_some(),
        activation_interval_seconds = config.activation_interval_seconds,
        health_check_interval_seconds = config.health_check_interval_seconds,
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, WORKER_POOL_SIZE)?;
    let storage = Arc::new(connect_storage(&config).await?);
    let jwt = JwtService::from_config(&config)?;

    let state = Arc::new(AppState::new(pool, config, storage, jwt));
    let worker = Worker::new(state.clone(), default_handlers(), Duration::from_secs(2));
    let scheduler = Scheduler::new(state);

    tokio::select! {
        _ = worker.run() => {}
        _ = scheduler.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}
