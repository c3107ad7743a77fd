use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, signal};

use edms::{
    auth::jwt::JwtService, config::AppConfig, db, init_tracing, routes::create_router,
    s3::connect_storage, state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        backup_dir = %config.backup_dir.display(),
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let pool = pool.clone();
        let applied = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            let mut conn = pool.get()?;
            db::run_migrations(&mut conn)
        })
        .await??;
        tracing::info!(applied, "database migrations applied");
    }

    let storage = Arc::new(connect_storage(&config).await?);
    let jwt = JwtService::from_config(&config)?;
    let address = format!("{}:{}", config.server_host, config.server_port);

    let state = AppState::new(pool, config, storage, jwt);
    let app = create_router(state);

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(address = %address, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
            tracing::info!("api received shutdown signal");
        })
        .await?;

    Ok(())
}
