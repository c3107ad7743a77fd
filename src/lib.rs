pub mod audit;
pub mod auth;
pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod notifications;
pub mod placeholders;
pub mod routes;
pub mod s3;
pub mod scheduler;
pub mod schema;
pub mod seed;
pub mod settings;
pub mod state;
pub mod storage;
pub mod utils;
pub mod workers;
pub mod workflow;

pub use scheduler::Scheduler;
pub use workers::{default_handlers, Worker};

use tracing_subscriber::EnvFilter;

/// Compact `tracing` output filtered by `RUST_LOG`, `info` by default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
