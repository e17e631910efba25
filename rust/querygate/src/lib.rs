pub mod cache;
pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod explain;
pub mod models;
pub mod pagination;
pub mod query;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod validator;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the query gateway using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
