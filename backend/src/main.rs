//! torzcore - backup/restore engine, Torznab search scheduler, and
//! indexer negotiation core for a qBittorrent fleet.
//!
//! This binary owns process lifecycle only: load configuration, connect
//! the database, wire the core services together in dependency order,
//! and run until asked to stop. There is no HTTP listener here - the
//! REST/GraphQL surface that would embed this crate as a library is an
//! external collaborator.

mod backup;
mod client;
mod config;
mod content_classifier;
mod db;
mod error;
mod history;
mod indexer;
mod negotiator;
mod rate_limiter;
mod restore;
mod scheduler;
mod search_cache;
mod services;
mod torrent_patcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::backup::engine::{BackupEngine, InstanceDirectory};
use crate::client::SharedSyncManager;
use crate::config::{AppConfig, LogFormat};
use crate::db::Database;
use crate::db::models::Instance;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::Scheduler;
use crate::search_cache::SearchCache;
use crate::services::encryption::CredentialEncryption;

/// Instance connection details live in the embedding application's own
/// store (there is no `instances` table in this crate's migrations - see
/// DESIGN.md). This directory always reports zero instances; an embedder
/// swaps in its own `InstanceDirectory` impl backed by its instance
/// registry and client-credential store.
struct NoInstances;

#[async_trait]
impl InstanceDirectory for NoInstances {
    async fn list_enabled_instances(&self) -> Result<Vec<Instance>> {
        Ok(Vec::new())
    }

    async fn get_instance(&self, id: i64) -> Result<Instance> {
        Err(anyhow::anyhow!("no instance registered with id {id}"))
    }

    async fn client_for(&self, instance: &Instance) -> Result<SharedSyncManager> {
        Err(anyhow::anyhow!("no client configured for instance {}", instance.id))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    init_tracing(config.log_format);

    if config.encryption_key_generated {
        tracing::warn!(
            "ENCRYPTION_KEY not set; generated a new key for this boot. \
             Set ENCRYPTION_KEY to persist credential encryption across restarts."
        );
    }
    let _credential_encryption = CredentialEncryption::from_base64_key(&config.encryption_key_b64)?;

    tokio::fs::create_dir_all(config.torrent_blob_dir()).await.ok();

    tracing::info!("connecting to database");
    let db = Database::connect_with_retry(&config.database_url, 10).await?;
    db.migrate().await?;
    tracing::info!("database ready");

    let rate_limiter = Arc::new(RateLimiter::new());
    let startup_cancel = tokio_util::sync::CancellationToken::new();
    if let Err(e) = rate_limiter.load_cooldowns_from(&startup_cancel, &db.indexers()).await {
        tracing::warn!(error = %e, "failed to load indexer cooldowns at startup");
    }

    let scheduler = Scheduler::new(rate_limiter.clone(), config.search_worker_count);
    let search_cache = SearchCache::new(db.search_cache(), config.search_cache_ttl_minutes);

    let backup_engine = BackupEngine::new(
        db.backups(),
        config.backups_dir(),
        Arc::new(NoInstances),
        Duration::from_secs(config.backup_poll_interval_secs),
        config.backup_worker_count,
    );
    backup_engine.start().await?;
    tracing::info!(
        poll_interval_secs = config.backup_poll_interval_secs,
        worker_count = config.backup_worker_count,
        "backup engine started"
    );

    tracing::info!("torzcore running; waiting for shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown signal received");

    backup_engine.stop().await;
    scheduler.stop().await;
    search_cache.flush().await.ok();
    tracing::info!("torzcore stopped cleanly");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "torzcore=info".into());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
