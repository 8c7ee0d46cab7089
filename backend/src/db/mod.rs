//! Database connection and repository access.

pub mod backup_repo;
pub mod cache_repo;
pub mod indexer_repo;
pub mod models;
pub mod sqlite_helpers;

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

pub use backup_repo::BackupRepository;
pub use cache_repo::SearchCacheRepository;
pub use indexer_repo::IndexerRepository;

/// Database wrapper providing connection pool access.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect with bounded retry, mirroring the connect-with-backoff-and-log
    /// pattern used elsewhere in this codebase for external resources.
    pub async fn connect_with_retry(url: &str, max_attempts: u32) -> Result<Self> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match SqlitePoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
            {
                Ok(pool) => return Ok(Self { pool }),
                Err(e) if attempt < max_attempts => {
                    let wait = Duration::from_millis(200 * 2u64.pow(attempt.min(6)));
                    warn!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "database connect failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e).context("connecting to database after retries"),
            }
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn backups(&self) -> BackupRepository {
        BackupRepository::new(self.pool.clone())
    }

    pub fn indexers(&self) -> IndexerRepository {
        IndexerRepository::new(self.pool.clone())
    }

    pub fn search_cache(&self) -> SearchCacheRepository {
        SearchCacheRepository::new(self.pool.clone())
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}
