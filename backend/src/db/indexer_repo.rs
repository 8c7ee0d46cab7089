//! Repository for `torznab_indexers` and its satellite tables.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;

use super::models::{IndexerBackend, TorznabCategoryEntry, TorznabIndexer};
use super::sqlite_helpers::{now_iso8601, str_to_datetime};

fn check_canceled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(anyhow!("operation canceled"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct IndexerRepository {
    pool: SqlitePool,
}

impl IndexerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_enabled(&self, cancel: &CancellationToken) -> Result<Vec<TorznabIndexer>> {
        check_canceled(cancel)?;
        let rows = sqlx::query(
            "SELECT id, name, backend, base_url, api_key_encrypted, enabled, priority, timeout_seconds
             FROM torznab_indexers WHERE enabled = 1 ORDER BY priority DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut indexers = Vec::with_capacity(rows.len());
        for r in rows {
            let id: i64 = r.get("id");
            let backend: String = r.get("backend");
            let capabilities = self.capabilities_for(cancel, id).await?;
            let categories = self.categories_for(cancel, id).await?;
            indexers.push(TorznabIndexer {
                id,
                name: r.get("name"),
                backend: IndexerBackend::from_str(&backend)?,
                base_url: r.get("base_url"),
                api_key_encrypted: r.get("api_key_encrypted"),
                enabled: true,
                priority: r.get("priority"),
                timeout_seconds: r.get("timeout_seconds"),
                capabilities,
                categories,
            });
        }
        Ok(indexers)
    }

    async fn capabilities_for(&self, cancel: &CancellationToken, indexer_id: i64) -> Result<Vec<String>> {
        check_canceled(cancel)?;
        let rows = sqlx::query(
            "SELECT capability FROM torznab_indexer_capabilities WHERE indexer_id = ?1",
        )
        .bind(indexer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("capability")).collect())
    }

    async fn categories_for(&self, cancel: &CancellationToken, indexer_id: i64) -> Result<Vec<TorznabCategoryEntry>> {
        check_canceled(cancel)?;
        let rows = sqlx::query(
            "SELECT category_id, name, parent FROM torznab_indexer_categories WHERE indexer_id = ?1",
        )
        .bind(indexer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TorznabCategoryEntry {
                category_id: r.get("category_id"),
                name: r.get("name"),
                parent: r.get("parent"),
            })
            .collect())
    }

    pub async fn record_error(&self, cancel: &CancellationToken, indexer_id: i64, message: &str) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query(
            "INSERT INTO torznab_indexer_errors (indexer_id, message, occurred_at) VALUES (?1, ?2, ?3)",
        )
        .bind(indexer_id)
        .bind(message)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_latency(&self, cancel: &CancellationToken, indexer_id: i64, duration_ms: i64) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query(
            "INSERT INTO torznab_indexer_latency (indexer_id, duration_ms, recorded_at) VALUES (?1, ?2, ?3)",
        )
        .bind(indexer_id)
        .bind(duration_ms)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_cooldown(&self, cancel: &CancellationToken, indexer_id: i64, resume_at: DateTime<Utc>) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query(
            "INSERT INTO torznab_indexer_cooldowns (indexer_id, resume_at) VALUES (?1, ?2)
             ON CONFLICT(indexer_id) DO UPDATE SET resume_at = excluded.resume_at",
        )
        .bind(indexer_id)
        .bind(resume_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_cooldown(&self, cancel: &CancellationToken, indexer_id: i64) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query("DELETE FROM torznab_indexer_cooldowns WHERE indexer_id = ?1")
            .bind(indexer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loaded once at startup by the owning rate limiter.
    pub async fn load_cooldowns(&self, cancel: &CancellationToken) -> Result<HashMap<i64, DateTime<Utc>>> {
        check_canceled(cancel)?;
        let rows = sqlx::query("SELECT indexer_id, resume_at FROM torznab_indexer_cooldowns")
            .fetch_all(&self.pool)
            .await?;

        let mut map = HashMap::new();
        for r in rows {
            let resume_at: String = r.get("resume_at");
            map.insert(r.get("indexer_id"), str_to_datetime(&resume_at)?);
        }
        Ok(map)
    }
}
