//! Repository for `torznab_search_cache` / `torznab_search_cache_settings`.
//!
//! This is the SQLite-backed half of C4; the coverage-reasoning algorithm
//! itself lives in `crate::search_cache` and consults this repository.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::sqlite_helpers::str_to_datetime;

#[derive(Debug, Clone)]
pub struct SearchCacheEntry {
    pub cache_key: String,
    pub scope: String,
    pub canonical_query: String,
    pub categories_json: String,
    pub indexer_ids_json: String,
    pub request_fingerprint: String,
    pub base_fingerprint: String,
    pub response_data: Vec<u8>,
    pub total_results: i64,
    pub cached_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: i64,
}

#[derive(Clone)]
pub struct SearchCacheRepository {
    pool: SqlitePool,
}

impl SearchCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(r: sqlx::sqlite::SqliteRow) -> Result<SearchCacheEntry> {
        Ok(SearchCacheEntry {
            cache_key: r.get("cache_key"),
            scope: r.get("scope"),
            canonical_query: r.get("canonical_query"),
            categories_json: r.get("categories_json"),
            indexer_ids_json: r.get("indexer_ids_json"),
            request_fingerprint: r.get("request_fingerprint"),
            base_fingerprint: r.get("base_fingerprint"),
            response_data: r.get("response_data"),
            total_results: r.get("total_results"),
            cached_at: str_to_datetime(r.get("cached_at"))?,
            last_used_at: str_to_datetime(r.get("last_used_at"))?,
            expires_at: str_to_datetime(r.get("expires_at"))?,
            hit_count: r.get("hit_count"),
        })
    }

    pub async fn fetch(&self, cache_key: &str) -> Result<Option<SearchCacheEntry>> {
        let row = sqlx::query(
            "SELECT cache_key, scope, canonical_query, categories_json, indexer_ids_json,
                    request_fingerprint, base_fingerprint, response_data, total_results,
                    cached_at, last_used_at, expires_at, hit_count
             FROM torznab_search_cache WHERE cache_key = ?1",
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_entry).transpose()
    }

    pub async fn find_active_by_scope_and_query(
        &self,
        scope: &str,
        canonical_query: &str,
    ) -> Result<Vec<SearchCacheEntry>> {
        let rows = sqlx::query(
            "SELECT cache_key, scope, canonical_query, categories_json, indexer_ids_json,
                    request_fingerprint, base_fingerprint, response_data, total_results,
                    cached_at, last_used_at, expires_at, hit_count
             FROM torznab_search_cache
             WHERE scope = ?1 AND canonical_query = ?2 AND expires_at > ?3",
        )
        .bind(scope)
        .bind(canonical_query)
        .bind(Utc::now().to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    pub async fn store(&self, entry: &SearchCacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO torznab_search_cache
                (cache_key, scope, canonical_query, categories_json, indexer_ids_json,
                 request_fingerprint, base_fingerprint, response_data, total_results,
                 cached_at, last_used_at, expires_at, hit_count)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(cache_key) DO UPDATE SET
                scope=excluded.scope, canonical_query=excluded.canonical_query,
                categories_json=excluded.categories_json, indexer_ids_json=excluded.indexer_ids_json,
                request_fingerprint=excluded.request_fingerprint, base_fingerprint=excluded.base_fingerprint,
                response_data=excluded.response_data, total_results=excluded.total_results,
                cached_at=excluded.cached_at, last_used_at=excluded.last_used_at,
                expires_at=excluded.expires_at, hit_count=excluded.hit_count",
        )
        .bind(&entry.cache_key)
        .bind(&entry.scope)
        .bind(&entry.canonical_query)
        .bind(&entry.categories_json)
        .bind(&entry.indexer_ids_json)
        .bind(&entry.request_fingerprint)
        .bind(&entry.base_fingerprint)
        .bind(&entry.response_data)
        .bind(entry.total_results)
        .bind(entry.cached_at.to_rfc3339())
        .bind(entry.last_used_at.to_rfc3339())
        .bind(entry.expires_at.to_rfc3339())
        .bind(entry.hit_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk-shift `expires_at` for every row; caller updates the in-memory TTL first.
    pub async fn rebase_ttl(&self, ttl_minutes: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE torznab_search_cache SET expires_at = datetime(cached_at, '+' || ?1 || ' minutes')",
        )
        .bind(ttl_minutes)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn touch(&self, cache_key: &str) -> Result<()> {
        sqlx::query("UPDATE torznab_search_cache SET last_used_at = ?2 WHERE cache_key = ?1")
            .bind(cache_key)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn invalidate_by_indexer_ids(&self, indexer_ids: &[i64]) -> Result<u64> {
        if indexer_ids.is_empty() {
            return Ok(0);
        }
        let mut affected = 0u64;
        let rows = sqlx::query("SELECT cache_key, indexer_ids_json FROM torznab_search_cache")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let json: String = row.get("indexer_ids_json");
            let ids: Vec<i64> = serde_json::from_str(&json).unwrap_or_default();
            if ids.iter().any(|id| indexer_ids.contains(id)) {
                let key: String = row.get("cache_key");
                sqlx::query("DELETE FROM torznab_search_cache WHERE cache_key = ?1")
                    .bind(&key)
                    .execute(&self.pool)
                    .await?;
                affected += 1;
            }
        }
        Ok(affected)
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM torznab_search_cache WHERE expires_at <= ?1")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn flush(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM torznab_search_cache")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn ttl_minutes(&self) -> Result<i64> {
        let row = sqlx::query("SELECT ttl_minutes FROM torznab_search_cache_settings WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("ttl_minutes"))
    }

    pub async fn set_ttl_minutes(&self, minutes: i64) -> Result<()> {
        sqlx::query("UPDATE torznab_search_cache_settings SET ttl_minutes = ?1 WHERE id = 1")
            .bind(minutes)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
