//! Repository for `instance_backup_settings` / `instance_backup_runs` / `instance_backup_items`.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::models::{BackupItem, BackupKind, BackupRun, BackupSettings, BackupStatus, CategoryRef};
use super::sqlite_helpers::{from_json, now_iso8601, str_to_datetime, str_to_datetime_opt, to_json};

/// Every method below is an I/O boundary and accepts a context; checked once
/// up front rather than wrapped around the query, since SQLite calls here
/// are local and short-lived and not worth racing in a `select!`.
fn check_canceled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(anyhow!("operation canceled"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct BackupRepository {
    pool: SqlitePool,
}

impl BackupRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_settings(&self, cancel: &CancellationToken, instance_id: i64) -> Result<Option<BackupSettings>> {
        check_canceled(cancel)?;
        let row = sqlx::query(
            "SELECT instance_id, enabled, hourly_enabled, daily_enabled, weekly_enabled, monthly_enabled,
                    keep_hourly, keep_daily, keep_weekly, keep_monthly, include_categories, include_tags
             FROM instance_backup_settings WHERE instance_id = ?1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| BackupSettings {
            instance_id: r.get("instance_id"),
            enabled: r.get::<i64, _>("enabled") != 0,
            hourly_enabled: r.get::<i64, _>("hourly_enabled") != 0,
            daily_enabled: r.get::<i64, _>("daily_enabled") != 0,
            weekly_enabled: r.get::<i64, _>("weekly_enabled") != 0,
            monthly_enabled: r.get::<i64, _>("monthly_enabled") != 0,
            keep_hourly: r.get("keep_hourly"),
            keep_daily: r.get("keep_daily"),
            keep_weekly: r.get("keep_weekly"),
            keep_monthly: r.get("keep_monthly"),
            include_categories: r.get::<i64, _>("include_categories") != 0,
            include_tags: r.get::<i64, _>("include_tags") != 0,
        }))
    }

    pub async fn list_enabled_settings(&self, cancel: &CancellationToken) -> Result<Vec<BackupSettings>> {
        check_canceled(cancel)?;
        let rows = sqlx::query(
            "SELECT instance_id, enabled, hourly_enabled, daily_enabled, weekly_enabled, monthly_enabled,
                    keep_hourly, keep_daily, keep_weekly, keep_monthly, include_categories, include_tags
             FROM instance_backup_settings WHERE enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| BackupSettings {
                instance_id: r.get("instance_id"),
                enabled: true,
                hourly_enabled: r.get::<i64, _>("hourly_enabled") != 0,
                daily_enabled: r.get::<i64, _>("daily_enabled") != 0,
                weekly_enabled: r.get::<i64, _>("weekly_enabled") != 0,
                monthly_enabled: r.get::<i64, _>("monthly_enabled") != 0,
                keep_hourly: r.get("keep_hourly"),
                keep_daily: r.get("keep_daily"),
                keep_weekly: r.get("keep_weekly"),
                keep_monthly: r.get("keep_monthly"),
                include_categories: r.get::<i64, _>("include_categories") != 0,
                include_tags: r.get::<i64, _>("include_tags") != 0,
            })
            .collect())
    }

    pub async fn upsert_settings(&self, cancel: &CancellationToken, settings: &BackupSettings) -> Result<()> {
        check_canceled(cancel)?;
        let s = settings.clone().normalize();
        sqlx::query(
            "INSERT INTO instance_backup_settings
                (instance_id, enabled, hourly_enabled, daily_enabled, weekly_enabled, monthly_enabled,
                 keep_hourly, keep_daily, keep_weekly, keep_monthly, include_categories, include_tags)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(instance_id) DO UPDATE SET
                enabled=excluded.enabled, hourly_enabled=excluded.hourly_enabled,
                daily_enabled=excluded.daily_enabled, weekly_enabled=excluded.weekly_enabled,
                monthly_enabled=excluded.monthly_enabled, keep_hourly=excluded.keep_hourly,
                keep_daily=excluded.keep_daily, keep_weekly=excluded.keep_weekly,
                keep_monthly=excluded.keep_monthly, include_categories=excluded.include_categories,
                include_tags=excluded.include_tags",
        )
        .bind(s.instance_id)
        .bind(s.enabled as i64)
        .bind(s.hourly_enabled as i64)
        .bind(s.daily_enabled as i64)
        .bind(s.weekly_enabled as i64)
        .bind(s.monthly_enabled as i64)
        .bind(s.keep_hourly)
        .bind(s.keep_daily)
        .bind(s.keep_weekly)
        .bind(s.keep_monthly)
        .bind(s.include_categories as i64)
        .bind(s.include_tags as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_run(r: sqlx::sqlite::SqliteRow) -> Result<BackupRun> {
        let kind: String = r.get("kind");
        let status: String = r.get("status");
        let category_counts_json: String = r.get("category_counts");
        let categories_json: String = r.get("categories");
        let tags_json: String = r.get("tags");

        Ok(BackupRun {
            id: r.get("id"),
            instance_id: r.get("instance_id"),
            kind: BackupKind::from_str(&kind)?,
            status: BackupStatus::from_str(&status)?,
            requested_by: r.get("requested_by"),
            requested_at: str_to_datetime(r.get("requested_at"))?,
            started_at: str_to_datetime_opt(r.get::<Option<String>, _>("started_at").as_deref())?,
            completed_at: str_to_datetime_opt(
                r.get::<Option<String>, _>("completed_at").as_deref(),
            )?,
            manifest_path: r.get("manifest_path"),
            total_bytes: r.get("total_bytes"),
            torrent_count: r.get("torrent_count"),
            category_counts: from_json::<BTreeMap<String, i32>>(&category_counts_json)
                .unwrap_or_default(),
            categories: from_json::<BTreeMap<String, CategoryRef>>(&categories_json)
                .unwrap_or_default(),
            tags: from_json::<Vec<String>>(&tags_json).unwrap_or_default(),
            error_message: r.get("error_message"),
        })
    }

    pub async fn create_run(
        &self,
        cancel: &CancellationToken,
        instance_id: i64,
        kind: BackupKind,
        requested_by: &str,
    ) -> Result<BackupRun> {
        check_canceled(cancel)?;
        let now = now_iso8601();
        let id = sqlx::query(
            "INSERT INTO instance_backup_runs
                (instance_id, kind, status, requested_by, requested_at, total_bytes, torrent_count,
                 category_counts, categories, tags)
             VALUES (?1, ?2, 'pending', ?3, ?4, 0, 0, '{}', '{}', '[]')",
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .bind(requested_by)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_run(cancel, id)
            .await?
            .context("run vanished immediately after insert")
    }

    pub async fn get_run(&self, cancel: &CancellationToken, id: i64) -> Result<Option<BackupRun>> {
        check_canceled(cancel)?;
        let row = sqlx::query(
            "SELECT id, instance_id, kind, status, requested_by, requested_at, started_at,
                    completed_at, manifest_path, total_bytes, torrent_count, category_counts,
                    categories, tags, error_message
             FROM instance_backup_runs WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_run).transpose()
    }

    pub async fn mark_running(&self, cancel: &CancellationToken, id: i64) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query("UPDATE instance_backup_runs SET status='running', started_at=?2 WHERE id=?1")
            .bind(id)
            .bind(now_iso8601())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_success(
        &self,
        cancel: &CancellationToken,
        id: i64,
        manifest_path: &str,
        total_bytes: i64,
        torrent_count: i32,
        category_counts: &BTreeMap<String, i32>,
        categories: &BTreeMap<String, CategoryRef>,
        tags: &[String],
    ) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query(
            "UPDATE instance_backup_runs SET
                status='success', completed_at=?2, manifest_path=?3, total_bytes=?4,
                torrent_count=?5, category_counts=?6, categories=?7, tags=?8
             WHERE id=?1",
        )
        .bind(id)
        .bind(now_iso8601())
        .bind(manifest_path)
        .bind(total_bytes)
        .bind(torrent_count)
        .bind(to_json(category_counts))
        .bind(to_json(categories))
        .bind(to_json(tags))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, cancel: &CancellationToken, id: i64, message: &str) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query(
            "UPDATE instance_backup_runs SET status='failed', completed_at=?2, error_message=?3
             WHERE id=?1",
        )
        .bind(id)
        .bind(now_iso8601())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_success_run(
        &self,
        cancel: &CancellationToken,
        instance_id: i64,
        kind: BackupKind,
    ) -> Result<Option<BackupRun>> {
        check_canceled(cancel)?;
        let row = sqlx::query(
            "SELECT id, instance_id, kind, status, requested_by, requested_at, started_at,
                    completed_at, manifest_path, total_bytes, torrent_count, category_counts,
                    categories, tags, error_message
             FROM instance_backup_runs
             WHERE instance_id = ?1 AND kind = ?2 AND status = 'success'
             ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_run).transpose()
    }

    pub async fn inflight_run(&self, cancel: &CancellationToken, instance_id: i64) -> Result<Option<i64>> {
        check_canceled(cancel)?;
        let row = sqlx::query(
            "SELECT id FROM instance_backup_runs
             WHERE instance_id = ?1 AND status IN ('pending','running') LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Startup recovery: transition all `pending|running` runs to `failed`,
    /// chunked to respect SQLite's bound-parameter limit.
    pub async fn recover_stale_runs(&self, cancel: &CancellationToken) -> Result<usize> {
        check_canceled(cancel)?;
        let ids: Vec<i64> = sqlx::query(
            "SELECT id FROM instance_backup_runs WHERE status IN ('pending','running')",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| r.get("id"))
        .collect();

        let mut recovered = 0usize;
        for chunk in ids.chunks(1000) {
            let placeholders = chunk
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "UPDATE instance_backup_runs SET status='failed', completed_at=?1,
                 error_message='Backup interrupted by application restart'
                 WHERE id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(now_iso8601());
            for id in chunk {
                query = query.bind(*id);
            }
            query.execute(&self.pool).await?;
            recovered += chunk.len();
        }
        if recovered > 0 {
            info!(recovered, "recovered stale backup runs on startup");
        }
        Ok(recovered)
    }

    pub async fn insert_items(&self, cancel: &CancellationToken, run_id: i64, items: &[BackupItem]) -> Result<()> {
        check_canceled(cancel)?;
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                "INSERT INTO instance_backup_items
                    (run_id, torrent_hash, name, category, size_bytes, archive_rel_path,
                     info_hash_v1, info_hash_v2, tags, torrent_blob_path)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )
            .bind(run_id)
            .bind(&item.torrent_hash)
            .bind(&item.name)
            .bind(&item.category)
            .bind(item.size_bytes)
            .bind(&item.archive_rel_path)
            .bind(&item.info_hash_v1)
            .bind(&item.info_hash_v2)
            .bind(&item.tags)
            .bind(&item.torrent_blob_path)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Backfills `torrent_blob_path` for one item once a background
    /// download (§4.7's manifest-import path) lands a blob the import
    /// call itself didn't have on hand yet.
    pub async fn update_item_blob_path(
        &self,
        cancel: &CancellationToken,
        run_id: i64,
        torrent_hash: &str,
        blob_path: &str,
    ) -> Result<()> {
        check_canceled(cancel)?;
        sqlx::query(
            "UPDATE instance_backup_items SET torrent_blob_path = ?1
             WHERE run_id = ?2 AND torrent_hash = ?3",
        )
        .bind(blob_path)
        .bind(run_id)
        .bind(torrent_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_items(&self, cancel: &CancellationToken, run_id: i64) -> Result<Vec<BackupItem>> {
        check_canceled(cancel)?;
        let rows = sqlx::query(
            "SELECT run_id, torrent_hash, name, category, size_bytes, archive_rel_path,
                    info_hash_v1, info_hash_v2, tags, torrent_blob_path
             FROM instance_backup_items WHERE run_id = ?1",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| BackupItem {
                run_id: r.get("run_id"),
                torrent_hash: r.get("torrent_hash"),
                name: r.get("name"),
                category: r.get("category"),
                size_bytes: r.get("size_bytes"),
                archive_rel_path: r.get("archive_rel_path"),
                info_hash_v1: r.get("info_hash_v1"),
                info_hash_v2: r.get("info_hash_v2"),
                tags: r.get("tags"),
                torrent_blob_path: r.get("torrent_blob_path"),
            })
            .collect())
    }

    /// Runs of `kind` with `status='success'` ordered most-recent-first.
    pub async fn successful_runs(&self, cancel: &CancellationToken, instance_id: i64, kind: BackupKind) -> Result<Vec<i64>> {
        check_canceled(cancel)?;
        let rows = sqlx::query(
            "SELECT id FROM instance_backup_runs
             WHERE instance_id = ?1 AND kind = ?2 AND status = 'success'
             ORDER BY completed_at DESC",
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    pub async fn delete_runs(&self, cancel: &CancellationToken, ids: &[i64]) -> Result<()> {
        check_canceled(cancel)?;
        for chunk in ids.chunks(1000) {
            let placeholders = chunk
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(",");
            let sql_items = format!("DELETE FROM instance_backup_items WHERE run_id IN ({placeholders})");
            let mut q = sqlx::query(&sql_items);
            for id in chunk {
                q = q.bind(*id);
            }
            q.execute(&self.pool).await?;

            let sql_runs = format!("DELETE FROM instance_backup_runs WHERE id IN ({placeholders})");
            let mut q = sqlx::query(&sql_runs);
            for id in chunk {
                q = q.bind(*id);
            }
            q.execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Reference count of a blob path across all surviving runs.
    pub async fn count_blob_references(&self, cancel: &CancellationToken, blob_path: &str) -> Result<i64> {
        check_canceled(cancel)?;
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt FROM instance_backup_items WHERE torrent_blob_path = ?1",
        )
        .bind(blob_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("cnt"))
    }

    pub async fn distinct_blob_paths_for_runs(&self, cancel: &CancellationToken, ids: &[i64]) -> Result<Vec<String>> {
        check_canceled(cancel)?;
        let mut paths = Vec::new();
        for chunk in ids.chunks(1000) {
            let placeholders = chunk
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT DISTINCT torrent_blob_path FROM instance_backup_items
                 WHERE run_id IN ({placeholders}) AND torrent_blob_path IS NOT NULL"
            );
            let mut q = sqlx::query(&sql);
            for id in chunk {
                q = q.bind(*id);
            }
            let rows = q.fetch_all(&self.pool).await?;
            paths.extend(rows.into_iter().map(|r| r.get::<String, _>("torrent_blob_path")));
        }
        Ok(paths)
    }
}

