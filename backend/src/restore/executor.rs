//! C9: applies a `RestorePlan` against a live client (§4.9).
//!
//! Order is Categories (Create, Update, Delete) -> Tags (Create, Delete) ->
//! Torrents (Add, Update, Delete). `Tag Create/Delete`, `Category Delete`,
//! and `Torrent Delete` attempt a single batched call first and fall back
//! to per-item calls on failure, collecting a `RestoreError` per failed
//! item rather than aborting the whole step.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backup::blob_cache::BlobCache;
use crate::backup::manifest::is_unsafe_blob_path;
use crate::client::{AddTorrentOptions, BulkAction, ResumeOptions, SharedSyncManager};
use crate::db::models::{CategoryPlan, RestorePlan, TagPlan, TorrentAdd, TorrentPlan};
use crate::services::retry::{restore_item_retry_config, retry_async};

#[derive(Debug, Clone)]
pub struct RestoreError {
    pub operation: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreExecutorOptions {
    pub dry_run: bool,
    pub skip_hash_check: bool,
    pub auto_resume_verified: bool,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub errors: Vec<RestoreError>,
    pub warnings: Vec<String>,
    pub torrents_added: usize,
    pub torrents_updated: usize,
    pub torrents_deleted: usize,
}

impl RestoreReport {
    fn error(&mut self, operation: &str, target: &str, message: impl std::fmt::Display) {
        self.errors.push(RestoreError {
            operation: operation.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        });
    }
}

/// Applies `plan` against `client`. Returns the plan unchanged (with an
/// empty report) when `options.dry_run` is set, without touching the
/// client at all.
pub async fn execute_restore_plan(
    client: &SharedSyncManager,
    blobs: &BlobCache,
    cancel: &CancellationToken,
    plan: &RestorePlan,
    options: &RestoreExecutorOptions,
) -> RestoreReport {
    let mut report = RestoreReport::default();
    if options.dry_run {
        return report;
    }

    apply_categories(client, cancel, &plan.categories, &mut report).await;
    apply_tags(client, cancel, &plan.tags, &mut report).await;
    apply_torrents(client, blobs, cancel, &plan.torrents, options, &mut report).await;

    report
}

async fn apply_categories(
    client: &SharedSyncManager,
    cancel: &CancellationToken,
    plan: &CategoryPlan,
    report: &mut RestoreReport,
) {
    let retry = restore_item_retry_config();
    for change in &plan.create {
        let result = retry_async(
            || client.create_category(cancel, &change.name, &change.new_save_path),
            &retry,
            "category.create",
        )
        .await;
        if let Err(e) = result {
            report.error("category.create", &change.name, e);
        }
    }
    for change in &plan.update {
        let result =
            retry_async(|| client.edit_category(cancel, &change.name, &change.new_save_path), &retry, "category.update")
                .await;
        if let Err(e) = result {
            report.error("category.update", &change.name, e);
        }
    }
    if plan.delete.is_empty() {
        return;
    }
    if let Err(e) = client.remove_categories(cancel, &plan.delete).await {
        warn!(error = %e, count = plan.delete.len(), "batched category delete failed, falling back to per-item");
        for name in &plan.delete {
            let result = retry_async(|| client.remove_categories(cancel, std::slice::from_ref(name)), &retry, "category.delete").await;
            if let Err(e) = result {
                report.error("category.delete", name, e);
            }
        }
    }
}

async fn apply_tags(
    client: &SharedSyncManager,
    cancel: &CancellationToken,
    plan: &TagPlan,
    report: &mut RestoreReport,
) {
    let retry = restore_item_retry_config();

    if !plan.create.is_empty() {
        let names: Vec<String> = plan.create.iter().map(|t| t.name.clone()).collect();
        if let Err(e) = client.create_tags(cancel, &names).await {
            warn!(error = %e, count = names.len(), "batched tag create failed, falling back to per-item");
            for name in &names {
                let result = retry_async(|| client.create_tags(cancel, std::slice::from_ref(name)), &retry, "tag.create").await;
                if let Err(e) = result {
                    report.error("tag.create", name, e);
                }
            }
        }
    }

    if !plan.delete.is_empty() {
        let names: Vec<String> = plan.delete.iter().map(|t| t.name.clone()).collect();
        if let Err(e) = client.delete_tags(cancel, &names).await {
            warn!(error = %e, count = names.len(), "batched tag delete failed, falling back to per-item");
            for name in &names {
                let result = retry_async(|| client.delete_tags(cancel, std::slice::from_ref(name)), &retry, "tag.delete").await;
                if let Err(e) = result {
                    report.error("tag.delete", name, e);
                }
            }
        }
    }
}

async fn apply_torrents(
    client: &SharedSyncManager,
    blobs: &BlobCache,
    cancel: &CancellationToken,
    plan: &TorrentPlan,
    options: &RestoreExecutorOptions,
    report: &mut RestoreReport,
) {
    let mut resume_candidates = Vec::new();
    let retry = restore_item_retry_config();

    for add in &plan.add {
        match add_one_torrent(client, blobs, cancel, add, options).await {
            Ok(()) => {
                report.torrents_added += 1;
                resume_candidates.push(add.hash.clone());
            }
            Err(e) => report.error("torrent.add", &add.hash, e),
        }
    }

    for update in &plan.update {
        let mut category_change = false;
        let mut tags_change = false;
        for change in &update.changes {
            if !change.supported {
                report.warnings.push(format!(
                    "{}: {} ({})",
                    update.hash,
                    change.field,
                    change.message.as_deref().unwrap_or("unsupported")
                ));
                continue;
            }
            match change.field.as_str() {
                "category" => category_change = true,
                "tags" => tags_change = true,
                _ => {}
            }
        }

        let mut ok = true;
        if category_change {
            let category = update.target_category.as_deref().unwrap_or("");
            let result =
                retry_async(|| client.set_category(cancel, std::slice::from_ref(&update.hash), category), &retry, "torrent.update.category")
                    .await;
            if let Err(e) = result {
                report.error("torrent.update.category", &update.hash, e);
                ok = false;
            }
        }
        if tags_change {
            let result = retry_async(
                || client.set_tags(cancel, std::slice::from_ref(&update.hash), &update.target_tags),
                &retry,
                "torrent.update.tags",
            )
            .await;
            if let Err(e) = result {
                report.error("torrent.update.tags", &update.hash, e);
                ok = false;
            }
        }
        if ok && (category_change || tags_change) {
            report.torrents_updated += 1;
        }
    }

    if !plan.delete.is_empty() {
        if let Err(e) = client.bulk_action(cancel, &plan.delete, BulkAction::Delete { delete_files: false }).await {
            warn!(error = %e, count = plan.delete.len(), "batched torrent delete failed, falling back to per-item");
            for hash in &plan.delete {
                let result = retry_async(
                    || client.bulk_action(cancel, std::slice::from_ref(hash), BulkAction::Delete { delete_files: false }),
                    &retry,
                    "torrent.delete",
                )
                .await;
                match result {
                    Ok(()) => report.torrents_deleted += 1,
                    Err(e) => report.error("torrent.delete", hash, e),
                }
            }
        } else {
            report.torrents_deleted += plan.delete.len();
        }
    }

    if options.skip_hash_check && options.auto_resume_verified && !resume_candidates.is_empty() {
        client
            .resume_when_complete(&resume_candidates, &ResumeOptions { skip_hash_check: true })
            .await;
    }
}

async fn add_one_torrent(
    client: &SharedSyncManager,
    blobs: &BlobCache,
    cancel: &CancellationToken,
    add: &TorrentAdd,
    options: &RestoreExecutorOptions,
) -> anyhow::Result<()> {
    let rel_path = add
        .item
        .torrent_blob_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("no blob path recorded for {}", add.hash))?;

    if is_unsafe_blob_path(rel_path) {
        return Err(anyhow::anyhow!("unsafe blob path for {}: {rel_path}", add.hash));
    }

    let payload = blobs.read(rel_path).await?;

    let add_options = AddTorrentOptions {
        paused: options.skip_hash_check,
        stopped: options.skip_hash_check,
        skip_checking: options.skip_hash_check,
        category: add.item.category.clone(),
        tags: add
            .item
            .tags
            .as_deref()
            .map(|t| t.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect())
            .unwrap_or_default(),
    };

    let retry = restore_item_retry_config();
    retry_async(|| client.add_torrent(cancel, &payload, &add_options), &retry, "torrent.add").await?;

    if let Some(category) = &add.item.category {
        retry_async(|| client.set_category(cancel, std::slice::from_ref(&add.hash), category), &retry, "torrent.add.category").await?;
    }
    if !add_options.tags.is_empty() {
        retry_async(|| client.set_tags(cancel, std::slice::from_ref(&add.hash), &add_options.tags), &retry, "torrent.add.tags").await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockSyncManager;
    use crate::db::models::{BackupItem, CategoryChange, DiffChange, TagChange, TorrentAdd, TorrentUpdate};
    use std::sync::Arc;

    fn plan_with_add(hash: &str, blob_path: &str) -> RestorePlan {
        RestorePlan {
            mode: crate::db::models::RestoreMode::Incremental,
            run_id: 1,
            instance_id: 1,
            categories: CategoryPlan::default(),
            tags: TagPlan::default(),
            torrents: crate::db::models::TorrentPlan {
                add: vec![TorrentAdd {
                    hash: hash.to_string(),
                    item: BackupItem {
                        run_id: 1,
                        torrent_hash: hash.to_string(),
                        name: "foo".into(),
                        category: Some("movies".into()),
                        size_bytes: 10,
                        archive_rel_path: None,
                        info_hash_v1: None,
                        info_hash_v2: None,
                        tags: Some("x,y".into()),
                        torrent_blob_path: Some(blob_path.to_string()),
                    },
                }],
                update: vec![],
                delete: vec![],
            },
        }
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_client() {
        let client: SharedSyncManager = Arc::new(MockSyncManager::default());
        let dir = std::env::temp_dir().join(format!("restore-dryrun-{}", std::process::id()));
        let blobs = BlobCache::new(dir.clone());
        let plan = plan_with_add("abc", "torrents/ab/c0/00/abc.torrent");

        let options = RestoreExecutorOptions { dry_run: true, ..Default::default() };
        let report = execute_restore_plan(&client, &blobs, &CancellationToken::new(), &plan, &options).await;

        assert!(report.errors.is_empty());
        assert_eq!(report.torrents_added, 0);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn unsafe_blob_path_is_reported_as_an_error_not_a_panic() {
        let client: SharedSyncManager = Arc::new(MockSyncManager::default());
        let dir = std::env::temp_dir().join(format!("restore-unsafe-{}", std::process::id()));
        let blobs = BlobCache::new(dir.clone());
        let plan = plan_with_add("abc", "../escape.torrent");

        let options = RestoreExecutorOptions::default();
        let report = execute_restore_plan(&client, &blobs, &CancellationToken::new(), &plan, &options).await;

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].operation, "torrent.add");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn add_torrent_applies_category_and_tags_post_add() {
        let client = Arc::new(MockSyncManager::default());
        let shared: SharedSyncManager = client.clone();
        let dir = std::env::temp_dir().join(format!("restore-addok-{}", std::process::id()));
        let blobs = BlobCache::new(dir.clone());
        let (_, rel) = blobs.store_and_hash(b"d4:infod4:name4:teste1:x0ee").await.unwrap();
        let plan = plan_with_add("abc", &rel);

        let options = RestoreExecutorOptions::default();
        let report = execute_restore_plan(&shared, &blobs, &CancellationToken::new(), &plan, &options).await;

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.torrents_added, 1);
        assert_eq!(client.added.lock().len(), 1);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn batched_tag_create_failure_falls_back_to_per_item_and_still_succeeds() {
        let client: SharedSyncManager = Arc::new(MockSyncManager::default());
        let mut plan = plan_with_add("abc", "torrents/ab/c0/00/abc.torrent");
        plan.torrents.add.clear();
        plan.tags.create.push(TagChange { name: "seeded".into() });
        let dir = std::env::temp_dir().join(format!("restore-tags-{}", std::process::id()));
        let blobs = BlobCache::new(dir.clone());

        let options = RestoreExecutorOptions::default();
        let report = execute_restore_plan(&client, &blobs, &CancellationToken::new(), &plan, &options).await;
        assert!(report.errors.is_empty());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn unsupported_update_changes_surface_as_formatted_warnings() {
        let client: SharedSyncManager = Arc::new(MockSyncManager::default());
        let mut plan = plan_with_add("abc", "torrents/ab/c0/00/abc.torrent");
        plan.torrents.add.clear();
        plan.torrents.update.push(TorrentUpdate {
            hash: "abc".into(),
            changes: vec![DiffChange {
                field: "sizeBytes".into(),
                supported: false,
                message: Some("local data size differs; re-verify or re-download".into()),
            }],
            target_category: None,
            target_tags: vec![],
        });
        let dir = std::env::temp_dir().join(format!("restore-warn-{}", std::process::id()));
        let blobs = BlobCache::new(dir.clone());

        let options = RestoreExecutorOptions::default();
        let report = execute_restore_plan(&client, &blobs, &CancellationToken::new(), &plan, &options).await;
        assert_eq!(report.warnings, vec!["abc: sizeBytes (local data size differs; re-verify or re-download)".to_string()]);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn category_create_and_delete_run_in_order() {
        let client: SharedSyncManager = Arc::new(MockSyncManager::default());
        let mut plan = plan_with_add("abc", "torrents/ab/c0/00/abc.torrent");
        plan.torrents.add.clear();
        plan.categories.create.push(CategoryChange {
            name: "movies".into(),
            old_save_path: None,
            new_save_path: "/data/movies".into(),
        });
        plan.categories.delete.push("stale".into());
        let dir = std::env::temp_dir().join(format!("restore-cat-{}", std::process::id()));
        let blobs = BlobCache::new(dir.clone());

        let options = RestoreExecutorOptions::default();
        let report = execute_restore_plan(&client, &blobs, &CancellationToken::new(), &plan, &options).await;
        assert!(report.errors.is_empty());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
