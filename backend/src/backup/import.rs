//! Manifest import: given a manifest JSON plus a map of archive path to a
//! temp blob path on disk, materialize a `success` run without calling
//! `ExportTorrent` for blobs the caller already supplied.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backup::blob_cache::BlobCache;
use crate::backup::manifest::{Manifest, looks_like_torrent_blob, validate_item};
use crate::client::SharedSyncManager;
use crate::db::BackupRepository;
use crate::db::models::BackupItem;
use crate::services::job_queue::process_concurrent;

const MAX_CONCURRENT_BLOB_DOWNLOADS: usize = 4;

/// `archivePath -> tempBlobPath` supplied by the caller alongside the manifest.
pub type BlobSources = HashMap<String, String>;

pub struct ImportResult {
    pub run_id: i64,
    pub imported_items: usize,
    pub missing_blobs: usize,
}

/// Validates items, copies supplied blobs into the cache (rejecting unsafe
/// paths and undersized/malformed bencode), inserts rows, and returns
/// immediately with `success` already set for the items that had a blob on
/// hand. Items without a supplied blob are downloaded afterward by the
/// caller via [`download_missing_blobs`].
pub async fn import_manifest(
    cancel: &CancellationToken,
    repo: &BackupRepository,
    blobs: &BlobCache,
    manifest: &Manifest,
    manifest_rel_path: &str,
    blob_sources: &BlobSources,
) -> Result<(ImportResult, Vec<(BackupItem, String)>)> {
    let run = repo
        .create_run(cancel, manifest.instance_id, manifest.kind, "manifest-import")
        .await?;
    repo.mark_running(cancel, run.id).await?;

    let mut items = Vec::with_capacity(manifest.items.len());
    let mut pending_downloads = Vec::new();
    let mut total_bytes = 0i64;
    let mut category_counts = std::collections::BTreeMap::new();

    for manifest_item in &manifest.items {
        validate_item(manifest_item).context("invalid manifest item")?;

        let mut blob_rel = None;
        if let Some(temp_path) = blob_sources.get(&manifest_item.archive_path) {
            match copy_blob_into_cache(blobs, Path::new(temp_path)).await {
                Ok(rel) => blob_rel = Some(rel),
                Err(e) => warn!(
                    hash = manifest_item.hash,
                    error = %e,
                    "failed to copy supplied blob, will attempt download",
                ),
            }
        }

        let category_key = manifest_item
            .category
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "(uncategorized)".to_string());
        *category_counts.entry(category_key).or_insert(0) += 1;
        total_bytes += manifest_item.size_bytes;

        let item = BackupItem {
            run_id: run.id,
            torrent_hash: manifest_item.hash.trim().to_lowercase(),
            name: manifest_item.name.clone(),
            category: manifest_item.category.clone(),
            size_bytes: manifest_item.size_bytes,
            archive_rel_path: Some(manifest_item.archive_path.clone()),
            info_hash_v1: manifest_item.info_hash_v1.clone(),
            info_hash_v2: manifest_item.info_hash_v2.clone(),
            tags: if manifest_item.tags.is_empty() {
                None
            } else {
                Some(manifest_item.tags.join(","))
            },
            torrent_blob_path: blob_rel.clone(),
        };

        if blob_rel.is_none() {
            pending_downloads.push((item.clone(), manifest_item.hash.clone()));
        }
        items.push(item);
    }

    repo.insert_items(cancel, run.id, &items).await?;
    repo.mark_success(
        cancel,
        run.id,
        manifest_rel_path,
        total_bytes,
        items.len() as i32,
        &category_counts,
        &manifest.categories,
        &manifest.tags,
    )
    .await?;

    let missing_blobs = pending_downloads.len();
    Ok((
        ImportResult {
            run_id: run.id,
            imported_items: items.len(),
            missing_blobs,
        },
        pending_downloads,
    ))
}

async fn copy_blob_into_cache(blobs: &BlobCache, temp_path: &Path) -> Result<String> {
    let bytes = fs::read(temp_path).await.context("reading supplied blob")?;
    if !looks_like_torrent_blob(&bytes) {
        return Err(anyhow!("blob at {} does not look like a bencoded torrent", temp_path.display()));
    }
    let (_hash, rel) = blobs.store_and_hash(&bytes).await?;
    Ok(rel)
}

/// Background download of any blobs the caller didn't already have on disk,
/// run after `import_manifest` returns so the import call itself never
/// blocks on network I/O for the whole manifest. Bounded to
/// `MAX_CONCURRENT_BLOB_DOWNLOADS` in-flight exports at a time, the same
/// semaphore-gated idiom the backup worker pool uses. Metadata updates use
/// `context::Background()`'s Rust equivalent deliberately: this runs after
/// the caller's request has already returned, so there is no request-scoped
/// cancellation left to honor for the database write (see DESIGN.md).
pub async fn download_missing_blobs(
    repo: &BackupRepository,
    blobs: &BlobCache,
    client: &SharedSyncManager,
    cancel: &CancellationToken,
    run_id: i64,
    pending: Vec<(BackupItem, String)>,
) {
    process_concurrent(pending, MAX_CONCURRENT_BLOB_DOWNLOADS, {
        let blobs = blobs.clone();
        let client = client.clone();
        let cancel = cancel.clone();
        let repo = repo.clone();
        move |(_item, hash): (BackupItem, String)| {
            let blobs = blobs.clone();
            let client = client.clone();
            let cancel = cancel.clone();
            let repo = repo.clone();
            async move {
                match client.export_torrent(&cancel, &hash).await {
                    Ok(exported) => match blobs.store_and_hash(&exported.bytes).await {
                        Ok((_sha, rel)) => {
                            if let Err(e) = repo.update_item_blob_path(&cancel, run_id, &hash, &rel).await {
                                warn!(hash, error = %e, "failed to record downloaded blob path");
                            }
                        }
                        Err(e) => warn!(hash, error = %e, "failed to store downloaded blob during manifest import"),
                    },
                    Err(e) => warn!(hash, error = %e, "failed to download missing blob during manifest import"),
                }
            }
        }
    })
    .await;
}
