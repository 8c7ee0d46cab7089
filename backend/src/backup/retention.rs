//! Keep-K retention per backup kind, plus reference-counted blob cleanup.

use anyhow::Result;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::blob_cache::BlobCache;
use crate::db::BackupRepository;
use crate::db::models::BackupKind;

/// Deletes runs of `kind` older than the `keep`th most recent, then removes
/// any blob whose reference count across surviving runs drops to zero.
pub async fn apply_retention(
    cancel: &CancellationToken,
    repo: &BackupRepository,
    blobs: &BlobCache,
    instance_id: i64,
    kind: BackupKind,
    keep: i32,
) -> Result<()> {
    if keep <= 0 {
        return Ok(());
    }
    let keep = keep as usize;
    let successful = repo.successful_runs(cancel, instance_id, kind).await?;
    if successful.len() <= keep {
        return Ok(());
    }

    let to_delete = &successful[keep..];
    let candidate_paths = repo.distinct_blob_paths_for_runs(cancel, to_delete).await?;

    repo.delete_runs(cancel, to_delete).await?;
    info!(instance_id, kind = kind.as_str(), count = to_delete.len(), "pruned old backup runs");

    let removals = candidate_paths.into_iter().map(|path| {
        let repo = repo.clone();
        let blobs = blobs.clone();
        let cancel = cancel.clone();
        async move {
            match repo.count_blob_references(&cancel, &path).await {
                Ok(0) => {
                    if let Err(e) = blobs.remove(&path).await {
                        warn!(path, error = %e, "failed to remove orphaned blob");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(path, error = %e, "failed to count blob references"),
            }
        }
    });
    join_all(removals).await;

    Ok(())
}
