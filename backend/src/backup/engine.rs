//! C7: scheduler, startup recovery, and per-run worker execution.
//!
//! Modeled on this crate's torrent runtime (a long-lived struct holding a
//! `CancellationToken` plus background `JoinHandle`s, torn down by a single
//! `shutdown`/`stop` call) rather than a full `Service` impl, since the
//! backup engine has no HTTP surface of its own to register.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::blob_cache::{self, BlobCache};
use crate::backup::manifest::{Manifest, ManifestItem};
use crate::backup::retention;
use crate::client::SharedSyncManager;
use crate::db::BackupRepository;
use crate::db::models::{BackupItem, BackupKind, BackupSettings, CategoryRef, Instance};
use crate::torrent_patcher;

pub const ERR_INSTANCE_BUSY: &str = "another run is already in progress for this instance";

/// Resolves instances and builds a client for each; the one seam the engine
/// needs into the rest of the application (instance CRUD lives elsewhere).
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn list_enabled_instances(&self) -> Result<Vec<Instance>>;
    async fn get_instance(&self, id: i64) -> Result<Instance>;
    async fn client_for(&self, instance: &Instance) -> Result<SharedSyncManager>;
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RunProgress {
    pub current: u32,
    pub total: u32,
    pub percentage: f32,
}

struct QueueItem {
    instance_id: i64,
}

pub struct BackupEngine {
    repo: BackupRepository,
    blobs: BlobCache,
    backups_dir: PathBuf,
    instances: Arc<dyn InstanceDirectory>,
    poll_interval: Duration,
    worker_count: usize,
    inflight: Mutex<HashMap<i64, i64>>,
    progress: Mutex<HashMap<i64, RunProgress>>,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BackupEngine {
    pub fn new(
        repo: BackupRepository,
        backups_dir: PathBuf,
        instances: Arc<dyn InstanceDirectory>,
        poll_interval: Duration,
        worker_count: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(Self {
            repo,
            blobs: BlobCache::new(backups_dir.join("torrents")),
            backups_dir,
            instances,
            poll_interval,
            worker_count: worker_count.max(1),
            inflight: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn progress_for(&self, run_id: i64) -> Option<RunProgress> {
        self.progress.lock().get(&run_id).copied()
    }

    /// Startup recovery (never blocks the caller past the synchronous
    /// recovery step) followed by worker/ticker spawn.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.repo.recover_stale_runs(&self.cancel).await?;

        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| anyhow!("backup engine already started"))?;

        let mut handles = Vec::new();

        // A single dispatcher reads the queue and hands each run to a
        // semaphore-bounded pool of `worker_count` concurrent executions,
        // rather than `worker_count` tasks racing on one `mpsc::Receiver`.
        let engine = self.clone();
        let cancel = self.cancel.clone();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.worker_count));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = rx.recv() => {
                        let Some(item) = item else { break };
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => break,
                        };
                        let engine = engine.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            engine.execute_queued(item, &cancel).await;
                        });
                    }
                }
            }
        }));

        *self.handles.lock() = handles;

        let engine = self.clone();
        let cancel = self.cancel.clone();
        let recovery_handle = tokio::spawn(async move {
            if let Err(e) = engine.enumerate_missed_backups("startup-recovery", &cancel).await {
                warn!(error = %e, "startup missed-backup enumeration failed");
            }
        });
        self.handles.lock().push(recovery_handle);

        let engine = self.clone();
        let poll_interval = self.poll_interval;
        let cancel = self.cancel.clone();
        let ticker_handle = tokio::spawn(async move {
            engine.ticker_loop(poll_interval, cancel).await;
        });
        self.handles.lock().push(ticker_handle);

        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn ticker_loop(self: Arc<Self>, poll_interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.enumerate_missed_backups("scheduler", &cancel).await {
                        warn!(error = %e, "missed-backup enumeration failed");
                    }
                }
            }
        }
    }

    async fn enumerate_missed_backups(&self, requested_by: &str, cancel: &CancellationToken) -> Result<()> {
        let settings_list = self.repo.list_enabled_settings(cancel).await?;
        for settings in settings_list {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let now = Utc::now();
            for kind in settings.enabled_kinds() {
                let last_success = self.repo.last_success_run(cancel, settings.instance_id, kind).await?;
                if is_missed(kind, last_success.map(|r| r.completed_at.unwrap_or(r.requested_at)), now) {
                    match self.queue_run(cancel, settings.instance_id, kind, requested_by).await {
                        Ok(_) | Err(QueueError::Busy) => {}
                        Err(QueueError::Other(e)) => warn!(
                            instance_id = settings.instance_id,
                            kind = kind.as_str(),
                            error = %e,
                            "failed to enqueue missed backup",
                        ),
                    }
                    // Only the first missed kind per instance per enumeration pass.
                    break;
                }
            }
        }
        Ok(())
    }

    /// Enqueues a backup run for `instance_id`/`kind`. Returns `ErrInstanceBusy`
    /// if a run is already in flight for that instance.
    pub async fn queue_run(
        &self,
        cancel: &CancellationToken,
        instance_id: i64,
        kind: BackupKind,
        requested_by: &str,
    ) -> Result<i64, QueueError> {
        {
            let mut inflight = self.inflight.lock();
            if inflight.contains_key(&instance_id) {
                return Err(QueueError::Busy);
            }
            // Reserve the slot before we even have a row, so concurrent
            // `queue_run` calls for the same instance can't race past here.
            inflight.insert(instance_id, 0);
        }

        let run = match self.repo.create_run(cancel, instance_id, kind, requested_by).await {
            Ok(run) => run,
            Err(e) => {
                self.inflight.lock().remove(&instance_id);
                return Err(QueueError::Other(e));
            }
        };
        self.inflight.lock().insert(instance_id, run.id);

        if self.tx.send(QueueItem { instance_id }).await.is_err() {
            self.inflight.lock().remove(&instance_id);
            // Never handed off to a worker: undo the pre-enqueue INSERT so
            // no orphaned `pending` row survives the canceled enqueue (§5).
            if let Err(e) = self.repo.delete_runs(cancel, &[run.id]).await {
                warn!(run_id = run.id, error = %e, "failed to delete run row after canceled enqueue");
            }
            return Err(QueueError::Other(anyhow!("backup engine is shut down")));
        }

        Ok(run.id)
    }

    async fn execute_queued(self: Arc<Self>, item: QueueItem, cancel: &CancellationToken) {
        let run_id = *self.inflight.lock().get(&item.instance_id).unwrap_or(&0);
        let result = self.run_one(item.instance_id, run_id, cancel).await;
        if let Err(e) = result {
            error!(instance_id = item.instance_id, run_id, error = %e, "backup run failed");
            if let Err(mark_err) = self.repo.mark_failed(cancel, run_id, &e.to_string()).await {
                error!(run_id, error = %mark_err, "failed to persist run failure");
            }
        }
        self.inflight.lock().remove(&item.instance_id);
        self.progress.lock().remove(&run_id);
    }

    async fn run_one(self: &Arc<Self>, instance_id: i64, run_id: i64, cancel: &CancellationToken) -> Result<()> {
        let instance = self.instances.get_instance(instance_id).await?;
        let settings = self
            .repo
            .get_settings(cancel, instance_id)
            .await?
            .unwrap_or(BackupSettings {
                instance_id,
                enabled: true,
                hourly_enabled: false,
                daily_enabled: false,
                weekly_enabled: false,
                monthly_enabled: false,
                keep_hourly: 0,
                keep_daily: 0,
                keep_weekly: 0,
                keep_monthly: 0,
                include_categories: true,
                include_tags: true,
            })
            .normalize();
        let run = self
            .repo
            .get_run(cancel, run_id)
            .await?
            .ok_or_else(|| anyhow!("run {run_id} vanished before execution"))?;

        self.repo.mark_running(cancel, run_id).await?;
        let client = self.instances.client_for(&instance).await?;

        let torrents = client.get_all_torrents(cancel).await?;
        let categories = client.get_categories(cancel).await?;
        let tags = client.get_tags(cancel).await?;
        let webapi_version = client.get_instance_webapi_version(cancel).await?;
        let needs_patch = torrent_patcher::needs_patch(&webapi_version);

        let prior_blobs = self.prior_blob_map(cancel, instance_id, run.kind).await?;

        let mut items = Vec::with_capacity(torrents.len());
        let mut total_bytes = 0i64;
        let mut category_counts: BTreeMap<String, i32> = BTreeMap::new();
        let mut taken_paths: HashSet<String> = HashSet::new();
        let total = torrents.len() as u32;

        for (idx, torrent) in torrents.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(anyhow!("backup run canceled"));
            }

            let hash_key = torrent.hash.trim().to_lowercase();
            let blob_rel = self
                .export_or_reuse(cancel, client.as_ref(), needs_patch, torrent, &hash_key, &prior_blobs)
                .await?;

            let category_key = torrent
                .category
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| "(uncategorized)".to_string());
            *category_counts.entry(category_key).or_insert(0) += 1;
            total_bytes += torrent.size_bytes;

            let archive_path = blob_cache::archive_path(
                torrent.category.as_deref().filter(|_| settings.include_categories),
                &torrent.name,
                settings.include_categories,
                |p| taken_paths.contains(p),
            );
            taken_paths.insert(archive_path.clone());

            items.push(BackupItem {
                run_id,
                torrent_hash: hash_key,
                name: torrent.name.clone(),
                category: if settings.include_categories { torrent.category.clone() } else { None },
                size_bytes: torrent.size_bytes,
                archive_rel_path: Some(archive_path),
                info_hash_v1: torrent.info_hash_v1.clone(),
                info_hash_v2: torrent.info_hash_v2.clone(),
                tags: if settings.include_tags && !torrent.tags.is_empty() {
                    Some(torrent.tags.join(","))
                } else {
                    None
                },
                torrent_blob_path: Some(blob_rel),
            });

            self.progress.lock().insert(run_id, RunProgress {
                current: idx as u32 + 1,
                total,
                percentage: if total == 0 { 100.0 } else { (idx as f32 + 1.0) / total as f32 * 100.0 },
            });
        }

        let categories_map: BTreeMap<String, CategoryRef> = if settings.include_categories {
            categories
                .iter()
                .map(|(name, save_path)| (name.clone(), CategoryRef { save_path: save_path.clone() }))
                .collect()
        } else {
            BTreeMap::new()
        };
        let tags_vec = if settings.include_tags { tags } else { vec![] };

        let manifest = Manifest {
            instance_id,
            kind: run.kind,
            generated_at: Utc::now(),
            torrent_count: items.len() as i32,
            categories: categories_map.clone(),
            tags: tags_vec.clone(),
            items: items.iter().map(ManifestItem::from).collect(),
        };

        let slug = blob_cache::sanitize_segment(&instance.name);
        let manifest_file = manifest.file_name(&slug);
        let manifest_rel = format!("{slug}/{manifest_file}");
        let manifest_abs = self.backups_dir.join(&manifest_rel);
        if let Some(parent) = manifest_abs.parent() {
            fs::create_dir_all(parent).await.context("creating backup manifest directory")?;
        }
        fs::write(&manifest_abs, manifest.to_json()?)
            .await
            .context("writing backup manifest")?;

        self.repo.insert_items(cancel, run_id, &items).await?;
        self.repo
            .mark_success(
                cancel,
                run_id,
                &manifest_rel,
                total_bytes,
                items.len() as i32,
                &category_counts,
                &categories_map,
                &tags_vec,
            )
            .await?;

        retention::apply_retention(cancel, &self.repo, &self.blobs, instance_id, run.kind, settings.keep_for(run.kind))
            .await?;

        info!(instance_id, run_id, torrent_count = items.len(), "backup run completed");
        Ok(())
    }

    /// Maps `torrent_hash -> torrent_blob_path` from the previous successful
    /// run of the same kind, so unchanged torrents skip re-export.
    async fn prior_blob_map(
        &self,
        cancel: &CancellationToken,
        instance_id: i64,
        kind: BackupKind,
    ) -> Result<HashMap<String, String>> {
        let Some(prev) = self.repo.last_success_run(cancel, instance_id, kind).await? else {
            return Ok(HashMap::new());
        };
        let items = self.repo.list_items(cancel, prev.id).await?;
        Ok(items
            .into_iter()
            .filter_map(|i| i.torrent_blob_path.map(|p| (i.torrent_hash, p)))
            .collect())
    }

    async fn export_or_reuse(
        &self,
        cancel: &CancellationToken,
        client: &(dyn crate::client::SyncManager),
        needs_patch: bool,
        torrent: &crate::db::models::Torrent,
        hash_key: &str,
        prior_blobs: &HashMap<String, String>,
    ) -> Result<String> {
        if let Some(rel) = prior_blobs.get(hash_key) {
            if self.blobs.exists(rel).await {
                return Ok(rel.clone());
            }
        }

        let exported = client.export_torrent(cancel, &torrent.hash).await?;

        let bytes = if needs_patch {
            let webapi_trackers = client.get_torrent_trackers(cancel, &torrent.hash).await.unwrap_or_default();
            let trackers = torrent_patcher::collect_trackers(&[], &webapi_trackers, exported.tracker_domain.as_deref());
            let (patched, _) = torrent_patcher::patch(&exported.bytes, &trackers)?;
            patched
        } else {
            exported.bytes
        };

        let (_hash, rel) = self.blobs.store_and_hash(&bytes).await?;
        Ok(rel)
    }
}

#[derive(Debug)]
pub enum QueueError {
    Busy,
    Other(anyhow::Error),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Busy => write!(f, "{ERR_INSTANCE_BUSY}"),
            QueueError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for QueueError {}

fn fixed_interval(kind: BackupKind) -> Option<chrono::Duration> {
    match kind {
        BackupKind::Hourly => Some(chrono::Duration::hours(1)),
        BackupKind::Daily => Some(chrono::Duration::days(1)),
        BackupKind::Weekly => Some(chrono::Duration::days(7)),
        BackupKind::Monthly | BackupKind::Manual => None,
    }
}

/// A kind is missed iff no prior success exists, or `now` has reached the
/// kind's next-due timestamp. Monthly is calendar-aware (`lastSuccess + 1
/// month`, not a fixed 30-day duration); failed/pending/running runs never
/// factor in here since only `last_success_run` feeds this function.
pub fn is_missed(kind: BackupKind, last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Some(last) = last_success else {
        return !matches!(kind, BackupKind::Manual);
    };
    match kind {
        BackupKind::Manual => false,
        BackupKind::Monthly => {
            let due = last.checked_add_months(Months::new(1)).unwrap_or(last);
            now >= due
        }
        other => {
            let interval = fixed_interval(other).expect("scheduled kinds carry a fixed interval");
            now >= last + interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn missing_last_success_is_always_missed_except_manual() {
        assert!(is_missed(BackupKind::Daily, None, Utc::now()));
        assert!(!is_missed(BackupKind::Manual, None, Utc::now()));
    }

    #[test]
    fn hourly_is_missed_after_an_hour() {
        let last = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(!is_missed(BackupKind::Hourly, Some(last), last + chrono::Duration::minutes(59)));
        assert!(is_missed(BackupKind::Hourly, Some(last), last + chrono::Duration::hours(1)));
    }

    #[test]
    fn monthly_is_calendar_aware_not_fixed_30_days() {
        let last = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        // Jan 31 + 1 month normalizes to the last valid day of February.
        let just_before = Utc.with_ymd_and_hms(2026, 2, 27, 0, 0, 0).unwrap();
        assert!(!is_missed(BackupKind::Monthly, Some(last), just_before));
    }

    #[test]
    fn failed_runs_never_factor_into_is_missed_directly() {
        // `is_missed` only ever receives a success timestamp by construction
        // (callers pass `last_success_run(...)`); a `None` here models "no
        // success yet", whether because of a prior failure or a first run.
        assert!(is_missed(BackupKind::Weekly, None, Utc::now()));
    }
}
