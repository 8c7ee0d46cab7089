//! C4: coverage-aware search cache. Wraps `db::cache_repo` with the
//! fingerprinting and partial-reuse reasoning; the repository itself stays
//! a thin SQL layer with no opinions about coverage.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::warn;

use crate::db::cache_repo::{SearchCacheEntry, SearchCacheRepository};
use crate::db::models::ReleaseInfo;

const TOUCH_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    General,
    CrossSeed,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::General => "general",
            Scope::CrossSeed => "cross-seed",
        }
    }
}

/// The payload a cache key is derived from, before fingerprinting.
#[derive(Debug, Clone)]
pub struct CacheKeyInput {
    pub scope: Scope,
    pub query: String,
    pub category_ids: Vec<i32>,
    pub indexer_ids: Vec<i64>,
    pub content_type: String,
}

/// Strips leading/trailing whitespace, collapses internal runs, lowercases.
pub fn canonicalize_query(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn sha256_hex(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `full` includes the sorted indexer ID set; `base` omits it so that an
/// entry covering a superset of indexers can satisfy a narrower request.
pub struct Fingerprints {
    pub full: String,
    pub base: String,
}

pub fn fingerprint(input: &CacheKeyInput) -> Fingerprints {
    let canonical_query = canonicalize_query(&input.query);
    let mut cats = input.category_ids.clone();
    cats.sort_unstable();
    cats.dedup();
    let mut indexers = input.indexer_ids.clone();
    indexers.sort_unstable();
    indexers.dedup();

    let base_payload = format!(
        "{}|{}|{:?}|{}",
        input.scope.as_str(),
        canonical_query,
        cats,
        input.content_type
    );
    let full_payload = format!("{base_payload}|{indexers:?}");

    Fingerprints {
        full: sha256_hex(&full_payload),
        base: sha256_hex(&base_payload),
    }
}

#[derive(Debug, Clone)]
pub struct CoverageResult {
    pub results: Vec<ReleaseInfo>,
    pub covered_indexer_ids: Vec<i64>,
    pub complete: bool,
}

/// Coverage reasoning over non-expired candidates whose `base_fingerprint`
/// matches `base`. `requested` is the indexer set the caller actually wants.
pub fn select_best_coverage(
    candidates: &[SearchCacheEntry],
    requested: &[i64],
    require_full: bool,
) -> Option<(SearchCacheEntry, Vec<i64>)> {
    let requested_set: std::collections::BTreeSet<i64> = requested.iter().copied().collect();

    let mut best: Option<(SearchCacheEntry, Vec<i64>)> = None;
    let mut best_cov_len = 0usize;
    let mut best_total_len = usize::MAX;

    for entry in candidates {
        let entry_ids: Vec<i64> = serde_json::from_str(&entry.indexer_ids_json).unwrap_or_default();
        let entry_set: std::collections::BTreeSet<i64> = entry_ids.iter().copied().collect();
        let cov: Vec<i64> = entry_set.intersection(&requested_set).copied().collect();

        if require_full {
            if entry_set.is_superset(&requested_set) {
                let better = match &best {
                    None => true,
                    Some((prev, _)) => entry.last_used_at > prev.last_used_at,
                };
                if better {
                    best = Some((entry.clone(), cov));
                }
            }
            continue;
        }

        if cov.is_empty() {
            continue;
        }

        let better = cov.len() > best_cov_len
            || (cov.len() == best_cov_len && entry_ids.len() < best_total_len)
            || (cov.len() == best_cov_len
                && entry_ids.len() == best_total_len
                && best.as_ref().is_some_and(|(prev, _)| entry.last_used_at > prev.last_used_at));

        if best.is_none() || better {
            best_cov_len = cov.len();
            best_total_len = entry_ids.len();
            best = Some((entry.clone(), cov));
        }
    }

    best
}

enum TouchMsg {
    Touch(String),
}

/// Thread-safe coverage-aware cache. Writes are serialized per `cache_key`
/// via a map of per-key async mutexes so two concurrent searches for the
/// same canonical request don't race to store duplicate entries; `touch` is
/// fire-and-forget through a bounded channel drained by a background task.
pub struct SearchCache {
    repo: SearchCacheRepository,
    ttl_minutes: Arc<Mutex<i64>>,
    key_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    touch_tx: mpsc::Sender<TouchMsg>,
}

impl SearchCache {
    pub fn new(repo: SearchCacheRepository, initial_ttl_minutes: i64) -> Self {
        let (tx, mut rx) = mpsc::channel::<TouchMsg>(TOUCH_QUEUE_CAPACITY);
        let touch_repo = repo.clone();
        tokio::spawn(async move {
            while let Some(TouchMsg::Touch(key)) = rx.recv().await {
                if let Err(err) = touch_repo.touch(&key).await {
                    warn!(cache_key = %key, error = %err, "search cache touch failed");
                }
            }
        });

        Self {
            repo,
            ttl_minutes: Arc::new(Mutex::new(initial_ttl_minutes)),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            touch_tx: tx,
        }
    }

    fn lock_for(&self, cache_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn fetch(&self, cache_key: &str) -> Result<Option<SearchCacheEntry>> {
        self.repo.fetch(cache_key).await
    }

    pub fn touch(&self, cache_key: &str) {
        let _ = self.touch_tx.try_send(TouchMsg::Touch(cache_key.to_string()));
    }

    /// §4.4 coverage algorithm entry point. Returns `None` if no usable
    /// candidate exists (full or partial, per `require_full`).
    pub async fn load_cached_portion(
        &self,
        input: &CacheKeyInput,
        require_full: bool,
    ) -> Result<Option<CoverageResult>> {
        let fp = fingerprint(input);
        let canonical_query = canonicalize_query(&input.query);
        let candidates = self
            .repo
            .find_active_by_scope_and_query(input.scope.as_str(), &canonical_query)
            .await?
            .into_iter()
            .filter(|e| e.base_fingerprint == fp.base)
            .collect::<Vec<_>>();

        let Some((entry, cov)) = select_best_coverage(&candidates, &input.indexer_ids, require_full) else {
            return Ok(None);
        };

        let all_results: Vec<ReleaseInfo> = serde_json::from_slice(&entry.response_data)?;
        let cov_set: std::collections::BTreeSet<i64> = cov.iter().copied().collect();
        let filtered = all_results
            .into_iter()
            .filter(|r| r.indexer_id.is_some_and(|id| cov_set.contains(&id)))
            .collect();

        self.touch(&entry.cache_key);

        let requested_set: std::collections::BTreeSet<i64> = input.indexer_ids.iter().copied().collect();
        let complete = cov_set.is_superset(&requested_set);

        Ok(Some(CoverageResult {
            results: filtered,
            covered_indexer_ids: cov,
            complete,
        }))
    }

    /// Insert/replace by `cacheKey`; `expiresAt = now + TTL`. Serialized per
    /// key so concurrent searches for the same request don't duplicate work.
    pub async fn store(
        &self,
        input: &CacheKeyInput,
        results: &[ReleaseInfo],
    ) -> Result<()> {
        let fp = fingerprint(input);
        let lock = self.lock_for(&fp.full);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let ttl = *self.ttl_minutes.lock();
        let mut indexer_ids = input.indexer_ids.clone();
        indexer_ids.sort_unstable();
        indexer_ids.dedup();
        let mut categories = input.category_ids.clone();
        categories.sort_unstable();
        categories.dedup();

        let entry = SearchCacheEntry {
            cache_key: fp.full.clone(),
            scope: input.scope.as_str().to_string(),
            canonical_query: canonicalize_query(&input.query),
            categories_json: serde_json::to_string(&categories)?,
            indexer_ids_json: serde_json::to_string(&indexer_ids)?,
            request_fingerprint: fp.full,
            base_fingerprint: fp.base,
            response_data: serde_json::to_vec(results)?,
            total_results: results.len() as i64,
            cached_at: now,
            last_used_at: now,
            expires_at: now + ChronoDuration::minutes(ttl),
            hit_count: 0,
        };

        self.repo.store(&entry).await
    }

    /// Caller must update the in-memory TTL before calling this so the
    /// bulk rebase observes the new value.
    pub async fn set_ttl_minutes(&self, minutes: i64) -> Result<u64> {
        *self.ttl_minutes.lock() = minutes;
        self.repo.set_ttl_minutes(minutes).await?;
        self.repo.rebase_ttl(minutes).await
    }

    pub async fn invalidate_by_indexer_ids(&self, ids: &[i64]) -> Result<u64> {
        self.repo.invalidate_by_indexer_ids(ids).await
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.repo.cleanup_expired().await
    }

    pub async fn flush(&self) -> Result<u64> {
        self.repo.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cache_key: &str, indexer_ids: &[i64], last_used_secs_ago: i64) -> SearchCacheEntry {
        let now = Utc::now();
        SearchCacheEntry {
            cache_key: cache_key.to_string(),
            scope: "general".to_string(),
            canonical_query: "dune 2021".to_string(),
            categories_json: "[2000]".to_string(),
            indexer_ids_json: serde_json::to_string(indexer_ids).unwrap(),
            request_fingerprint: cache_key.to_string(),
            base_fingerprint: "base".to_string(),
            response_data: serde_json::to_vec::<Vec<ReleaseInfo>>(&vec![]).unwrap(),
            total_results: 0,
            cached_at: now,
            last_used_at: now - ChronoDuration::seconds(last_used_secs_ago),
            expires_at: now + ChronoDuration::minutes(15),
            hit_count: 0,
        }
    }

    #[test]
    fn canonicalize_collapses_and_lowercases() {
        assert_eq!(canonicalize_query("  The   Matrix  "), "the matrix");
    }

    #[test]
    fn full_and_base_fingerprints_differ_only_by_indexers() {
        let a = CacheKeyInput {
            scope: Scope::General,
            query: "dune".to_string(),
            category_ids: vec![2000],
            indexer_ids: vec![1, 2],
            content_type: "movie".to_string(),
        };
        let mut b = a.clone();
        b.indexer_ids = vec![3];

        let fp_a = fingerprint(&a);
        let fp_b = fingerprint(&b);
        assert_eq!(fp_a.base, fp_b.base);
        assert_ne!(fp_a.full, fp_b.full);
    }

    #[test]
    fn require_full_returns_only_superset_entries() {
        let e1 = entry("k1", &[1, 2], 100);
        let e2 = entry("k2", &[1, 2, 3], 10);
        let picked = select_best_coverage(&[e1, e2.clone()], &[1, 2, 3], true);
        assert_eq!(picked.unwrap().0.cache_key, "k2");
    }

    #[test]
    fn partial_coverage_prefers_larger_intersection_then_specificity() {
        let e1 = entry("wide", &[1, 2, 3, 4], 100);
        let e2 = entry("narrow", &[1, 2], 50);
        let picked = select_best_coverage(&[e1, e2], &[1, 2], false).unwrap();
        // both cover {1,2} fully; narrow is more specific (fewer total indexer ids)
        assert_eq!(picked.0.cache_key, "narrow");
    }

    #[test]
    fn partial_coverage_ties_broken_by_last_used_desc() {
        let e1 = entry("older", &[1, 2], 500);
        let e2 = entry("newer", &[1, 2], 5);
        let picked = select_best_coverage(&[e1, e2], &[1, 2], false).unwrap();
        assert_eq!(picked.0.cache_key, "newer");
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(select_best_coverage(&[], &[1], false).is_none());
    }
}
