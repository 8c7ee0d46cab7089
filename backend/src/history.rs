//! In-memory ring buffers for `SearchHistoryEntry` (cap 500) and
//! `IndexerOutcome` (cap 1000, keyed by `(jobID, indexerID)`). Nothing here
//! is persisted; state lives only for the process lifetime, guarded by
//! `parking_lot::Mutex` the way `rate_limiter.rs` protects its hot map.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::db::models::{IndexerOutcome, SearchHistoryEntry};

const SEARCH_HISTORY_CAPACITY: usize = 500;
const INDEXER_OUTCOME_CAPACITY: usize = 1000;

/// Fixed-capacity FIFO ring buffer. Writes never block; the oldest entry is
/// evicted once `capacity` is reached.
struct RingBuffer<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    fn push(&mut self, item: T) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(item);
    }

    /// Most recent entry first.
    fn iter_cloned(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.entries.iter().rev().cloned().collect()
    }
}

pub struct SearchHistory {
    buffer: Mutex<RingBuffer<SearchHistoryEntry>>,
    next_id: AtomicU64,
}

impl SearchHistory {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new(SEARCH_HISTORY_CAPACITY)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn record(&self, mut entry: SearchHistoryEntry) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entry.id = id;
        self.buffer.lock().push(entry);
        id
    }

    pub fn recent(&self) -> Vec<SearchHistoryEntry> {
        self.buffer.lock().iter_cloned()
    }

    pub fn for_job(&self, job_id: u64) -> Vec<SearchHistoryEntry> {
        self.buffer.lock().iter_cloned().into_iter().filter(|e| e.job_id == job_id).collect()
    }
}

impl Default for SearchHistory {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IndexerOutcomeStore {
    buffer: Mutex<RingBuffer<IndexerOutcome>>,
}

impl IndexerOutcomeStore {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new(INDEXER_OUTCOME_CAPACITY)),
        }
    }

    pub fn record(&self, outcome: IndexerOutcome) {
        self.buffer.lock().push(outcome);
    }

    pub fn for_job(&self, job_id: u64) -> Vec<IndexerOutcome> {
        self.buffer.lock().iter_cloned().into_iter().filter(|o| o.job_id == job_id).collect()
    }

    pub fn recent(&self) -> Vec<IndexerOutcome> {
        self.buffer.lock().iter_cloned()
    }
}

impl Default for IndexerOutcomeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ContentType, SearchOutcomeStatus};
    use chrono::Utc;

    fn sample_entry(job_id: u64) -> SearchHistoryEntry {
        SearchHistoryEntry {
            id: 0,
            job_id,
            task_id: 1,
            indexer_id: 1,
            indexer_name: "test".to_string(),
            query: None,
            release_name: None,
            categories: vec![],
            content_type: ContentType::Unknown,
            status: SearchOutcomeStatus::Success,
            result_count: 0,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
        }
    }

    #[test]
    fn ring_buffer_evicts_oldest_when_full() {
        let history = SearchHistory::new();
        for job_id in 0..(SEARCH_HISTORY_CAPACITY as u64 + 10) {
            history.record(sample_entry(job_id));
        }
        let recent = history.recent();
        assert_eq!(recent.len(), SEARCH_HISTORY_CAPACITY);
        // Most recent first; last() is the oldest surviving entry.
        assert_eq!(recent.last().unwrap().job_id, 10);
    }

    #[test]
    fn ids_are_assigned_monotonically() {
        let history = SearchHistory::new();
        let id1 = history.record(sample_entry(1));
        let id2 = history.record(sample_entry(1));
        assert!(id2 > id1);
    }

    #[test]
    fn for_job_filters_correctly() {
        let history = SearchHistory::new();
        history.record(sample_entry(1));
        history.record(sample_entry(2));
        history.record(sample_entry(1));
        assert_eq!(history.for_job(1).len(), 2);
    }

    #[test]
    fn outcome_store_caps_at_capacity() {
        let store = IndexerOutcomeStore::new();
        for i in 0..(INDEXER_OUTCOME_CAPACITY + 5) {
            store.record(IndexerOutcome {
                job_id: i as u64,
                indexer_id: 1,
                outcome: SearchOutcomeStatus::Success,
                added_count: 0,
                message: None,
                recorded_at: Utc::now(),
            });
        }
        assert_eq!(store.recent().len(), INDEXER_OUTCOME_CAPACITY);
    }
}
