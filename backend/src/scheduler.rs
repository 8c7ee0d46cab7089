//! C2: bounded worker pool with priority ordering over outbound indexer
//! searches.
//!
//! The teacher's `services::job_queue` gates concurrency with a bare
//! `tokio::sync::Semaphore`, which gives bounded parallelism but no notion
//! of "run this one before that one." This component needs both, so a
//! min-heap sits behind a `tokio::sync::Notify` standing in for the
//! condition variable a thread-based pool would use, and workers are plain
//! `tokio::spawn` loops pulling off the same heap — the bounded-concurrency
//! idiom generalized with priority.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::models::{ParamMap, ReleaseInfo, SearchMeta, SearchOutcomeStatus, TorznabIndexer};
use crate::rate_limiter::{Priority, RateLimitOptions, RateLimiter};

/// `rss` submissions cap their wait at 15s, `background` at 60s.
/// `interactive`/`completion` are uncapped.
fn max_wait_ceiling(priority: Priority) -> Option<Duration> {
    match priority {
        Priority::Rss => Some(Duration::from_secs(15)),
        Priority::Background => Some(Duration::from_secs(60)),
        Priority::Interactive | Priority::Completion => None,
    }
}

fn priority_rank(p: Priority) -> u8 {
    match p {
        Priority::Interactive => 0,
        Priority::Rss => 1,
        Priority::Completion => 2,
        Priority::Background => 3,
    }
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What a single indexer exec returns. `complete` carries the cache
/// coverage completeness flag through unchanged; C2 doesn't interpret it.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub results: Vec<ReleaseInfo>,
    pub complete: bool,
    pub error: Option<String>,
}

pub type ExecFn =
    Arc<dyn Fn(CancellationToken, TorznabIndexer, ParamMap, SearchMeta) -> BoxFuture<ExecOutcome> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub job_id: u64,
    pub task_id: u64,
    pub indexer_id: i64,
    pub results: Vec<ReleaseInfo>,
    pub status: SearchOutcomeStatus,
    pub error: Option<String>,
}

pub type OnComplete = Arc<dyn Fn(TaskCompletion) + Send + Sync>;
pub type OnJobDone = Arc<dyn Fn(u64) + Send + Sync>;

pub struct SubmitRequest {
    pub indexers: Vec<TorznabIndexer>,
    pub params: ParamMap,
    pub meta: SearchMeta,
    pub priority: Priority,
    pub exec: ExecFn,
    pub on_complete: OnComplete,
    pub on_job_done: OnJobDone,
    pub cancellation: CancellationToken,
}

struct TaskItem {
    priority_rank: u8,
    created: Instant,
    task_id: u64,
    job_id: u64,
    indexer: TorznabIndexer,
    priority: Priority,
    params: ParamMap,
    meta: SearchMeta,
    dedup_key: Option<(i64, String)>,
    exec: ExecFn,
    on_complete: OnComplete,
    cancellation: CancellationToken,
}

impl PartialEq for TaskItem {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}
impl Eq for TaskItem {}

impl Ord for TaskItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: `BinaryHeap` is a max-heap, but we want smallest
        // priority_rank (interactive=0) and earliest `created`/`task_id`
        // to come out first, so "smaller" must compare as "greater" here.
        other
            .priority_rank
            .cmp(&self.priority_rank)
            .then_with(|| other.created.cmp(&self.created))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}
impl PartialOrd for TaskItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Canonical key for RSS dedup: sorted `k=v` pairs joined, independent of
/// map insertion order (the underlying map is already a `BTreeMap`, this
/// is belt-and-braces if that ever changes).
fn canonical_params(params: &ParamMap) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

struct JobState {
    remaining: usize,
    on_job_done: OnJobDone,
}

pub struct Scheduler {
    heap: Arc<Mutex<BinaryHeap<TaskItem>>>,
    notify: Arc<Notify>,
    dedup: Arc<Mutex<std::collections::HashSet<(i64, String)>>>,
    jobs: Arc<Mutex<HashMap<u64, JobState>>>,
    job_counter: AtomicU64,
    task_counter: AtomicU64,
    rate_limiter: Arc<RateLimiter>,
    stopped: Arc<AtomicBool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(rate_limiter: Arc<RateLimiter>, worker_count: usize) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            notify: Arc::new(Notify::new()),
            dedup: Arc::new(Mutex::new(std::collections::HashSet::new())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            job_counter: AtomicU64::new(1),
            task_counter: AtomicU64::new(1),
            rate_limiter,
            stopped: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(worker_count.max(1));
        for worker_id in 0..worker_count.max(1) {
            let sched = scheduler.clone();
            handles.push(tokio::spawn(async move {
                sched.worker_loop(worker_id).await;
            }));
        }
        *scheduler.workers.lock() = handles;
        scheduler
    }

    /// Nil/empty indexer lists complete the job immediately. Returns the
    /// assigned job ID.
    pub fn submit(&self, req: SubmitRequest) -> u64 {
        let job_id = self.job_counter.fetch_add(1, AtomicOrdering::SeqCst);

        if req.indexers.is_empty() {
            (req.on_job_done)(job_id);
            return job_id;
        }

        let canonical = canonical_params(&req.params);
        let rank = priority_rank(req.priority);
        let mut accepted = 0usize;

        {
            let mut heap = self.heap.lock();
            for indexer in &req.indexers {
                let dedup_key = (indexer.id, canonical.clone());

                if req.priority == Priority::Rss {
                    let mut dedup = self.dedup.lock();
                    if dedup.contains(&dedup_key) {
                        (req.on_complete)(TaskCompletion {
                            job_id,
                            task_id: 0,
                            indexer_id: indexer.id,
                            results: Vec::new(),
                            status: SearchOutcomeStatus::Skipped,
                            error: Some("deduplicated".to_string()),
                        });
                        continue;
                    }
                    dedup.insert(dedup_key.clone());
                }

                let task_id = self.task_counter.fetch_add(1, AtomicOrdering::SeqCst);
                heap.push(TaskItem {
                    priority_rank: rank,
                    created: Instant::now(),
                    task_id,
                    job_id,
                    indexer: indexer.clone(),
                    priority: req.priority,
                    params: req.params.clone(),
                    meta: req.meta.clone(),
                    dedup_key: (req.priority == Priority::Rss).then(|| dedup_key.clone()),
                    exec: req.exec.clone(),
                    on_complete: req.on_complete.clone(),
                    cancellation: req.cancellation.clone(),
                });
                accepted += 1;
            }
        }

        if accepted == 0 {
            (req.on_job_done)(job_id);
            return job_id;
        }

        self.jobs.lock().insert(
            job_id,
            JobState {
                remaining: accepted,
                on_job_done: req.on_job_done,
            },
        );
        self.notify.notify_waiters();
        job_id
    }

    /// Drains workers, refuses new submissions (by stopping acceptance of
    /// further pops), and lets in-flight tasks honor their own
    /// cancellation tokens.
    pub async fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let Some(task) = self.next_task().await else {
                debug!(worker_id, "scheduler worker shutting down");
                return;
            };
            self.run_task(task).await;
        }
    }

    async fn next_task(&self) -> Option<TaskItem> {
        loop {
            if let Some(item) = self.heap.lock().pop() {
                return Some(item);
            }
            if self.stopped.load(AtomicOrdering::SeqCst) {
                return None;
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
    }

    async fn run_task(&self, task: TaskItem) {
        let wait = self.rate_limiter.next_wait(task.indexer.id, task.priority, RateLimitOptions::default());

        if let Some(ceiling) = max_wait_ceiling(task.priority) {
            if wait > ceiling {
                self.deliver(
                    &task,
                    TaskCompletion {
                        job_id: task.job_id,
                        task_id: task.task_id,
                        indexer_id: task.indexer.id,
                        results: Vec::new(),
                        status: SearchOutcomeStatus::RateLimited,
                        error: Some(format!("rate limit wait {wait:?} exceeds max wait {ceiling:?}")),
                    },
                );
                self.finalize(&task);
                return;
            }
        }

        if wait > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = task.cancellation.cancelled() => {
                    self.deliver(&task, TaskCompletion {
                        job_id: task.job_id,
                        task_id: task.task_id,
                        indexer_id: task.indexer.id,
                        results: Vec::new(),
                        status: SearchOutcomeStatus::Error,
                        error: Some("cancelled".to_string()),
                    });
                    self.finalize(&task);
                    return;
                }
            }
        }

        let exec = task.exec.clone();
        let indexer = task.indexer.clone();
        let params = task.params.clone();
        let meta = task.meta.clone();
        let cancellation = task.cancellation.clone();

        let handle = tokio::spawn(async move { (exec)(cancellation, indexer, params, meta).await });
        let handle_result = handle.await;
        // Record on return, not on dispatch, so `last_request_at` reflects
        // when the call actually completed (§4.2).
        self.rate_limiter.record_request(task.indexer.id, None);

        let completion = match handle_result {
            Ok(outcome) => TaskCompletion {
                job_id: task.job_id,
                task_id: task.task_id,
                indexer_id: task.indexer.id,
                results: outcome.results,
                status: if outcome.error.is_some() {
                    SearchOutcomeStatus::Error
                } else {
                    SearchOutcomeStatus::Success
                },
                error: outcome.error,
            },
            Err(join_err) if join_err.is_panic() => {
                warn!(indexer_id = task.indexer.id, "scheduler worker panic");
                TaskCompletion {
                    job_id: task.job_id,
                    task_id: task.task_id,
                    indexer_id: task.indexer.id,
                    results: Vec::new(),
                    status: SearchOutcomeStatus::Error,
                    error: Some(format!("scheduler worker panic: {join_err}")),
                }
            }
            Err(join_err) => TaskCompletion {
                job_id: task.job_id,
                task_id: task.task_id,
                indexer_id: task.indexer.id,
                results: Vec::new(),
                status: SearchOutcomeStatus::Error,
                error: Some(format!("task cancelled: {join_err}")),
            },
        };

        self.deliver(&task, completion);
        self.finalize(&task);
    }

    fn deliver(&self, task: &TaskItem, completion: TaskCompletion) {
        (task.on_complete)(completion);
    }

    fn finalize(&self, task: &TaskItem) {
        if let Some(key) = &task.dedup_key {
            self.dedup.lock().remove(key);
        }

        let mut jobs = self.jobs.lock();
        if let Some(state) = jobs.get_mut(&task.job_id) {
            state.remaining -= 1;
            if state.remaining == 0 {
                let state = jobs.remove(&task.job_id).unwrap();
                (state.on_job_done)(task.job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_indexer(id: i64) -> TorznabIndexer {
        TorznabIndexer {
            id,
            name: format!("indexer-{id}"),
            backend: crate::db::models::IndexerBackend::Native,
            base_url: "https://example.test".to_string(),
            api_key_encrypted: None,
            enabled: true,
            priority: 0,
            timeout_seconds: 30,
            capabilities: vec![],
            categories: vec![],
        }
    }

    fn instant_exec(results: Vec<ReleaseInfo>) -> ExecFn {
        Arc::new(move |_cancel, _indexer, _params, _meta| {
            let results = results.clone();
            Box::pin(async move {
                ExecOutcome {
                    results,
                    complete: true,
                    error: None,
                }
            })
        })
    }

    #[tokio::test]
    async fn empty_indexer_list_completes_job_immediately() {
        let rl = Arc::new(RateLimiter::new());
        let sched = Scheduler::new(rl, 1);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();

        sched.submit(SubmitRequest {
            indexers: vec![],
            params: ParamMap::new(),
            meta: SearchMeta::default(),
            priority: Priority::Interactive,
            exec: instant_exec(vec![]),
            on_complete: Arc::new(|_| {}),
            on_job_done: Arc::new(move |_| done2.store(true, AtomicOrdering::SeqCst)),
            cancellation: CancellationToken::new(),
        });

        assert!(done.load(AtomicOrdering::SeqCst));
        sched.stop().await;
    }

    #[tokio::test]
    async fn single_indexer_delivers_complete_then_job_done() {
        let rl = Arc::new(RateLimiter::new());
        let sched = Scheduler::new(rl, 1);
        let completions = Arc::new(AtomicUsize::new(0));
        let job_done = Arc::new(AtomicBool::new(false));
        let c2 = completions.clone();
        let j2 = job_done.clone();

        sched.submit(SubmitRequest {
            indexers: vec![test_indexer(1)],
            params: ParamMap::new(),
            meta: SearchMeta::default(),
            priority: Priority::Interactive,
            exec: instant_exec(vec![]),
            on_complete: Arc::new(move |_| {
                c2.fetch_add(1, AtomicOrdering::SeqCst);
            }),
            on_job_done: Arc::new(move |_| j2.store(true, AtomicOrdering::SeqCst)),
            cancellation: CancellationToken::new(),
        });

        for _ in 0..50 {
            if job_done.load(AtomicOrdering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(completions.load(AtomicOrdering::SeqCst), 1);
        assert!(job_done.load(AtomicOrdering::SeqCst));
        sched.stop().await;
    }

    #[tokio::test]
    async fn rss_duplicate_submission_is_deduplicated() {
        let rl = Arc::new(RateLimiter::new());
        let sched = Scheduler::new(rl, 1);
        let statuses = Arc::new(Mutex::new(Vec::new()));

        let mut params = ParamMap::new();
        params.insert("q".to_string(), "same query".to_string());

        for _ in 0..2 {
            let statuses = statuses.clone();
            sched.submit(SubmitRequest {
                indexers: vec![test_indexer(7)],
                params: params.clone(),
                meta: SearchMeta::default(),
                priority: Priority::Rss,
                exec: instant_exec(vec![]),
                on_complete: Arc::new(move |c| statuses.lock().push(c.status)),
                on_job_done: Arc::new(|_| {}),
                cancellation: CancellationToken::new(),
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = statuses.lock().clone();
        assert!(got.contains(&SearchOutcomeStatus::Skipped));
        sched.stop().await;
    }

    #[test]
    fn interactive_task_is_popped_before_background_task_queued_earlier() {
        // Verify ordering through the heap's `Ord` impl directly, without
        // spinning up workers.
        let mut heap = BinaryHeap::new();
        let bg = TaskItem {
            priority_rank: priority_rank(Priority::Background),
            created: Instant::now(),
            task_id: 1,
            job_id: 1,
            indexer: test_indexer(1),
            priority: Priority::Background,
            params: ParamMap::new(),
            meta: SearchMeta::default(),
            dedup_key: None,
            exec: instant_exec(vec![]),
            on_complete: Arc::new(|_| {}),
            cancellation: CancellationToken::new(),
        };
        std::thread::sleep(Duration::from_millis(5));
        let interactive = TaskItem {
            priority_rank: priority_rank(Priority::Interactive),
            created: Instant::now(),
            task_id: 2,
            job_id: 1,
            indexer: test_indexer(2),
            priority: Priority::Interactive,
            params: ParamMap::new(),
            meta: SearchMeta::default(),
            dedup_key: None,
            exec: instant_exec(vec![]),
            on_complete: Arc::new(|_| {}),
            cancellation: CancellationToken::new(),
        };
        heap.push(bg);
        heap.push(interactive);

        let popped = heap.pop().unwrap();
        assert_eq!(popped.task_id, 2, "interactive task should pop first despite being queued later");
    }
}
