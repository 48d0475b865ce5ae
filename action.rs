//! Units of background work and the shared worker pool that runs them.
//!
//! A job never owns itself: the `ActionThreadBase` that appended it keeps it
//! alive, the pool only borrows it for the duration of `run`.

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub type JobId = Uuid;

/// Cooperative cancellation flag shared between a job and whoever owns it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub trait ActionJob: Send + Sync {
    fn id(&self) -> JobId;

    fn token(&self) -> &CancelToken;

    /// Executes the work on a pool thread. Must poll `is_canceled` between
    /// iterations and return early once it is set.
    fn run(&self);

    /// Called on the pool thread right before `run`.
    fn started(&self) {}

    /// Called when `run` panicked; `done` still follows.
    fn failed(&self, _message: &str) {}

    /// Called exactly once after `run` returned, whatever the outcome.
    fn done(&self) {}

    fn cancel(&self) {
        self.token().cancel();
    }

    fn is_canceled(&self) -> bool {
        self.token().is_canceled()
    }
}

/// Runs one job to completion on the current thread.
pub(crate) fn execute(job: &dyn ActionJob) {
    job.started();
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job.run())) {
        let message = panic_message(panic.as_ref());
        log::warn!("Job {} panicked: {}", job.id(), message);
        job.failed(&message);
    }
    job.done();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

/// Jobs with their scheduling priority, in insertion order.
///
/// Priority 0 is processed first: a LOWER value means EARLIER dispatch.
#[derive(Clone, Default)]
pub struct ActionJobCollection {
    entries: Vec<(Arc<dyn ActionJob>, i32)>,
}

impl ActionJobCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `job`, or updates its priority when it is already present.
    pub fn insert(&mut self, job: Arc<dyn ActionJob>, priority: i32) {
        let id = job.id();
        match self.entries.iter_mut().find(|(j, _)| j.id() == id) {
            Some(entry) => entry.1 = priority,
            None => self.entries.push((job, priority)),
        }
    }

    pub fn merge(&mut self, other: ActionJobCollection) {
        for (job, priority) in other.entries {
            self.insert(job, priority);
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.entries.iter().any(|(j, _)| j.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Arc<dyn ActionJob>, i32)> {
        self.entries.iter()
    }

    /// Empties the collection, returning its entries by ascending priority.
    /// Equal priorities keep their insertion order.
    pub fn take_sorted(&mut self) -> Vec<(Arc<dyn ActionJob>, i32)> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|(_, priority)| *priority);
        entries
    }

    pub fn clear(&mut self) -> Vec<(Arc<dyn ActionJob>, i32)> {
        std::mem::take(&mut self.entries)
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    priority: i32,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap pops the greatest element: invert so the lowest priority
    // value, then the oldest submission, comes out first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Worker threads shared by every thread manager.
///
/// Submissions go through a priority queue; each rayon task pops the most
/// urgent queued entry when it gets a thread.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    threads: RwLock<Arc<rayon::ThreadPool>>,
    max_threads: AtomicUsize,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    seq: AtomicU64,
}

impl WorkerPool {
    pub fn new(max_threads: usize) -> Result<Self> {
        let max_threads = max_threads.max(1);
        let threads = build_threads(max_threads)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                threads: RwLock::new(Arc::new(threads)),
                max_threads: AtomicUsize::new(max_threads),
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
            }),
        })
    }

    /// One worker per available core.
    pub fn with_default_threads() -> Result<Self> {
        Self::new(num_cpus::get())
    }

    /// Applies to tasks submitted from now on; queued tasks still drain.
    pub fn set_maximum_number_of_threads(&self, max_threads: usize) -> Result<()> {
        let max_threads = max_threads.max(1);
        if max_threads == self.maximum_number_of_threads() {
            return Ok(());
        }
        let threads = build_threads(max_threads)?;
        *self.inner.threads.write() = Arc::new(threads);
        self.inner.max_threads.store(max_threads, Ordering::Relaxed);
        log::debug!("Worker pool resized to {max_threads} threads");
        Ok(())
    }

    pub fn maximum_number_of_threads(&self) -> usize {
        self.inner.max_threads.load(Ordering::Relaxed)
    }

    /// Tasks waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub(crate) fn submit<F>(&self, priority: i32, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().push(QueuedTask {
            priority,
            seq,
            task: Box::new(task),
        });
        let threads = Arc::clone(&self.inner.threads.read());
        let inner = Arc::clone(&self.inner);
        threads.spawn(move || {
            let next = inner.queue.lock().pop();
            if let Some(next) = next {
                (next.task)();
            }
        });
    }
}

fn build_threads(max_threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .thread_name(|i| format!("dbjobs-worker-{i}"))
        .panic_handler(|_| log::warn!("Worker task panicked outside of a job"))
        .build()
        .map_err(|err| Error::Init(format!("Worker pool creation failed: {err}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};
    use std::time::Duration;

    pub(crate) struct NoopJob {
        id: JobId,
        token: CancelToken,
    }

    impl NoopJob {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                token: CancelToken::new(),
            })
        }
    }

    impl ActionJob for NoopJob {
        fn id(&self) -> JobId {
            self.id
        }

        fn token(&self) -> &CancelToken {
            &self.token
        }

        fn run(&self) {}
    }

    struct PanickingJob {
        token: CancelToken,
        failed: AtomicBool,
        done: AtomicUsize,
    }

    impl ActionJob for PanickingJob {
        fn id(&self) -> JobId {
            Uuid::nil()
        }

        fn token(&self) -> &CancelToken {
            &self.token
        }

        fn run(&self) {
            panic!("boom");
        }

        fn failed(&self, message: &str) {
            assert_eq!(message, "boom");
            self.failed.store(true, Ordering::SeqCst);
        }

        fn done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_token_is_idempotent() {
        let token = CancelToken::new();
        let shared = token.clone();
        assert!(!shared.is_canceled());
        token.cancel();
        token.cancel();
        assert!(shared.is_canceled());
    }

    #[test]
    fn panicking_job_still_reports_done() {
        let job = PanickingJob {
            token: CancelToken::new(),
            failed: AtomicBool::new(false),
            done: AtomicUsize::new(0),
        };
        execute(&job);
        assert!(job.failed.load(Ordering::SeqCst));
        assert_eq!(job.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn collection_sorts_by_priority_and_keeps_ties_in_order() {
        let a = NoopJob::new();
        let b = NoopJob::new();
        let c = NoopJob::new();
        let mut collection = ActionJobCollection::new();
        collection.insert(b.clone(), 5);
        collection.insert(a.clone(), 0);
        collection.insert(c.clone(), 5);
        let order: Vec<JobId> = collection.take_sorted().iter().map(|(j, _)| j.id()).collect();
        assert_eq!(order, vec![a.id(), b.id(), c.id()]);
        assert!(collection.is_empty());
    }

    #[test]
    fn reinserting_a_job_updates_its_priority() {
        let a = NoopJob::new();
        let mut collection = ActionJobCollection::new();
        collection.insert(a.clone(), 5);
        collection.insert(a.clone(), 1);
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.iter().next().map(|(_, p)| *p), Some(1));
    }

    #[test]
    fn pool_runs_lower_priority_value_first() {
        let pool = WorkerPool::new(1).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        pool.submit(0, move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (order_tx, order_rx) = unbounded();
        for (priority, name) in [(5, "b"), (0, "a"), (5, "c")] {
            let order_tx = order_tx.clone();
            pool.submit(priority, move || order_tx.send(name).unwrap());
        }
        gate_tx.send(()).unwrap();

        let order: Vec<&str> = (0..3)
            .map(|_| order_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn pool_can_be_resized() {
        let pool = WorkerPool::new(2).unwrap();
        pool.set_maximum_number_of_threads(4).unwrap();
        assert_eq!(pool.maximum_number_of_threads(), 4);
        pool.set_maximum_number_of_threads(0).unwrap();
        assert_eq!(pool.maximum_number_of_threads(), 1);
    }
}
