//! Per-manager scheduler feeding jobs into the shared worker pool.

use crate::action::{execute, ActionJob, ActionJobCollection, JobId, WorkerPool};
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type FinishedHook = Arc<dyn Fn() + Send + Sync>;

/// Owns every job appended to it. A job lives in exactly one of `todo`,
/// `pending` or `processed` until the manager is dropped.
pub struct ActionThreadBase {
    shared: Arc<Shared>,
    pool: WorkerPool,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<Bookkeeping>,
    wakeup: Condvar,
    on_finished: Mutex<Option<FinishedHook>>,
}

#[derive(Default)]
struct Bookkeeping {
    todo: ActionJobCollection,
    pending: HashMap<JobId, Arc<dyn ActionJob>>,
    processed: HashMap<JobId, Arc<dyn ActionJob>>,
    running: bool,
    exit: bool,
    loop_active: bool,
    /// Jobs handed to the pool whose `run` has not returned yet.
    in_pool: usize,
}

impl ActionThreadBase {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Bookkeeping::default()),
                wakeup: Condvar::new(),
                on_finished: Mutex::new(None),
            }),
            pool,
            scheduler: Mutex::new(None),
        }
    }

    pub fn set_maximum_number_of_threads(&self, max_threads: usize) -> Result<()> {
        self.pool.set_maximum_number_of_threads(max_threads)
    }

    pub fn maximum_number_of_threads(&self) -> usize {
        self.pool.maximum_number_of_threads()
    }

    /// Called on the scheduler thread each time its loop exits.
    pub fn set_finished_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_finished.lock() = Some(Arc::new(hook));
    }

    /// Queues `jobs` for dispatch and wakes the scheduling loop.
    pub fn append_jobs(&self, jobs: ActionJobCollection) {
        let mut state = self.shared.state.lock();
        state.todo.merge(jobs);
        state.running = true;
        drop(state);
        self.shared.wakeup.notify_all();
    }

    /// Starts the scheduling loop on its own thread. No-op while it is
    /// already running.
    pub fn start(&self) -> Result<()> {
        let mut scheduler = self.scheduler.lock();
        {
            let mut state = self.shared.state.lock();
            if state.loop_active || state.exit {
                return Ok(());
            }
            state.loop_active = true;
        }
        if let Some(previous) = scheduler.take() {
            let _ = previous.join();
        }

        let shared = Arc::clone(&self.shared);
        let pool = self.pool.clone();
        let spawned = thread::Builder::new()
            .name("dbjobs-scheduler".into())
            .spawn(move || schedule(shared, pool));
        match spawned {
            Ok(handle) => {
                *scheduler = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.state.lock().loop_active = false;
                Err(err.into())
            }
        }
    }

    /// Drops every job not yet dispatched and cancels the dispatched ones
    /// without waiting for them to stop.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.todo.clear();
        let pending: Vec<(JobId, Arc<dyn ActionJob>)> = state.pending.drain().collect();
        for (id, job) in pending {
            job.cancel();
            state.processed.insert(id, job);
        }
        state.running = false;
        drop(state);
        self.shared.wakeup.notify_all();
        if !dropped.is_empty() {
            log::debug!("Dropped {} jobs that never started", dropped.len());
        }
    }

    /// True when no dispatched job is still pending. Jobs appended but not
    /// yet dispatched are not counted.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().pending.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// True while the scheduling loop is alive.
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().loop_active
    }

    /// Blocks until the scheduling loop has exited.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.loop_active {
            self.shared.wakeup.wait(&mut state);
        }
    }

    pub fn todo_count(&self) -> usize {
        self.shared.state.lock().todo.len()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn processed_count(&self) -> usize {
        self.shared.state.lock().processed.len()
    }

    /// Number of bookkeeping collections holding `id`.
    pub fn collections_holding(&self, id: JobId) -> usize {
        let state = self.shared.state.lock();
        usize::from(state.todo.contains(id))
            + usize::from(state.pending.contains_key(&id))
            + usize::from(state.processed.contains_key(&id))
    }
}

impl Shared {
    fn job_finished(&self, id: JobId) {
        let mut state = self.state.lock();
        if let Some(job) = state.pending.remove(&id) {
            state.processed.insert(id, job);
        }
        state.in_pool = state.in_pool.saturating_sub(1);
        if state.pending.is_empty() && state.todo.is_empty() {
            state.running = false;
        }
        drop(state);
        self.wakeup.notify_all();
    }
}

fn schedule(shared: Arc<Shared>, pool: WorkerPool) {
    {
        let mut state = shared.state.lock();
        loop {
            if state.exit {
                break;
            }
            if !state.running {
                // Canceled jobs still report `done`; go idle after them.
                if state.in_pool == 0 {
                    break;
                }
                shared.wakeup.wait(&mut state);
                continue;
            }
            if state.todo.is_empty() {
                shared.wakeup.wait(&mut state);
                continue;
            }
            for (job, priority) in state.todo.take_sorted() {
                let id = job.id();
                state.pending.insert(id, Arc::clone(&job));
                state.in_pool += 1;
                let shared = Arc::clone(&shared);
                pool.submit(priority, move || {
                    execute(job.as_ref());
                    // The manager keeps the last reference.
                    drop(job);
                    shared.job_finished(id);
                });
            }
        }
        state.loop_active = false;
    }
    shared.wakeup.notify_all();

    let hook = shared.on_finished.lock().clone();
    if let Some(hook) = hook {
        hook();
    }
}

impl Drop for ActionThreadBase {
    fn drop(&mut self) {
        self.cancel();
        self.shared.state.lock().exit = true;
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.scheduler.lock().take() {
            // The finished hook may release the last handle from the
            // scheduler thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let mut state = self.shared.state.lock();
        while state.in_pool > 0 {
            self.shared.wakeup.wait(&mut state);
        }
        let todo = state.todo.clear();
        let pending: Vec<_> = state.pending.drain().collect();
        let processed: Vec<_> = state.processed.drain().collect();
        drop(state);

        drop(todo);
        drop(pending);
        drop(processed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::CancelToken;
    use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Blocks in `run` until released or canceled; counts drops. A stubborn
    /// job ignores cancellation and waits for the gate.
    struct GatedJob {
        id: JobId,
        token: CancelToken,
        stubborn: bool,
        gate: Receiver<()>,
        started: Sender<JobId>,
        drops: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    impl ActionJob for GatedJob {
        fn id(&self) -> JobId {
            self.id
        }

        fn token(&self) -> &CancelToken {
            &self.token
        }

        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(self.id);
            while self.stubborn || !self.is_canceled() {
                if self.gate.recv_timeout(Duration::from_millis(10)).is_ok() {
                    return;
                }
            }
        }
    }

    impl Drop for GatedJob {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        gate_tx: Sender<()>,
        gate_rx: Receiver<()>,
        started_tx: Sender<JobId>,
        started_rx: Receiver<JobId>,
        drops: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let (gate_tx, gate_rx) = unbounded();
            let (started_tx, started_rx) = unbounded();
            Self {
                gate_tx,
                gate_rx,
                started_tx,
                started_rx,
                drops: Arc::new(AtomicUsize::new(0)),
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn job(&self) -> Arc<GatedJob> {
            self.build(false)
        }

        fn stubborn_job(&self) -> Arc<GatedJob> {
            self.build(true)
        }

        fn build(&self, stubborn: bool) -> Arc<GatedJob> {
            Arc::new(GatedJob {
                id: Uuid::new_v4(),
                token: CancelToken::new(),
                stubborn,
                gate: self.gate_rx.clone(),
                started: self.started_tx.clone(),
                drops: Arc::clone(&self.drops),
                runs: Arc::clone(&self.runs),
            })
        }
    }

    fn collection(jobs: &[Arc<GatedJob>]) -> ActionJobCollection {
        let mut collection = ActionJobCollection::new();
        for job in jobs {
            collection.insert(job.clone(), 0);
        }
        collection
    }

    #[test]
    fn becomes_idle_once_pending_jobs_finish() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(2).unwrap());
        let jobs = vec![fixture.job(), fixture.job()];
        manager.append_jobs(collection(&jobs));
        assert!(manager.is_running());
        manager.start().unwrap();

        for _ in 0..2 {
            fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(!manager.is_empty());
        for _ in 0..2 {
            fixture.gate_tx.send(()).unwrap();
        }
        manager.wait();

        assert!(manager.is_empty());
        assert!(!manager.is_running());
        assert_eq!(manager.processed_count(), 2);
        for job in &jobs {
            assert_eq!(manager.collections_holding(job.id), 1);
        }
    }

    #[test]
    fn every_job_is_dropped_exactly_once() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(1).unwrap());
        {
            let jobs: Vec<_> = (0..4).map(|_| fixture.job()).collect();
            manager.append_jobs(collection(&jobs));
            manager.start().unwrap();
            fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            for job in &jobs {
                assert_eq!(manager.collections_holding(job.id), 1);
            }
        }
        manager.cancel();
        drop(manager);
        assert_eq!(fixture.drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn cancel_before_start_drops_todo_without_running() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(1).unwrap());
        let jobs = vec![fixture.job(), fixture.job()];
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        manager.append_jobs(collection(&jobs));
        drop(jobs);
        assert_eq!(manager.todo_count(), 2);
        assert!(manager.is_empty());

        manager.cancel();

        assert_eq!(manager.todo_count(), 0);
        for id in ids {
            assert_eq!(manager.collections_holding(id), 0);
        }
        assert_eq!(fixture.drops.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.runs.load(Ordering::SeqCst), 0);
        assert!(!manager.is_running());
    }

    #[test]
    fn cancel_moves_running_jobs_to_processed() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(1).unwrap());
        let dispatched = fixture.job();
        manager.append_jobs(collection(&[dispatched.clone()]));
        manager.start().unwrap();
        fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        manager.cancel();

        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.processed_count(), 1);
        assert_eq!(manager.collections_holding(dispatched.id), 1);
        assert!(dispatched.is_canceled());
        assert!(!manager.is_running());

        manager.wait();
        drop(manager);
        assert_eq!(fixture.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_cancel_matches_single_cancel() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(1).unwrap());
        let job = fixture.job();
        manager.append_jobs(collection(&[job.clone()]));
        manager.start().unwrap();
        fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        manager.cancel();
        let once = (manager.todo_count(), manager.pending_count(), manager.processed_count());
        manager.cancel();
        manager.cancel();
        let thrice = (manager.todo_count(), manager.pending_count(), manager.processed_count());
        assert_eq!(once, thrice);
        assert_eq!(once, (0, 0, 1));
        job.cancel();
        assert!(job.is_canceled());
    }

    #[test]
    fn finished_hook_runs_when_loop_exits() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(1).unwrap());
        let (finished_tx, finished_rx) = bounded(1);
        manager.set_finished_hook(move || {
            let _ = finished_tx.try_send(());
        });
        manager.append_jobs(collection(&[fixture.job()]));
        manager.start().unwrap();
        fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        fixture.gate_tx.send(()).unwrap();
        finished_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!manager.is_active());
    }

    #[test]
    fn canceled_loop_goes_idle_only_after_jobs_return() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(1).unwrap());
        let (finished_tx, finished_rx) = bounded(1);
        manager.set_finished_hook(move || {
            let _ = finished_tx.try_send(());
        });
        manager.append_jobs(collection(&[fixture.stubborn_job()]));
        manager.start().unwrap();
        fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        manager.cancel();
        assert!(finished_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(manager.is_active());

        fixture.gate_tx.send(()).unwrap();
        finished_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        manager.wait();
        assert_eq!(fixture.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lower_priority_value_is_dispatched_first() {
        let fixture = Fixture::new();
        let manager = ActionThreadBase::new(WorkerPool::new(1).unwrap());
        let a = fixture.job();
        let b = fixture.job();
        let mut jobs = ActionJobCollection::new();
        jobs.insert(b.clone(), 5);
        jobs.insert(a.clone(), 0);
        manager.append_jobs(jobs);
        manager.start().unwrap();

        let first = fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        fixture.gate_tx.send(()).unwrap();
        let second = fixture.started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        fixture.gate_tx.send(()).unwrap();
        manager.wait();

        assert_eq!((first, second), (a.id, b.id));
    }
}
