//! A thread manager dedicated to one job category.

use crate::action::{ActionJobCollection, WorkerPool};
use crate::action_thread::ActionThreadBase;
use crate::dbjob::{DbJob, DbJobEvent, EventSink, JobContext};
use crate::dbjob_info::{
    AlbumsJobInfo, DatesJobInfo, DbJobInfo, GpsJobInfo, SearchesJobInfo, TagsJobInfo,
};
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type FinishedHook = Arc<dyn Fn() + Send + Sync>;

/// Runs database jobs and forwards their events on one channel. Once the
/// scheduler goes idle a `Finished` event follows the last job's `Done`.
pub struct DbJobsThread {
    base: ActionThreadBase,
    ctx: JobContext,
    tx: Sender<DbJobEvent>,
    rx: Receiver<DbJobEvent>,
    errors: Arc<Mutex<Vec<String>>>,
    on_finished: Arc<Mutex<Option<FinishedHook>>>,
    started: AtomicBool,
}

impl DbJobsThread {
    pub fn new(pool: WorkerPool, ctx: JobContext) -> Self {
        let (tx, rx) = unbounded();
        let base = ActionThreadBase::new(pool);
        let on_finished: Arc<Mutex<Option<FinishedHook>>> = Arc::new(Mutex::new(None));

        let finished_tx = tx.clone();
        let hook = Arc::clone(&on_finished);
        base.set_finished_hook(move || {
            let _ = finished_tx.send(DbJobEvent::Finished);
            let hook = hook.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        });

        Self {
            base,
            ctx,
            tx,
            rx,
            errors: Arc::new(Mutex::new(Vec::new())),
            on_finished,
            started: AtomicBool::new(false),
        }
    }

    pub fn albums_listing(&self, info: AlbumsJobInfo) {
        self.submit(DbJobInfo::Albums(info));
    }

    pub fn dates_listing(&self, info: DatesJobInfo) {
        self.submit(DbJobInfo::Dates(info));
    }

    pub fn gps_listing(&self, info: GpsJobInfo) {
        self.submit(DbJobInfo::Gps(info));
    }

    pub fn tags_listing(&self, info: TagsJobInfo) {
        self.submit(DbJobInfo::Tags(info));
    }

    pub fn searches_listing(&self, info: SearchesJobInfo) {
        self.submit(DbJobInfo::Searches(info));
    }

    fn submit(&self, info: DbJobInfo) {
        log::debug!("Queueing {} job", info.kind());
        let sink = EventSink::new(self.tx.clone(), Arc::clone(&self.errors));
        let job = DbJob::new(info, self.ctx.clone(), sink);
        let mut collection = ActionJobCollection::new();
        collection.insert(job, 0);
        self.base.append_jobs(collection);
        // Once started, a listing queued after the loop went idle wakes it again.
        if self.started.load(Ordering::SeqCst) {
            if let Err(err) = self.base.start() {
                log::warn!("Could not restart job scheduler: {err}");
            }
        }
    }

    /// Starts dispatching queued jobs.
    pub fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        self.base.start()
    }

    /// Called on the scheduler thread right after `Finished` is sent.
    pub fn connect_finished<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_finished.lock() = Some(Arc::new(hook));
    }

    pub fn events(&self) -> Receiver<DbJobEvent> {
        self.rx.clone()
    }

    pub fn cancel(&self) {
        self.base.cancel();
    }

    /// Blocks until the scheduler has gone idle.
    pub fn wait(&self) {
        self.base.wait();
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.base.is_running()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    pub fn errors_list(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbjob::tests::{context, StubCore, StubEngine, StubLister};
    use std::time::Duration;

    fn collect_until_finished(rx: &Receiver<DbJobEvent>) -> Vec<DbJobEvent> {
        let mut events = Vec::new();
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let finished = event == DbJobEvent::Finished;
            events.push(event);
            if finished {
                return events;
            }
        }
    }

    #[test]
    fn finished_follows_done() {
        let lister = StubLister {
            records: 3,
            ..StubLister::default()
        };
        let thread = DbJobsThread::new(
            WorkerPool::new(1).unwrap(),
            context(StubCore::default(), lister, Arc::default()),
        );
        thread.dates_listing(DatesJobInfo::default());
        thread.start().unwrap();

        let events = collect_until_finished(&thread.events());
        let tail = &events[events.len() - 2..];
        assert_eq!(tail, &[DbJobEvent::Done, DbJobEvent::Finished]);
        assert!(!thread.has_errors());
        thread.wait();
        assert!(thread.is_empty());
        assert!(!thread.is_running());
    }

    #[test]
    fn cancel_still_delivers_done_before_finished() {
        let engine = Arc::new(StubEngine {
            wait_for_cancel: true,
            ..StubEngine::default()
        });
        let thread = DbJobsThread::new(
            WorkerPool::new(1).unwrap(),
            context(StubCore::default(), StubLister::default(), engine),
        );
        thread.searches_listing(SearchesJobInfo::duplicates_for_images(vec![10, 11, 12]));
        thread.start().unwrap();

        let rx = thread.events();
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if event == DbJobEvent::ProcessedSize(1) {
                break;
            }
        }
        thread.cancel();

        let after_cancel = collect_until_finished(&rx);
        assert_eq!(after_cancel, vec![DbJobEvent::Done, DbJobEvent::Finished]);
        thread.wait();
        assert!(!thread.is_running());
    }

    #[test]
    fn listing_after_idle_restarts_the_scheduler() {
        let lister = StubLister {
            records: 1,
            ..StubLister::default()
        };
        let thread = DbJobsThread::new(
            WorkerPool::new(1).unwrap(),
            context(StubCore::default(), lister, Arc::default()),
        );
        thread.dates_listing(DatesJobInfo::default());
        thread.start().unwrap();
        let rx = thread.events();
        collect_until_finished(&rx);
        thread.wait();

        thread.dates_listing(DatesJobInfo::default());
        let events = collect_until_finished(&rx);
        assert_eq!(events.first(), Some(&DbJobEvent::Started));
        assert_eq!(&events[events.len() - 2..], &[DbJobEvent::Done, DbJobEvent::Finished]);
    }

    #[test]
    fn query_errors_are_accumulated() {
        let core = StubCore {
            fail: true,
            ..StubCore::default()
        };
        let thread = DbJobsThread::new(
            WorkerPool::new(2).unwrap(),
            context(core, StubLister::default(), Arc::default()),
        );
        let folders = AlbumsJobInfo {
            folders: true,
            ..AlbumsJobInfo::default()
        };
        thread.albums_listing(folders.clone());
        thread.albums_listing(folders);
        thread.start().unwrap();

        let events = collect_until_finished(&thread.events());
        let done = events.iter().filter(|e| **e == DbJobEvent::Done).count();
        assert_eq!(done, 2);
        assert!(thread.has_errors());
        let errors = thread.errors_list();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.contains("albums table is gone")));
    }
}
