//! Factory for database job threads.

use crate::action::WorkerPool;
use crate::dbjob::JobContext;
use crate::dbjob_info::{AlbumsJobInfo, DatesJobInfo, GpsJobInfo, SearchesJobInfo, TagsJobInfo};
use crate::dbjobs_thread::DbJobsThread;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

type Registry = Arc<Mutex<HashMap<Uuid, Arc<DbJobsThread>>>>;

/// Starts one `DbJobsThread` per request. Started threads stay registered
/// until their scheduler goes idle, so callers may drop the returned handle.
pub struct DbJobsManager {
    ctx: JobContext,
    pool: WorkerPool,
    threads: Registry,
}

impl DbJobsManager {
    pub fn new(ctx: JobContext, pool: WorkerPool) -> Self {
        Self {
            ctx,
            pool,
            threads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn start_albums_job_thread(&self, info: AlbumsJobInfo) -> Result<Arc<DbJobsThread>> {
        self.start_thread(|thread| thread.albums_listing(info))
    }

    pub fn start_dates_job_thread(&self, info: DatesJobInfo) -> Result<Arc<DbJobsThread>> {
        self.start_thread(|thread| thread.dates_listing(info))
    }

    pub fn start_gps_job_thread(&self, info: GpsJobInfo) -> Result<Arc<DbJobsThread>> {
        self.start_thread(|thread| thread.gps_listing(info))
    }

    pub fn start_tags_job_thread(&self, info: TagsJobInfo) -> Result<Arc<DbJobsThread>> {
        self.start_thread(|thread| thread.tags_listing(info))
    }

    pub fn start_searches_job_thread(&self, info: SearchesJobInfo) -> Result<Arc<DbJobsThread>> {
        self.start_thread(|thread| thread.searches_listing(info))
    }

    /// Threads started by this manager that have not finished yet.
    pub fn active_threads(&self) -> usize {
        self.threads.lock().len()
    }

    fn start_thread<F>(&self, listing: F) -> Result<Arc<DbJobsThread>>
    where
        F: FnOnce(&DbJobsThread),
    {
        let thread = Arc::new(DbJobsThread::new(self.pool.clone(), self.ctx.clone()));
        listing(&thread);

        let key = Uuid::new_v4();
        self.threads.lock().insert(key, Arc::clone(&thread));
        let registry = Arc::downgrade(&self.threads);
        thread.connect_finished(move || {
            if let Some(registry) = registry.upgrade() {
                let finished = registry.lock().remove(&key);
                drop(finished);
            }
        });

        if let Err(err) = thread.start() {
            self.threads.lock().remove(&key);
            return Err(err);
        }
        Ok(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbjob::tests::{context, StubCore, StubEngine, StubLister};
    use crate::dbjob::DbJobEvent;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::{Duration, Instant};

    fn manager(engine: Arc<StubEngine>) -> DbJobsManager {
        let lister = StubLister {
            records: 2,
            ..StubLister::default()
        };
        DbJobsManager::new(
            context(StubCore::default(), lister, engine),
            WorkerPool::new(2).unwrap(),
        )
    }

    fn wait_for_finished(thread: &DbJobsThread) -> Vec<DbJobEvent> {
        let rx = thread.events();
        let mut events = Vec::new();
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if event == DbJobEvent::Finished {
                return events;
            }
            events.push(event);
        }
    }

    fn wait_until_idle(manager: &DbJobsManager) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.active_threads() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn finished_threads_leave_the_registry() {
        let manager = manager(Arc::default());
        let thread = manager.start_tags_job_thread(TagsJobInfo::default()).unwrap();
        let events = wait_for_finished(&thread);
        assert_eq!(events.last(), Some(&DbJobEvent::Done));
        wait_until_idle(&manager);
        assert_eq!(manager.active_threads(), 0);
    }

    #[test]
    fn dropped_handle_keeps_the_thread_running() {
        let engine = Arc::new(StubEngine::default());
        let manager = manager(engine.clone());
        let info = SearchesJobInfo::duplicates_for_images(vec![10, 11, 12]);
        drop(manager.start_searches_job_thread(info).unwrap());
        wait_until_idle(&manager);
        assert_eq!(manager.active_threads(), 0);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn each_category_gets_its_own_thread() {
        let manager = manager(Arc::default());
        let albums = manager
            .start_albums_job_thread(AlbumsJobInfo {
                folders: true,
                ..AlbumsJobInfo::default()
            })
            .unwrap();
        let gps = manager
            .start_gps_job_thread(GpsJobInfo {
                direct_query: true,
                ..GpsJobInfo::default()
            })
            .unwrap();
        let dates = manager.start_dates_job_thread(DatesJobInfo::default()).unwrap();

        assert!(wait_for_finished(&albums)
            .iter()
            .any(|e| matches!(e, DbJobEvent::FoldersData(_))));
        assert!(wait_for_finished(&gps)
            .iter()
            .any(|e| matches!(e, DbJobEvent::DirectQueryData(ids) if ids == &vec![3, 1, 2])));
        assert!(wait_for_finished(&dates)
            .iter()
            .any(|e| matches!(e, DbJobEvent::Data(records) if records.len() == 2)));
        wait_until_idle(&manager);
    }
}
