//! The database job: one `ActionJob` per `DbJobInfo`, streaming its results
//! as `DbJobEvent`s.

use crate::action::{ActionJob, CancelToken, JobId};
use crate::config::JobsConfig;
use crate::coredb::{CoreDb, ImageLister, ListerOptions, ListerReceiver};
use crate::dbjob_info::{
    AlbumsJobInfo, DatesJobInfo, DbJobInfo, GpsJobInfo, SearchesJobInfo, TagsJobInfo,
};
use crate::error::Result;
use crate::haariface::{HaarProgressObserver, SimilarityEngine};
use crate::models::{
    ImageId, ImageListerRecord, SearchType, TagId, AUTODETECTED_FACE_PROPERTY,
    TAG_REGION_PROPERTY,
};
use chrono::NaiveDate;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum DbJobEvent {
    Started,
    /// Image count per album or per tag.
    FoldersData(HashMap<i32, i32>),
    /// Image count per tag, keyed by face property name.
    FaceFoldersData(HashMap<String, HashMap<TagId, i32>>),
    DateFoldersData(BTreeMap<NaiveDate, i32>),
    Data(Vec<ImageListerRecord>),
    DirectQueryData(Vec<ImageId>),
    TotalSize(usize),
    ProcessedSize(usize),
    Error(String),
    /// Last event of every job.
    Done,
    /// Sent by the thread once its scheduling loop has gone idle.
    Finished,
}

/// Where a job's events go. Error messages are also kept for the owning
/// thread's error list.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Sender<DbJobEvent>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<DbJobEvent>, errors: Arc<Mutex<Vec<String>>>) -> Self {
        Self { tx, errors }
    }

    pub(crate) fn emit(&self, event: DbJobEvent) {
        if let DbJobEvent::Error(message) = &event {
            self.errors.lock().push(message.clone());
        }
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }
}

/// Collaborators shared by every job a manager creates.
#[derive(Clone)]
pub struct JobContext {
    pub core_db: Arc<dyn CoreDb>,
    pub lister: Arc<dyn ImageLister>,
    pub engine: Arc<dyn SimilarityEngine>,
    pub config: JobsConfig,
}

pub struct DbJob {
    id: JobId,
    token: CancelToken,
    info: DbJobInfo,
    ctx: JobContext,
    sink: EventSink,
}

impl DbJob {
    pub(crate) fn new(info: DbJobInfo, ctx: JobContext, sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            token: CancelToken::new(),
            info,
            ctx,
            sink,
        })
    }

    pub fn info(&self) -> &DbJobInfo {
        &self.info
    }

    fn emit(&self, event: DbJobEvent) {
        self.sink.emit(event);
    }

    fn fixed_receiver(&self) -> BatchReceiver<'_> {
        BatchReceiver::new(self, self.ctx.config.listing_batch_size, None)
    }

    fn growing_receiver(&self) -> BatchReceiver<'_> {
        let growing = self.ctx.config.growing_batch;
        BatchReceiver::new(self, growing.start, Some((growing.increment, growing.end)))
    }

    fn run_albums(&self, info: &AlbumsJobInfo) -> Result<()> {
        if info.folders {
            let counts = self.ctx.core_db.number_of_images_in_albums()?;
            self.emit(DbJobEvent::FoldersData(counts));
            return Ok(());
        }

        let mut receiver = self.growing_receiver();
        self.ctx.lister.list_album(
            lister_options(info.recursive, info.list_available_images_only, false),
            &mut receiver,
            info.album_root_id,
            &info.album,
        );
        receiver.finish();
        Ok(())
    }

    fn run_dates(&self, info: &DatesJobInfo) -> Result<()> {
        if info.folders {
            let dates = self.ctx.core_db.all_creation_dates_and_number_of_images()?;
            self.emit(DbJobEvent::DateFoldersData(dates));
            return Ok(());
        }

        let mut receiver = self.fixed_receiver();
        self.ctx.lister.list_date_range(
            lister_options(true, info.list_available_images_only, false),
            &mut receiver,
            info.start_date,
            info.end_date,
        );
        receiver.finish();
        Ok(())
    }

    fn run_gps(&self, info: &GpsJobInfo) -> Result<()> {
        if info.direct_query {
            let ids = self.ctx.core_db.image_ids_from_area(
                info.lat1,
                info.lat2,
                info.lng1,
                info.lng2,
                info.limit,
                &info.sort_key,
            )?;
            self.emit(DbJobEvent::DirectQueryData(ids));
            return Ok(());
        }

        let mut receiver = self.fixed_receiver();
        self.ctx.lister.list_area_range(
            lister_options(true, info.list_available_images_only, true),
            &mut receiver,
            info.lat1,
            info.lat2,
            info.lng1,
            info.lng2,
        );
        receiver.finish();
        Ok(())
    }

    fn run_tags(&self, info: &TagsJobInfo) -> Result<()> {
        if info.folders {
            let counts = self.ctx.core_db.number_of_images_in_tags()?;
            self.emit(DbJobEvent::FoldersData(counts));
            return Ok(());
        }

        if info.face_folders {
            let mut counts = HashMap::new();
            for property in [AUTODETECTED_FACE_PROPERTY, TAG_REGION_PROPERTY] {
                let per_tag = self.ctx.core_db.number_of_images_in_tag_properties(property)?;
                counts.insert(property.to_string(), per_tag);
            }
            self.emit(DbJobEvent::FaceFoldersData(counts));
            return Ok(());
        }

        let mut receiver = self.fixed_receiver();
        match &info.special_tag {
            Some(property) => {
                let options = lister_options(info.recursive, info.list_available_images_only, true);
                for tag_id in &info.tag_ids {
                    if self.is_canceled() {
                        break;
                    }
                    self.ctx
                        .lister
                        .list_image_tag_property_search(options, &mut receiver, *tag_id, property);
                }
            }
            None => self.ctx.lister.list_tag(
                lister_options(info.recursive, info.list_available_images_only, false),
                &mut receiver,
                &info.tag_ids,
            ),
        }
        receiver.finish();
        Ok(())
    }

    fn run_searches(&self, info: &SearchesJobInfo) -> Result<()> {
        if info.duplicates {
            return self.run_duplicates(info);
        }

        let options = lister_options(true, info.list_available_images_only, false);
        for search_id in &info.search_ids {
            if self.is_canceled() {
                break;
            }
            let Some(search) = self.ctx.core_db.search_info(*search_id)? else {
                self.emit(DbJobEvent::Error(format!("Search {search_id} does not exist")));
                continue;
            };

            let mut receiver = self.fixed_receiver();
            match search.kind {
                SearchType::Haar => {
                    self.ctx.lister.list_haar_search(options, &mut receiver, &search.query)
                }
                _ => {
                    let reference = search.name.trim().parse::<ImageId>().ok();
                    self.ctx
                        .lister
                        .list_search(options, &mut receiver, &search.query, None, reference)
                }
            }
            if !receiver.has_error {
                receiver.finish();
            }
        }
        Ok(())
    }

    fn run_duplicates(&self, info: &SearchesJobInfo) -> Result<()> {
        if !info.has_scope() {
            log::warn!("Duplicates search {} has no album, tag or image to scan", self.id);
            return Ok(());
        }

        let (min_threshold, max_threshold) = info.effective_thresholds(&self.ctx.config.duplicates);
        let observer = DuplicatesProgressObserver::new(self);
        if info.album_update {
            self.ctx.engine.rebuild_duplicates_albums_for_images(
                &info.image_ids,
                min_threshold,
                max_threshold,
                info.search_result_restriction,
                &observer,
            )
        } else {
            self.ctx.engine.rebuild_duplicates_albums(
                &info.album_ids,
                &info.tag_ids,
                info.album_tag_relation,
                min_threshold,
                max_threshold,
                info.search_result_restriction,
                &observer,
            )
        }
    }
}

impl ActionJob for DbJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn token(&self) -> &CancelToken {
        &self.token
    }

    fn run(&self) {
        let result = match &self.info {
            DbJobInfo::Albums(info) => self.run_albums(info),
            DbJobInfo::Dates(info) => self.run_dates(info),
            DbJobInfo::Gps(info) => self.run_gps(info),
            DbJobInfo::Tags(info) => self.run_tags(info),
            DbJobInfo::Searches(info) => self.run_searches(info),
        };
        if let Err(err) = result {
            log::warn!("{} job {} failed: {}", self.info.kind(), self.id, err);
            self.emit(DbJobEvent::Error(err.to_string()));
        }
    }

    fn started(&self) {
        self.emit(DbJobEvent::Started);
    }

    fn failed(&self, message: &str) {
        self.emit(DbJobEvent::Error(format!("{} job aborted: {message}", self.info.kind())));
    }

    fn done(&self) {
        self.emit(DbJobEvent::Done);
    }
}

fn lister_options(recursive: bool, list_only_available: bool, allow_extra_values: bool) -> ListerOptions {
    ListerOptions {
        recursive,
        list_only_available,
        allow_extra_values,
    }
}

/// Collects lister records and sends them as `Data` batches. With growth
/// set, each batch is larger than the last up to the given cap.
struct BatchReceiver<'a> {
    job: &'a DbJob,
    records: Vec<ImageListerRecord>,
    limit: usize,
    growth: Option<(usize, usize)>,
    has_error: bool,
}

impl<'a> BatchReceiver<'a> {
    fn new(job: &'a DbJob, limit: usize, growth: Option<(usize, usize)>) -> Self {
        Self {
            job,
            records: Vec::with_capacity(limit),
            limit: limit.max(1),
            growth,
            has_error: false,
        }
    }

    fn send_data(&mut self) {
        if self.records.is_empty() || self.job.is_canceled() {
            return;
        }
        let batch = std::mem::replace(&mut self.records, Vec::with_capacity(self.limit));
        self.job.emit(DbJobEvent::Data(batch));
    }

    fn finish(mut self) {
        self.send_data();
    }
}

impl ListerReceiver for BatchReceiver<'_> {
    fn receive(&mut self, record: ImageListerRecord) {
        self.records.push(record);
        if self.records.len() >= self.limit {
            self.send_data();
            if let Some((increment, end)) = self.growth {
                self.limit = (self.limit + increment).min(end);
            }
        }
    }

    fn error(&mut self, message: String) {
        self.has_error = true;
        self.job.emit(DbJobEvent::Error(message));
    }

    fn is_canceled(&self) -> bool {
        self.job.is_canceled()
    }
}

/// Forwards engine progress to the job it was created for.
pub struct DuplicatesProgressObserver<'a> {
    job: &'a DbJob,
}

impl<'a> DuplicatesProgressObserver<'a> {
    pub fn new(job: &'a DbJob) -> Self {
        Self { job }
    }
}

impl HaarProgressObserver for DuplicatesProgressObserver<'_> {
    fn total_number_to_scan(&self, count: usize) {
        self.job.emit(DbJobEvent::TotalSize(count));
    }

    fn processed_number(&self, count: usize) {
        self.job.emit(DbJobEvent::ProcessedSize(count));
    }

    fn is_canceled(&self) -> bool {
        self.job.is_canceled()
    }
}
