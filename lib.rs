//! Background database jobs and Haar-based duplicate detection for a photo
//! catalog.

pub mod action;
pub mod action_thread;
pub mod config;
pub mod coredb;
pub mod db;
pub mod dbjob;
pub mod dbjob_info;
pub mod dbjobs_manager;
pub mod dbjobs_thread;
pub mod error;
pub mod haar;
pub mod haariface;
pub mod models;
pub mod scan;
pub mod schema;

pub use crate::action::{ActionJob, CancelToken, JobId, WorkerPool};
pub use crate::config::JobsConfig;
pub use crate::db::CatalogDb;
pub use crate::dbjob::{DbJobEvent, DuplicatesProgressObserver, JobContext};
pub use crate::dbjob_info::{
    AlbumsJobInfo, DatesJobInfo, DbJobInfo, GpsJobInfo, SearchesJobInfo, TagsJobInfo,
};
pub use crate::dbjobs_manager::DbJobsManager;
pub use crate::dbjobs_thread::DbJobsThread;
pub use crate::error::{Error, Result};
pub use crate::haariface::{HaarIface, SimilarityEngine};
