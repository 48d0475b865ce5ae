//! Storage boundary consumed by the database jobs.

use crate::error::Result;
use crate::models::{AlbumId, ImageId, ImageListerRecord, SearchInfo, TagId};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};

/// Aggregate queries over the catalog. Implementations must be safe for
/// concurrent reads from several worker threads.
pub trait CoreDb: Send + Sync {
    fn number_of_images_in_albums(&self) -> Result<HashMap<AlbumId, i32>>;

    fn number_of_images_in_tags(&self) -> Result<HashMap<TagId, i32>>;

    /// Images per tag carrying `property`, e.g. detected face regions.
    fn number_of_images_in_tag_properties(&self, property: &str) -> Result<HashMap<TagId, i32>>;

    fn all_creation_dates_and_number_of_images(&self) -> Result<BTreeMap<NaiveDate, i32>>;

    fn image_ids_from_area(
        &self,
        lat1: f64,
        lat2: f64,
        lng1: f64,
        lng2: f64,
        limit: Option<usize>,
        sort_key: &str,
    ) -> Result<Vec<ImageId>>;

    fn search_info(&self, id: i32) -> Result<Option<SearchInfo>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListerOptions {
    pub recursive: bool,
    pub list_only_available: bool,
    pub allow_extra_values: bool,
}

impl Default for ListerOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            list_only_available: true,
            allow_extra_values: false,
        }
    }
}

/// Gets every record a lister discovers, one at a time.
pub trait ListerReceiver {
    fn receive(&mut self, record: ImageListerRecord);

    fn error(&mut self, message: String);

    /// Listers stop early once this returns true.
    fn is_canceled(&self) -> bool {
        false
    }
}

/// Streaming queries. Each call feeds `receiver` and returns once the
/// listing is complete; failures are reported through `receiver.error`.
pub trait ImageLister: Send + Sync {
    fn list_album(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        album_root_id: i32,
        album: &str,
    );

    fn list_tag(&self, options: ListerOptions, receiver: &mut dyn ListerReceiver, tag_ids: &[TagId]);

    fn list_date_range(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    );

    fn list_area_range(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        lat1: f64,
        lat2: f64,
        lng1: f64,
        lng2: f64,
    );

    fn list_search(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        query: &str,
        limit: Option<usize>,
        reference_image_id: Option<ImageId>,
    );

    fn list_haar_search(&self, options: ListerOptions, receiver: &mut dyn ListerReceiver, query: &str);

    /// Lists images of `tag_id` carrying `property`; the property value is
    /// not part of the record, only its presence.
    fn list_image_tag_property_search(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        tag_id: TagId,
        property: &str,
    );
}
