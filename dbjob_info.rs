//! Parameters describing what a database job should do.

use crate::config::{default_max_threshold, DuplicatesConfig};
use crate::error::{Error, Result};
use crate::models::{
    AlbumId, AlbumTagRelation, DuplicatesSearchRestrictions, ImageId, TagId,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AlbumsJobInfo {
    /// Count images per album instead of listing them.
    pub folders: bool,
    pub list_available_images_only: bool,
    pub recursive: bool,
    pub album_root_id: i32,
    /// Album path relative to its root, e.g. `/2023/holidays`.
    pub album: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DatesJobInfo {
    pub folders: bool,
    pub list_available_images_only: bool,
    /// Inclusive.
    pub start_date: Option<NaiveDate>,
    /// Exclusive.
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsJobInfo {
    /// Query image ids in the box directly instead of streaming records.
    pub direct_query: bool,
    pub list_available_images_only: bool,
    pub lat1: f64,
    pub lng1: f64,
    pub lat2: f64,
    pub lng2: f64,
    pub limit: Option<usize>,
    pub sort_key: String,
}

impl Default for GpsJobInfo {
    fn default() -> Self {
        Self {
            direct_query: false,
            list_available_images_only: false,
            lat1: 0.0,
            lng1: 0.0,
            lat2: 0.0,
            lng2: 0.0,
            limit: None,
            sort_key: "rating".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TagsJobInfo {
    pub folders: bool,
    pub face_folders: bool,
    pub list_available_images_only: bool,
    pub recursive: bool,
    /// Tag property to list by instead of plain tag membership.
    pub special_tag: Option<String>,
    pub tag_ids: Vec<TagId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchesJobInfo {
    /// Rebuild duplicate groups instead of listing saved searches.
    pub duplicates: bool,
    /// Rebuild from `image_ids` instead of the album/tag scope.
    pub album_update: bool,
    pub list_available_images_only: bool,
    pub search_ids: Vec<i32>,
    pub album_ids: Vec<AlbumId>,
    pub tag_ids: Vec<TagId>,
    pub image_ids: Vec<ImageId>,
    min_threshold: f64,
    max_threshold: Option<f64>,
    pub album_tag_relation: AlbumTagRelation,
    pub search_result_restriction: DuplicatesSearchRestrictions,
}

impl Default for SearchesJobInfo {
    fn default() -> Self {
        Self {
            duplicates: false,
            album_update: false,
            list_available_images_only: false,
            search_ids: Vec::new(),
            album_ids: Vec::new(),
            tag_ids: Vec::new(),
            image_ids: Vec::new(),
            min_threshold: 0.0,
            max_threshold: None,
            album_tag_relation: AlbumTagRelation::default(),
            search_result_restriction: DuplicatesSearchRestrictions::default(),
        }
    }
}

impl SearchesJobInfo {
    pub fn listing(search_ids: Vec<i32>) -> Self {
        Self {
            search_ids,
            ..Self::default()
        }
    }

    pub fn duplicates_for_images(image_ids: Vec<ImageId>) -> Self {
        Self {
            duplicates: true,
            album_update: true,
            image_ids,
            ..Self::default()
        }
    }

    pub fn duplicates_for_scope(
        album_ids: Vec<AlbumId>,
        tag_ids: Vec<TagId>,
        album_tag_relation: AlbumTagRelation,
    ) -> Self {
        Self {
            duplicates: true,
            album_ids,
            tag_ids,
            album_tag_relation,
            ..Self::default()
        }
    }

    /// 0 is the "unset" sentinel.
    pub fn set_min_threshold(&mut self, value: f64) -> Result<()> {
        self.min_threshold = check_threshold(value)?;
        Ok(())
    }

    pub fn set_max_threshold(&mut self, value: f64) -> Result<()> {
        self.max_threshold = Some(check_threshold(value)?);
        Ok(())
    }

    /// Raw value as set by the caller, 0 when unset.
    pub fn min_threshold(&self) -> f64 {
        self.min_threshold
    }

    pub fn max_threshold(&self) -> f64 {
        self.max_threshold.unwrap_or_else(default_max_threshold)
    }

    /// Thresholds with the configured defaults substituted for unset values.
    pub fn effective_thresholds(&self, defaults: &DuplicatesConfig) -> (f64, f64) {
        let min = if self.min_threshold == 0.0 {
            defaults.min_threshold
        } else {
            self.min_threshold
        };
        (min, self.max_threshold.unwrap_or(defaults.max_threshold))
    }

    pub fn has_scope(&self) -> bool {
        !(self.album_ids.is_empty() && self.tag_ids.is_empty() && self.image_ids.is_empty())
    }
}

fn check_threshold(value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(Error::InvalidThreshold(value))
    }
}

/// The job category and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbJobInfo {
    Albums(AlbumsJobInfo),
    Dates(DatesJobInfo),
    Gps(GpsJobInfo),
    Tags(TagsJobInfo),
    Searches(SearchesJobInfo),
}

impl DbJobInfo {
    pub fn kind(&self) -> &'static str {
        match self {
            DbJobInfo::Albums(_) => "albums",
            DbJobInfo::Dates(_) => "dates",
            DbJobInfo::Gps(_) => "gps",
            DbJobInfo::Tags(_) => "tags",
            DbJobInfo::Searches(_) => "searches",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_min_threshold_defaults_to_point_four() {
        let unset = SearchesJobInfo::duplicates_for_images(vec![1]);
        let mut explicit = SearchesJobInfo::duplicates_for_images(vec![1]);
        explicit.set_min_threshold(0.4).unwrap();
        let defaults = DuplicatesConfig::default();
        assert_eq!(unset.min_threshold(), 0.0);
        assert_eq!(unset.effective_thresholds(&defaults), (0.4, 1.0));
        assert_eq!(unset.effective_thresholds(&defaults), explicit.effective_thresholds(&defaults));
    }

    #[test]
    fn configured_defaults_fill_only_unset_thresholds() {
        let defaults = DuplicatesConfig {
            min_threshold: 0.8,
            max_threshold: 0.95,
            ..DuplicatesConfig::default()
        };
        let mut info = SearchesJobInfo::duplicates_for_images(vec![1]);
        assert_eq!(info.effective_thresholds(&defaults), (0.8, 0.95));
        info.set_min_threshold(0.5).unwrap();
        info.set_max_threshold(1.0).unwrap();
        assert_eq!(info.effective_thresholds(&defaults), (0.5, 1.0));
    }

    #[test]
    fn thresholds_outside_unit_range_are_rejected() {
        let mut info = SearchesJobInfo::default();
        assert!(matches!(info.set_min_threshold(-0.1), Err(Error::InvalidThreshold(_))));
        assert!(matches!(info.set_max_threshold(1.01), Err(Error::InvalidThreshold(_))));
        assert_eq!(info.max_threshold(), 1.0);
    }

    #[test]
    fn scope_requires_any_id() {
        assert!(!SearchesJobInfo::default().has_scope());
        assert!(SearchesJobInfo::duplicates_for_scope(vec![], vec![3], AlbumTagRelation::NoMix)
            .has_scope());
    }
}
