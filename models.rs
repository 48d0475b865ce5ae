use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ImageId = i64;
pub type AlbumId = i32;
pub type TagId = i32;

/// Tag property names counted for the face folders view.
pub const AUTODETECTED_FACE_PROPERTY: &str = "autodetectedFace";
pub const TAG_REGION_PROPERTY: &str = "tagRegion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImageCategory {
    #[default]
    Undefined,
    Image,
    Video,
    Audio,
    Other,
}

impl ImageCategory {
    pub fn from_db(value: i64) -> Self {
        match value {
            1 => ImageCategory::Image,
            2 => ImageCategory::Video,
            3 => ImageCategory::Audio,
            4 => ImageCategory::Other,
            _ => ImageCategory::Undefined,
        }
    }

    pub fn to_db(self) -> i64 {
        match self {
            ImageCategory::Undefined => 0,
            ImageCategory::Image => 1,
            ImageCategory::Video => 2,
            ImageCategory::Audio => 3,
            ImageCategory::Other => 4,
        }
    }
}

/// One row produced by the image lister.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageListerRecord {
    pub image_id: ImageId,
    pub name: String,
    pub album_id: AlbumId,
    pub album_root_id: i32,
    pub rating: i32,
    pub category: ImageCategory,
    pub format: Option<String>,
    pub creation_date: Option<NaiveDateTime>,
    pub modification_date: Option<NaiveDateTime>,
    pub file_size: i64,
    pub width: i32,
    pub height: i32,
    /// Similarity to the reference image, only set by Haar searches.
    pub current_similarity: Option<f64>,
    /// Extra per-listing values, e.g. latitude/longitude for area listings.
    pub extra_values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchType {
    Keyword,
    Advanced,
    Haar,
    Duplicates,
}

impl SearchType {
    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            1 => Some(SearchType::Keyword),
            2 => Some(SearchType::Advanced),
            3 => Some(SearchType::Haar),
            4 => Some(SearchType::Duplicates),
            _ => None,
        }
    }

    pub fn to_db(self) -> i64 {
        match self {
            SearchType::Keyword => 1,
            SearchType::Advanced => 2,
            SearchType::Haar => 3,
            SearchType::Duplicates => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchInfo {
    pub id: i32,
    pub kind: SearchType,
    pub name: String,
    pub query: String,
}

/// How album and tag scopes combine into the set of images to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AlbumTagRelation {
    /// Albums when any are given, tags otherwise.
    #[default]
    NoMix,
    Union,
    Intersection,
    AlbumExclusive,
    TagExclusive,
}

/// Which candidates may join a reference image's duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DuplicatesSearchRestrictions {
    #[default]
    None,
    SameAlbum,
    DifferentAlbum,
}

/// Weight table used when comparing Haar signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SketchType {
    #[default]
    Scanned,
    Handdrawn,
}

/// A reference image and the images found similar to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub reference: ImageId,
    pub similarities: BTreeMap<ImageId, f64>,
}

impl DuplicateGroup {
    pub fn image_ids(&self) -> Vec<ImageId> {
        let mut ids = vec![self.reference];
        ids.extend(self.similarities.keys().copied());
        ids
    }
}

/// Stored as the `query` column of a duplicates search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DuplicatesQuery {
    pub image_ids: Vec<ImageId>,
    pub similarities: BTreeMap<ImageId, f64>,
}

/// Filter understood by `ImageLister::list_search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilter {
    pub album_ids: Vec<AlbumId>,
    pub tag_ids: Vec<TagId>,
    pub image_ids: Vec<ImageId>,
    pub min_rating: Option<i32>,
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaarQueryType {
    ImageId,
    Image,
}

/// Query of a Haar (similarity) search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HaarSearchQuery {
    #[serde(rename = "type")]
    pub query_type: HaarQueryType,
    #[serde(default)]
    pub image_id: Option<ImageId>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub max_threshold: Option<f64>,
    #[serde(default)]
    pub target_albums: Vec<AlbumId>,
    #[serde(default)]
    pub sketch_type: SketchType,
}
