//! Duplicate detection on top of Haar signatures.

use crate::error::Result;
use crate::haar::Signature;
use crate::models::{
    AlbumId, AlbumTagRelation, DuplicateGroup, DuplicatesSearchRestrictions, ImageId, SketchType,
    TagId,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Progress sink handed to long-running engine calls.
pub trait HaarProgressObserver {
    fn total_number_to_scan(&self, count: usize);

    fn processed_number(&self, count: usize);

    fn is_canceled(&self) -> bool;
}

/// The engine boundary used by duplicate search jobs.
pub trait SimilarityEngine: Send + Sync {
    /// Rescans `image_ids` against the whole corpus.
    fn rebuild_duplicates_albums_for_images(
        &self,
        image_ids: &[ImageId],
        min_threshold: f64,
        max_threshold: f64,
        restriction: DuplicatesSearchRestrictions,
        observer: &dyn HaarProgressObserver,
    ) -> Result<()>;

    /// Rescans the images of the album/tag scope against each other.
    #[allow(clippy::too_many_arguments)]
    fn rebuild_duplicates_albums(
        &self,
        album_ids: &[AlbumId],
        tag_ids: &[TagId],
        relation: AlbumTagRelation,
        min_threshold: f64,
        max_threshold: f64,
        restriction: DuplicatesSearchRestrictions,
        observer: &dyn HaarProgressObserver,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureEntry {
    pub image_id: ImageId,
    pub album_id: AlbumId,
    pub signature: Signature,
}

/// Storage the engine reads signatures from and writes groups to.
pub trait SignatureStore: Send + Sync {
    /// Every available image that has a signature, in ascending id order.
    fn signatures(&self) -> Result<Vec<SignatureEntry>>;

    fn signature(&self, image_id: ImageId) -> Result<Option<Signature>>;

    fn store_signature(&self, image_id: ImageId, signature: &Signature) -> Result<()>;

    fn images_in_albums(&self, album_ids: &[AlbumId]) -> Result<BTreeSet<ImageId>>;

    fn images_in_tags(&self, tag_ids: &[TagId]) -> Result<BTreeSet<ImageId>>;

    /// Drops the groups referenced by any of `roots`, then stores `groups`.
    fn replace_duplicate_groups(&self, roots: &[ImageId], groups: &[DuplicateGroup]) -> Result<()>;
}

pub struct HaarIface {
    store: Arc<dyn SignatureStore>,
    sketch: SketchType,
}

impl HaarIface {
    pub fn new(store: Arc<dyn SignatureStore>, sketch: SketchType) -> Self {
        Self { store, sketch }
    }

    pub fn index_image(&self, image_id: ImageId, path: &Path) -> Result<Signature> {
        let signature = Signature::from_path(path)?;
        self.store.store_signature(image_id, &signature)?;
        Ok(signature)
    }

    /// Images whose similarity to `image_id` lies in `[threshold, max_threshold]`,
    /// most similar first. An empty `target_albums` searches everything.
    pub fn best_matches_for_image_with_threshold(
        &self,
        image_id: ImageId,
        threshold: f64,
        max_threshold: f64,
        target_albums: &[AlbumId],
    ) -> Result<Vec<(ImageId, f64)>> {
        match self.store.signature(image_id)? {
            Some(signature) => self.best_matches_for_signature(
                &signature,
                Some(image_id),
                threshold,
                max_threshold,
                target_albums,
            ),
            None => {
                log::debug!("No signature stored for image {image_id}");
                Ok(Vec::new())
            }
        }
    }

    pub fn best_matches_for_signature(
        &self,
        signature: &Signature,
        exclude: Option<ImageId>,
        threshold: f64,
        max_threshold: f64,
        target_albums: &[AlbumId],
    ) -> Result<Vec<(ImageId, f64)>> {
        let mut matches: Vec<(ImageId, f64)> = self
            .store
            .signatures()?
            .into_iter()
            .filter(|entry| Some(entry.image_id) != exclude)
            .filter(|entry| target_albums.is_empty() || target_albums.contains(&entry.album_id))
            .map(|entry| (entry.image_id, signature.similarity(&entry.signature, self.sketch)))
            .filter(|(_, similarity)| (threshold..=max_threshold).contains(similarity))
            .collect();
        matches.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(matches)
    }

    fn rebuild(
        &self,
        roots: &[ImageId],
        candidates: &[SignatureEntry],
        min_threshold: f64,
        max_threshold: f64,
        restriction: DuplicatesSearchRestrictions,
        observer: &dyn HaarProgressObserver,
    ) -> Result<()> {
        let by_id: BTreeMap<ImageId, &SignatureEntry> =
            candidates.iter().map(|entry| (entry.image_id, entry)).collect();

        observer.total_number_to_scan(roots.len());

        let mut grouped: HashSet<ImageId> = HashSet::new();
        let mut groups = Vec::new();
        let mut visited = 0;
        for root in roots {
            if observer.is_canceled() {
                log::info!("Duplicate scan canceled after {visited} of {} images", roots.len());
                break;
            }
            if !grouped.contains(root) {
                if let Some(reference) = by_id.get(root) {
                    let group = self.group_for(
                        reference,
                        candidates,
                        min_threshold,
                        max_threshold,
                        restriction,
                    );
                    if let Some(group) = group {
                        grouped.insert(group.reference);
                        grouped.extend(group.similarities.keys().copied());
                        groups.push(group);
                    }
                }
            }
            visited += 1;
            observer.processed_number(visited);
        }

        log::debug!("Found {} duplicate groups among {visited} images", groups.len());
        self.store.replace_duplicate_groups(&roots[..visited], &groups)
    }

    fn group_for(
        &self,
        reference: &SignatureEntry,
        candidates: &[SignatureEntry],
        min_threshold: f64,
        max_threshold: f64,
        restriction: DuplicatesSearchRestrictions,
    ) -> Option<DuplicateGroup> {
        let similarities: BTreeMap<ImageId, f64> = candidates
            .iter()
            .filter(|entry| entry.image_id != reference.image_id)
            .filter(|entry| match restriction {
                DuplicatesSearchRestrictions::None => true,
                DuplicatesSearchRestrictions::SameAlbum => entry.album_id == reference.album_id,
                DuplicatesSearchRestrictions::DifferentAlbum => entry.album_id != reference.album_id,
            })
            .filter_map(|entry| {
                let similarity = reference.signature.similarity(&entry.signature, self.sketch);
                (min_threshold..=max_threshold)
                    .contains(&similarity)
                    .then_some((entry.image_id, similarity))
            })
            .collect();

        (!similarities.is_empty()).then(|| DuplicateGroup {
            reference: reference.image_id,
            similarities,
        })
    }
}

impl SimilarityEngine for HaarIface {
    fn rebuild_duplicates_albums_for_images(
        &self,
        image_ids: &[ImageId],
        min_threshold: f64,
        max_threshold: f64,
        restriction: DuplicatesSearchRestrictions,
        observer: &dyn HaarProgressObserver,
    ) -> Result<()> {
        let roots: Vec<ImageId> = image_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let corpus = self.store.signatures()?;
        self.rebuild(&roots, &corpus, min_threshold, max_threshold, restriction, observer)
    }

    fn rebuild_duplicates_albums(
        &self,
        album_ids: &[AlbumId],
        tag_ids: &[TagId],
        relation: AlbumTagRelation,
        min_threshold: f64,
        max_threshold: f64,
        restriction: DuplicatesSearchRestrictions,
        observer: &dyn HaarProgressObserver,
    ) -> Result<()> {
        let in_albums = self.store.images_in_albums(album_ids)?;
        let in_tags = self.store.images_in_tags(tag_ids)?;
        let scope = combine_scope(relation, !album_ids.is_empty(), in_albums, in_tags);

        let candidates: Vec<SignatureEntry> = self
            .store
            .signatures()?
            .into_iter()
            .filter(|entry| scope.contains(&entry.image_id))
            .collect();
        let roots: Vec<ImageId> = candidates.iter().map(|entry| entry.image_id).collect();
        self.rebuild(&roots, &candidates, min_threshold, max_threshold, restriction, observer)
    }
}

fn combine_scope(
    relation: AlbumTagRelation,
    has_albums: bool,
    in_albums: BTreeSet<ImageId>,
    in_tags: BTreeSet<ImageId>,
) -> BTreeSet<ImageId> {
    match relation {
        AlbumTagRelation::NoMix if has_albums => in_albums,
        AlbumTagRelation::NoMix => in_tags,
        AlbumTagRelation::Union => &in_albums | &in_tags,
        AlbumTagRelation::Intersection => &in_albums & &in_tags,
        AlbumTagRelation::AlbumExclusive => &in_albums - &in_tags,
        AlbumTagRelation::TagExclusive => &in_tags - &in_albums,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::haar::NUM_COEFS;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Signature whose coefficients start at `offset`; equal offsets are
    /// identical, offsets 40 apart share nothing.
    pub(crate) fn synthetic(offset: i32) -> Signature {
        let mut channel = [0i32; NUM_COEFS];
        for (i, coef) in channel.iter_mut().enumerate() {
            *coef = offset + i as i32 + 1;
        }
        Signature {
            avg: [0.5, 0.0, 0.0],
            sig: [channel; 3],
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) entries: Mutex<Vec<SignatureEntry>>,
        pub(crate) tags: HashMap<TagId, Vec<ImageId>>,
        pub(crate) groups: Mutex<BTreeMap<ImageId, DuplicateGroup>>,
    }

    impl MemoryStore {
        pub(crate) fn with(entries: &[(ImageId, AlbumId, i32)]) -> Self {
            let entries = entries
                .iter()
                .map(|&(image_id, album_id, offset)| SignatureEntry {
                    image_id,
                    album_id,
                    signature: synthetic(offset),
                })
                .collect();
            Self {
                entries: Mutex::new(entries),
                ..Self::default()
            }
        }
    }

    impl SignatureStore for MemoryStore {
        fn signatures(&self) -> Result<Vec<SignatureEntry>> {
            let mut entries = self.entries.lock().clone();
            entries.sort_by_key(|entry| entry.image_id);
            Ok(entries)
        }

        fn signature(&self, image_id: ImageId) -> Result<Option<Signature>> {
            Ok(self
                .entries
                .lock()
                .iter()
                .find(|entry| entry.image_id == image_id)
                .map(|entry| entry.signature.clone()))
        }

        fn store_signature(&self, image_id: ImageId, signature: &Signature) -> Result<()> {
            self.entries.lock().push(SignatureEntry {
                image_id,
                album_id: 0,
                signature: signature.clone(),
            });
            Ok(())
        }

        fn images_in_albums(&self, album_ids: &[AlbumId]) -> Result<BTreeSet<ImageId>> {
            Ok(self
                .entries
                .lock()
                .iter()
                .filter(|entry| album_ids.contains(&entry.album_id))
                .map(|entry| entry.image_id)
                .collect())
        }

        fn images_in_tags(&self, tag_ids: &[TagId]) -> Result<BTreeSet<ImageId>> {
            Ok(tag_ids
                .iter()
                .filter_map(|tag| self.tags.get(tag))
                .flatten()
                .copied()
                .collect())
        }

        fn replace_duplicate_groups(&self, roots: &[ImageId], groups: &[DuplicateGroup]) -> Result<()> {
            let mut stored = self.groups.lock();
            stored.retain(|reference, _| !roots.contains(reference));
            for group in groups {
                stored.insert(group.reference, group.clone());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        total: Mutex<Vec<usize>>,
        processed: Mutex<Vec<usize>>,
        cancel_after_first: bool,
        canceled: AtomicBool,
    }

    impl HaarProgressObserver for Recorder {
        fn total_number_to_scan(&self, count: usize) {
            self.total.lock().push(count);
        }

        fn processed_number(&self, count: usize) {
            self.processed.lock().push(count);
            if self.cancel_after_first {
                self.canceled.store(true, Ordering::SeqCst);
            }
        }

        fn is_canceled(&self) -> bool {
            self.canceled.load(Ordering::SeqCst)
        }
    }

    fn engine(store: &Arc<MemoryStore>) -> HaarIface {
        HaarIface::new(store.clone(), SketchType::Scanned)
    }

    #[test]
    fn rebuild_for_images_groups_against_whole_corpus() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 0), (3, 1, 500), (4, 2, 0)]));
        let recorder = Recorder::default();
        engine(&store)
            .rebuild_duplicates_albums_for_images(&[1], 0.4, 1.0, DuplicatesSearchRestrictions::None, &recorder)
            .unwrap();

        let groups = store.groups.lock();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&1].image_ids(), vec![1, 2, 4]);
        assert!((groups[&1].similarities[&2] - 1.0).abs() < 1e-9);
        assert_eq!(*recorder.total.lock(), vec![1]);
        assert_eq!(*recorder.processed.lock(), vec![1]);
    }

    #[test]
    fn same_album_restriction_excludes_cross_album_pairs() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 0), (4, 2, 0)]));
        engine(&store)
            .rebuild_duplicates_albums_for_images(
                &[1],
                0.4,
                1.0,
                DuplicatesSearchRestrictions::SameAlbum,
                &Recorder::default(),
            )
            .unwrap();
        assert_eq!(store.groups.lock()[&1].image_ids(), vec![1, 2]);
    }

    #[test]
    fn groups_rooted_outside_the_rebuild_are_untouched() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 0), (7, 1, 300), (8, 1, 300)]));
        let outside = DuplicateGroup {
            reference: 7,
            similarities: BTreeMap::from([(8, 1.0)]),
        };
        store.groups.lock().insert(7, outside.clone());

        engine(&store)
            .rebuild_duplicates_albums_for_images(&[1], 0.4, 1.0, DuplicatesSearchRestrictions::None, &Recorder::default())
            .unwrap();

        let groups = store.groups.lock();
        assert_eq!(groups[&7], outside);
        assert!(groups.contains_key(&1));
    }

    #[test]
    fn members_of_an_earlier_group_do_not_start_their_own() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 0), (3, 1, 0)]));
        let recorder = Recorder::default();
        engine(&store)
            .rebuild_duplicates_albums_for_images(&[3, 1, 2], 0.4, 1.0, DuplicatesSearchRestrictions::None, &recorder)
            .unwrap();
        let groups = store.groups.lock();
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(*recorder.processed.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn band_excludes_dissimilar_images() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 500)]));
        engine(&store)
            .rebuild_duplicates_albums_for_images(&[1, 2], 0.4, 1.0, DuplicatesSearchRestrictions::None, &Recorder::default())
            .unwrap();
        assert!(store.groups.lock().is_empty());
    }

    #[test]
    fn cancel_stops_the_scan_between_images() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 100), (3, 1, 200)]));
        let recorder = Recorder {
            cancel_after_first: true,
            ..Recorder::default()
        };
        engine(&store)
            .rebuild_duplicates_albums_for_images(&[1, 2, 3], 0.4, 1.0, DuplicatesSearchRestrictions::None, &recorder)
            .unwrap();
        assert_eq!(*recorder.total.lock(), vec![3]);
        assert_eq!(*recorder.processed.lock(), vec![1]);
    }

    #[test]
    fn album_scope_only_compares_images_inside_it() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 0), (3, 2, 0)]));
        let recorder = Recorder::default();
        engine(&store)
            .rebuild_duplicates_albums(
                &[1],
                &[],
                AlbumTagRelation::NoMix,
                0.4,
                1.0,
                DuplicatesSearchRestrictions::None,
                &recorder,
            )
            .unwrap();
        assert_eq!(store.groups.lock()[&1].image_ids(), vec![1, 2]);
        assert_eq!(*recorder.total.lock(), vec![2]);
    }

    #[test]
    fn scope_relations_combine_album_and_tag_sets() {
        let albums = BTreeSet::from([1, 2, 3]);
        let tags = BTreeSet::from([3, 4]);
        let run = |relation, has_albums| combine_scope(relation, has_albums, albums.clone(), tags.clone());
        assert_eq!(run(AlbumTagRelation::NoMix, true), BTreeSet::from([1, 2, 3]));
        assert_eq!(run(AlbumTagRelation::NoMix, false), BTreeSet::from([3, 4]));
        assert_eq!(run(AlbumTagRelation::Union, true), BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(run(AlbumTagRelation::Intersection, true), BTreeSet::from([3]));
        assert_eq!(run(AlbumTagRelation::AlbumExclusive, true), BTreeSet::from([1, 2]));
        assert_eq!(run(AlbumTagRelation::TagExclusive, true), BTreeSet::from([4]));
    }

    #[test]
    fn best_matches_sort_by_similarity_and_skip_the_query() {
        let store = Arc::new(MemoryStore::with(&[(1, 1, 0), (2, 1, 0), (3, 2, 20), (4, 1, 500)]));
        let matches = engine(&store)
            .best_matches_for_image_with_threshold(1, 0.1, 1.0, &[])
            .unwrap();
        let ids: Vec<ImageId> = matches.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(matches[0].1 > matches[1].1);

        let only_album_two = engine(&store)
            .best_matches_for_image_with_threshold(1, 0.1, 1.0, &[2])
            .unwrap();
        assert_eq!(only_album_two.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![3]);
    }
}
