use crate::db::{CatalogDb, NewImage};
use crate::error::{Error, Result};
use crate::haariface::HaarIface;
use crate::models::{AlbumId, ImageCategory, ImageId};
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_128;

const SUPPORTED_EXT: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub discovered: usize,
    pub processed: usize,
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub discovered: usize,
    pub imported: usize,
    pub unchanged: usize,
    pub fingerprinted: usize,
    pub failed: usize,
}

enum Outcome {
    Unchanged,
    Imported { fingerprinted: bool },
}

/// Imports every supported image below `root`, one album per directory, and
/// stores a Haar signature for each decodable file. Files whose size and
/// modification time match the catalog are skipped.
pub fn scan_collection<F>(
    db: &CatalogDb,
    haar: &HaarIface,
    root: &Path,
    mut on_progress: F,
) -> Result<ScanSummary>
where
    F: FnMut(&ScanProgress),
{
    let root = root.canonicalize()?;
    let root_str = root.to_string_lossy().to_string();
    let label = root
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(&root_str)
        .to_string();
    let root_id = db.add_album_root(&root_str, &label)?;

    let discovered: Vec<PathBuf> = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_EXT.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();

    let total = discovered.len();
    log::info!("Scanning {total} files below {root_str}");
    let mut summary = ScanSummary {
        discovered: total,
        ..ScanSummary::default()
    };
    let mut albums: HashMap<PathBuf, AlbumId> = HashMap::new();
    for (idx, path) in discovered.iter().enumerate() {
        on_progress(&progress(total, idx, path));

        let album_id = match path.parent() {
            Some(dir) => match albums.get(dir) {
                Some(id) => *id,
                None => {
                    let id = db.add_album(root_id, &album_path(&root, dir)?, None)?;
                    albums.insert(dir.to_path_buf(), id);
                    id
                }
            },
            None => return Err(Error::Path(format!("No parent directory for {}", path.display()))),
        };

        match process_file(db, haar, album_id, path) {
            Ok(Outcome::Unchanged) => summary.unchanged += 1,
            Ok(Outcome::Imported { fingerprinted }) => {
                summary.imported += 1;
                if fingerprinted {
                    summary.fingerprinted += 1;
                } else {
                    summary.failed += 1;
                }
            }
            Err(err) => {
                log::warn!("Failed to import {}: {}", path.display(), err);
                summary.failed += 1;
            }
        }
    }
    on_progress(&progress(total, total, &root));
    log::info!(
        "Scan finished: {} imported, {} unchanged, {} failed",
        summary.imported,
        summary.unchanged,
        summary.failed
    );
    Ok(summary)
}

fn progress(total: usize, processed: usize, path: &Path) -> ScanProgress {
    ScanProgress {
        discovered: total,
        processed,
        current_file: path.to_str().map(|s| s.to_string()),
    }
}

/// "/" for the root itself, "/a/b" for nested directories.
fn album_path(root: &Path, dir: &Path) -> Result<String> {
    let relative = dir
        .strip_prefix(root)
        .map_err(|_| Error::Path(format!("{} is outside {}", dir.display(), root.display())))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(format!("/{}", parts.join("/")))
}

fn compute_hash(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    let digest = xxh3_128(&data);
    Ok(format!("{:x}", digest))
}

fn process_file(db: &CatalogDb, haar: &HaarIface, album_id: AlbumId, path: &Path) -> Result<Outcome> {
    let metadata = fs::metadata(path)?;
    let mtime: Option<NaiveDateTime> = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
        .map(|d| d.naive_utc());
    let size = metadata.len() as i64;
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Path(format!("Unreadable file name {}", path.display())))?
        .to_string();

    if let Some(status) = db.image_status(album_id, &file_name)? {
        if status.modification_date == mtime && status.file_size == size && status.has_signature {
            return Ok(Outcome::Unchanged);
        }
    }

    let hash = compute_hash(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_uppercase();
    let format = match ext.as_str() {
        "JPEG" => "JPG".to_string(),
        _ => ext,
    };
    let (width, height) = image::image_dimensions(path).unwrap_or_else(|err| {
        log::warn!("Could not read dimensions of {}: {}", path.display(), err);
        (0, 0)
    });

    let image_id: ImageId = db.add_image(&NewImage {
        album_id,
        name: file_name,
        category: ImageCategory::Image,
        modification_date: mtime,
        file_size: size,
        unique_hash: hash,
        rating: None,
        creation_date: mtime,
        width: width as i32,
        height: height as i32,
        format: Some(format),
    })?;

    let fingerprinted = match catch_unwind(AssertUnwindSafe(|| haar.index_image(image_id, path))) {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            log::warn!("No signature for {}: {}", path.display(), err);
            false
        }
        Err(_) => {
            log::warn!("Decoder panicked on {}; skipping signature", path.display());
            false
        }
    };
    Ok(Outcome::Imported { fingerprinted })
}
