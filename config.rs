use crate::error::{Error, Result};
use crate::models::SketchType;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Overrides `JobsConfig::max_threads` when set to a positive integer.
pub const MAX_THREADS_ENV: &str = "PHOTO_DBJOBS_MAX_THREADS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Worker threads in the shared pool. `None` uses the host core count.
    #[serde(default)]
    pub max_threads: Option<usize>,
    /// Records per `Data` event for fixed-size listings.
    #[serde(default = "default_listing_batch_size")]
    pub listing_batch_size: usize,
    #[serde(default)]
    pub growing_batch: GrowingBatchConfig,
    #[serde(default)]
    pub duplicates: DuplicatesConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            listing_batch_size: default_listing_batch_size(),
            growing_batch: GrowingBatchConfig::default(),
            duplicates: DuplicatesConfig::default(),
        }
    }
}

fn default_listing_batch_size() -> usize {
    200
}

/// Album listings start small and grow, so the first rows show up fast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrowingBatchConfig {
    pub start: usize,
    pub increment: usize,
    pub end: usize,
}

impl Default for GrowingBatchConfig {
    fn default() -> Self {
        Self {
            start: 200,
            increment: 100,
            end: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DuplicatesConfig {
    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,
    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,
    #[serde(default)]
    pub sketch_type: SketchType,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            sketch_type: SketchType::default(),
        }
    }
}

fn default_min_threshold() -> f64 {
    0.4
}

pub(crate) fn default_max_threshold() -> f64 {
    1.0
}

impl JobsConfig {
    /// Reads the config file when given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str::<JobsConfig>(&raw)?
            }
            None => JobsConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        match env::var(MAX_THREADS_ENV).ok().map(|v| v.trim().parse::<usize>()) {
            Some(Ok(n)) if n > 0 => self.max_threads = Some(n),
            Some(_) => log::warn!("Ignoring invalid {MAX_THREADS_ENV}; expected a positive integer."),
            None => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listing_batch_size == 0 {
            return Err(Error::Init("listing_batch_size must be at least 1".into()));
        }
        let growing = self.growing_batch;
        if growing.start == 0 || growing.end < growing.start {
            return Err(Error::Init(format!(
                "growing_batch must satisfy 0 < start <= end, got {}..{}",
                growing.start, growing.end
            )));
        }
        for value in [self.duplicates.min_threshold, self.duplicates.max_threshold] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidThreshold(value));
            }
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.max_threads.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPaths {
    pub root: PathBuf,
    pub db_path: PathBuf,
}

impl CatalogPaths {
    /// Uses `db_path` when given, otherwise `library.db` in the working directory.
    pub fn discover(db_path: Option<&Path>) -> Result<Self> {
        let db_path = match db_path {
            Some(path) => path.to_path_buf(),
            None => env::current_dir()?.join("library.db"),
        };
        let root = db_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Path(format!("No parent directory for {}", db_path.display())))?;
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, db_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: JobsConfig = serde_json::from_str(r#"{ "max_threads": 3 }"#).unwrap();
        assert_eq!(config.max_threads, Some(3));
        assert_eq!(config.listing_batch_size, 200);
        assert_eq!(config.growing_batch.end, 2000);
        assert_eq!(config.duplicates.min_threshold, 0.4);
        assert_eq!(config.duplicates.max_threshold, 1.0);
        assert_eq!(config.worker_threads(), 3);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = JobsConfig::default();
        config.duplicates.max_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::InvalidThreshold(v)) if v == 1.5));
    }

    #[test]
    fn default_worker_count_follows_cores() {
        assert_eq!(JobsConfig::default().worker_threads(), num_cpus::get().max(1));
    }
}
