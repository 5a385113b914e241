use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::collaborators::AUTO_DETECT_THRESHOLD;
use crate::error::StorageError;
use crate::storage::{FileStorage, LmdbStorage, Storage};

/// Which storage medium backs the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    File,
    Lmdb,
}

/// Options for opening a store. Only `path` is required; every other field
/// falls back to its default when omitted from the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_lmdb_map_size")]
    pub lmdb_map_size: usize,
    #[serde(default = "default_auto_detect_threshold")]
    pub auto_detect_threshold: f64,
}

fn default_backup_retention() -> usize {
    10
}

fn default_page_size() -> usize {
    20
}

fn default_max_page_size() -> usize {
    100
}

fn default_lmdb_map_size() -> usize {
    64 * 1024 * 1024
}

fn default_auto_detect_threshold() -> f64 {
    AUTO_DETECT_THRESHOLD
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            path: path.into(),
            backend: Backend::default(),
            backup_retention: default_backup_retention(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            lmdb_map_size: default_lmdb_map_size(),
            auto_detect_threshold: default_auto_detect_threshold(),
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Opens the configured storage medium under `path`.
    pub fn open_storage(&self) -> Result<Box<dyn Storage>, StorageError> {
        Ok(match self.backend {
            Backend::File => Box::new(FileStorage::open(&self.path)?),
            Backend::Lmdb => Box::new(LmdbStorage::open(&self.path, self.lmdb_map_size)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_fields_take_defaults() {
        let config = StoreConfig::from_json(r#"{"path":"/tmp/store"}"#).unwrap();
        assert_eq!(config, StoreConfig::new("/tmp/store"));
        assert_eq!(config.backup_retention, 10);
        assert_eq!(config.backend, Backend::File);
    }

    #[test]
    fn backend_and_limits_are_read_from_camel_case() {
        let config = StoreConfig::from_json(
            r#"{"path":"db","backend":"lmdb","backupRetention":3,"maxPageSize":50}"#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Lmdb);
        assert_eq!(config.backup_retention, 3);
        assert_eq!(config.max_page_size, 50);
        assert_eq!(config.default_page_size, 20);
    }

    #[test]
    fn path_is_required() {
        assert!(StoreConfig::from_json(r#"{"backend":"file"}"#).is_err());
    }
}
