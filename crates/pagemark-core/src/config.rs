//! Runtime configuration.

use crate::error::{AnnotationError, AnnotationResult};
use crate::sync::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default number of cached annotations per document.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 500;
/// Default cache entry lifetime (5 minutes).
pub const DEFAULT_MAX_AGE_MS: u64 = 300_000;
/// Default periodic sync interval in seconds.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
/// Default key prefix for persisted documents.
pub const DEFAULT_KEY_PREFIX: &str = "annotations/";

/// Annotation cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub max_cache_size: usize,
    pub max_age_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }
}

/// Sync manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub strategy: ConflictStrategy,
    pub key_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            strategy: ConflictStrategy::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Top-level configuration shared by the store and the sync manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnnotatorConfig {
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    /// Identifies this device in document metadata.
    pub device_id: String,
    pub user_id: Option<String>,
    /// Directory for the file provider. `None` uses the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            device_id: Uuid::new_v4().to_string(),
            user_id: None,
            data_dir: None,
        }
    }
}

impl AnnotatorConfig {
    pub fn from_json(json: &str) -> AnnotationResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> AnnotationResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(AnnotationError::Parse(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Storage key for a document.
    pub fn document_key(&self, document_id: &str) -> String {
        format!("{}{}", self.sync.key_prefix, document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnnotatorConfig::default();
        assert_eq!(config.cache.max_cache_size, 500);
        assert_eq!(config.cache.max_age_ms, 300_000);
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.sync.strategy, ConflictStrategy::Latest);
        assert_eq!(config.document_key("abc"), "annotations/abc");
        assert!(Uuid::parse_str(&config.device_id).is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = AnnotatorConfig::from_json(
            r#"{"cache": {"maxCacheSize": 10}, "sync": {"strategy": "merge"}, "deviceId": "tablet"}"#,
        )
        .unwrap();
        assert_eq!(config.cache.max_cache_size, 10);
        assert_eq!(config.cache.max_age_ms, DEFAULT_MAX_AGE_MS);
        assert_eq!(config.sync.strategy, ConflictStrategy::Merge);
        assert_eq!(config.sync.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.device_id, "tablet");
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            AnnotatorConfig::from_json("{"),
            Err(AnnotationError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnnotatorConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.sync.key_prefix, DEFAULT_KEY_PREFIX);
    }
}
