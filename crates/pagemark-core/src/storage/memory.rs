//! In-memory provider implementation.

use super::{BoxFuture, Provider, ProviderError, ProviderResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// In-memory provider for testing and ephemeral use.
///
/// Values are held as serialized JSON text so an optional byte quota can be
/// enforced the way browser storage does.
pub struct MemoryProvider {
    name: String,
    entries: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    offline: AtomicBool,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Create a new empty provider with no quota.
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
            quota_bytes: None,
            offline: AtomicBool::new(false),
        }
    }

    /// Limit the total stored bytes (keys plus serialized values).
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Simulate an unreachable backend: every operation fails while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Bytes currently stored.
    pub fn used_bytes(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Store raw text under a key, bypassing serialization.
    pub fn insert_raw(&self, key: &str, text: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), text.to_string());
    }

    fn check_online(&self) -> ProviderResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ProviderError::Io(format!("provider '{}' is offline", self.name)))
        } else {
            Ok(())
        }
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn save(&self, key: &str, value: &Value) -> BoxFuture<'_, ProviderResult<()>> {
        let key = key.to_string();
        let text = serde_json::to_string(value);
        Box::pin(async move {
            self.check_online()?;
            let text = text.map_err(|e| ProviderError::Serialization(e.to_string()))?;
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(quota) = self.quota_bytes {
                let current: usize = entries
                    .iter()
                    .filter(|(k, _)| **k != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                if current + key.len() + text.len() > quota {
                    return Err(ProviderError::QuotaExceeded { key });
                }
            }
            entries.insert(key, text);
            Ok(())
        })
    }

    fn load(&self, key: &str) -> BoxFuture<'_, ProviderResult<Option<Value>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_online()?;
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .get(&key)
                .map(|text| {
                    serde_json::from_str(text).map_err(|e| {
                        ProviderError::Serialization(format!("Failed to parse {}: {}", key, e))
                    })
                })
                .transpose()
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_online()?;
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.remove(&key);
            Ok(())
        })
    }

    fn list(&self, prefix: Option<&str>) -> BoxFuture<'_, ProviderResult<Vec<String>>> {
        let prefix = prefix.unwrap_or_default().to_string();
        Box::pin(async move {
            self.check_online()?;
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            Ok(entries
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect())
        })
    }
}
