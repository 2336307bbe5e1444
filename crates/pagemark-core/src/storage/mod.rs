//! Storage abstraction for persistence.
//!
//! A [`Provider`] is any key-value backend holding JSON documents. The store
//! writes through one primary provider; [`ProviderSet`] fans committed writes
//! out to secondary providers on a best-effort basis.

mod file;
mod memory;

pub use file::FileProvider;
pub use memory::MemoryProvider;

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Provider errors.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Storage quota exceeded writing {key}")]
    QuotaExceeded { key: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Boxed future for provider operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for annotation storage backends.
///
/// Implementations can store documents in memory, on the local filesystem,
/// or in any remote key-value service.
pub trait Provider: Send + Sync {
    /// Human-readable name used in logs and sync reports.
    fn name(&self) -> &str;

    /// Save a value under `key`, replacing any previous value.
    fn save(&self, key: &str, value: &Value) -> BoxFuture<'_, ProviderResult<()>>;

    /// Load the value stored under `key`, or `None` if absent.
    fn load(&self, key: &str) -> BoxFuture<'_, ProviderResult<Option<Value>>>;

    /// Delete `key`. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> BoxFuture<'_, ProviderResult<()>>;

    /// List keys, optionally restricted to those starting with `prefix`.
    fn list(&self, prefix: Option<&str>) -> BoxFuture<'_, ProviderResult<Vec<String>>>;

    /// Flush or pull pending remote state. Local backends have nothing to do.
    fn sync(&self) -> BoxFuture<'_, ProviderResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// The primary provider plus any secondaries that mirror it.
#[derive(Clone)]
pub struct ProviderSet {
    primary: Arc<dyn Provider>,
    secondaries: Vec<Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new(primary: Arc<dyn Provider>) -> Self {
        Self {
            primary,
            secondaries: Vec::new(),
        }
    }

    /// Add a secondary provider.
    pub fn with_secondary(mut self, provider: Arc<dyn Provider>) -> Self {
        self.secondaries.push(provider);
        self
    }

    pub fn primary(&self) -> &Arc<dyn Provider> {
        &self.primary
    }

    pub fn secondaries(&self) -> &[Arc<dyn Provider>] {
        &self.secondaries
    }

    /// Copy a committed value to every secondary provider.
    ///
    /// One task is spawned per secondary. Failures are logged by the task and
    /// never reach the caller; the returned handle only reports outcomes.
    pub fn replicate(&self, key: &str, value: &Value) -> Replication {
        self.fan_out(key, Some(value))
    }

    /// Delete a key from every secondary provider, best-effort.
    pub fn replicate_delete(&self, key: &str) -> Replication {
        self.fan_out(key, None)
    }

    fn fan_out(&self, key: &str, value: Option<&Value>) -> Replication {
        let tasks = self
            .secondaries
            .iter()
            .map(|provider| {
                let provider = Arc::clone(provider);
                let key = key.to_string();
                let value = value.cloned();
                let name = provider.name().to_string();
                let handle = tokio::spawn(async move {
                    let result = match &value {
                        Some(value) => provider.save(&key, value).await,
                        None => provider.delete(&key).await,
                    };
                    if let Err(e) = &result {
                        log::warn!("Replication of {} to '{}' failed: {}", key, provider.name(), e);
                    }
                    result
                });
                (name, handle)
            })
            .collect();
        Replication { tasks }
    }
}

/// Outcome of replicating one value to one secondary provider.
#[derive(Debug, Clone)]
pub struct ReplicationOutcome {
    pub provider: String,
    pub result: ProviderResult<()>,
}

/// Handle on in-flight replication tasks.
///
/// Dropping it leaves the tasks running.
#[derive(Debug, Default)]
pub struct Replication {
    tasks: Vec<(String, JoinHandle<ProviderResult<()>>)>,
}

impl Replication {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Merge another set of tasks into this one, dropping tasks that already finished.
    pub fn extend(&mut self, other: Replication) {
        self.tasks.retain(|(_, handle)| !handle.is_finished());
        self.tasks.extend(other.tasks);
    }

    /// Wait for every task and collect the outcomes.
    pub async fn join(self) -> Vec<ReplicationOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for (provider, handle) in self.tasks {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ProviderError::Other(format!("replication task failed: {}", e))),
            };
            outcomes.push(ReplicationOutcome { provider, result });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_replicate_reaches_every_secondary() {
        let primary = Arc::new(MemoryProvider::named("primary"));
        let mirror_a = Arc::new(MemoryProvider::named("a"));
        let mirror_b = Arc::new(MemoryProvider::named("b"));
        let set = ProviderSet::new(primary.clone())
            .with_secondary(mirror_a.clone())
            .with_secondary(mirror_b.clone());

        let outcomes = set.replicate("k", &json!({"v": 1})).join().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(mirror_a.load("k").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(mirror_b.load("k").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(primary.load("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replicate_isolates_failures() {
        let offline = Arc::new(MemoryProvider::named("offline"));
        offline.set_offline(true);
        let healthy = Arc::new(MemoryProvider::named("healthy"));
        let set = ProviderSet::new(Arc::new(MemoryProvider::new()))
            .with_secondary(offline)
            .with_secondary(healthy.clone());

        let outcomes = set.replicate("k", &json!(1)).join().await;
        let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].provider, "offline");
        assert_eq!(healthy.load("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_replicate_delete() {
        let mirror = Arc::new(MemoryProvider::named("mirror"));
        mirror.save("k", &json!(1)).await.unwrap();
        let set = ProviderSet::new(Arc::new(MemoryProvider::new())).with_secondary(mirror.clone());

        let outcomes = set.replicate_delete("k").join().await;
        assert!(outcomes[0].result.is_ok());
        assert_eq!(mirror.load("k").await.unwrap(), None);
    }
}
