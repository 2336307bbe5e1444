//! Multi-provider synchronization.
//!
//! A sync pass walks every secondary provider in turn and reconciles it with
//! the primary. Keys present on one side only are copied across. Keys present
//! on both sides are compared by session checksum; divergent copies become a
//! [`SyncConflict`] resolved by the configured [`ConflictStrategy`].
//!
//! The pass reads committed primary state without taking any document lock.
//! When it needs to write the primary it goes through
//! [`DocumentStore`]'s lock with a precondition, so a foreground mutation that
//! lands mid-pass always wins and the sync write is retried next pass.

use crate::annotation::now_millis;
use crate::document::AnnotationDocument;
use crate::error::{AnnotationError, AnnotationResult};
use crate::session::{AnnotationSession, merge_sessions};
use crate::storage::{Provider, ProviderError};
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How divergent copies are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the newer copy.
    #[default]
    Latest,
    /// Union annotations by id, local copy winning on collision.
    Merge,
    /// Record the conflict and write nothing.
    Manual,
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown conflict strategy '{}'", other)),
        }
    }
}

impl ConflictStrategy {
    /// The automatic resolution for a conflict, or `None` under `Manual`.
    ///
    /// `Latest` prefers the higher version for version conflicts and the later
    /// modification time for concurrent ones, keeping local on a tie.
    pub fn resolution(
        self,
        kind: ConflictKind,
        local: &AnnotationSession,
        remote: &AnnotationSession,
    ) -> Option<Resolution> {
        match self {
            Self::Manual => None,
            Self::Merge => Some(Resolution::Merge),
            Self::Latest => {
                let remote_newer = match kind {
                    ConflictKind::Version => remote.metadata.version > local.metadata.version,
                    ConflictKind::Concurrent => remote.metadata.modified > local.metadata.modified,
                };
                Some(if remote_newer {
                    Resolution::KeepRemote
                } else {
                    Resolution::KeepLocal
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// Different versions and different content.
    Version,
    /// Same version, different content: both sides edited independently.
    Concurrent,
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Merge,
}

/// Compare two sessions of the same document.
pub fn detect_conflict(local: &AnnotationSession, remote: &AnnotationSession) -> Option<ConflictKind> {
    if local.checksum == remote.checksum {
        None
    } else if local.metadata.version != remote.metadata.version {
        Some(ConflictKind::Version)
    } else {
        Some(ConflictKind::Concurrent)
    }
}

/// A divergence between the primary and one secondary provider.
#[derive(Debug, Clone)]
pub struct SyncConflict {
    pub document_id: String,
    pub key: String,
    pub provider: String,
    pub kind: ConflictKind,
    /// The primary's copy when the conflict was detected.
    pub local: AnnotationDocument,
    pub remote: AnnotationDocument,
    pub detected_at: u64,
}

impl SyncConflict {
    pub fn local_session(&self) -> AnnotationSession {
        AnnotationSession::from_document(&self.local)
    }

    pub fn remote_session(&self) -> AnnotationSession {
        AnnotationSession::from_document(&self.remote)
    }
}

/// Outcome of syncing one secondary provider.
#[derive(Debug, Default)]
pub struct ProviderSyncReport {
    pub provider: String,
    /// Documents copied from the secondary into the primary.
    pub pulled: usize,
    /// Documents copied from the primary into the secondary.
    pub pushed: usize,
    pub conflicts_found: usize,
    pub conflicts_resolved: usize,
    /// Primary writes skipped because a foreground mutation got there first.
    pub deferred: usize,
    pub error: Option<AnnotationError>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub providers: Vec<ProviderSyncReport>,
    pub started_at: u64,
    pub finished_at: u64,
}

impl SyncReport {
    pub fn failed(&self) -> impl Iterator<Item = &ProviderSyncReport> {
        self.providers.iter().filter(|p| p.error.is_some())
    }

    pub fn conflicts_found(&self) -> usize {
        self.providers.iter().map(|p| p.conflicts_found).sum()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSyncReport> {
        self.providers.iter().find(|p| p.provider == name)
    }
}

/// Reconciles the store's primary provider with its secondaries.
pub struct SyncManager {
    store: Arc<DocumentStore>,
    strategy: ConflictStrategy,
    pending: std::sync::Mutex<Vec<SyncConflict>>,
    pass: tokio::sync::Mutex<()>,
}

impl SyncManager {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        let strategy = store.config().sync.strategy;
        Self::with_strategy(store, strategy)
    }

    pub fn with_strategy(store: Arc<DocumentStore>, strategy: ConflictStrategy) -> Self {
        Self {
            store,
            strategy,
            pending: std::sync::Mutex::new(Vec::new()),
            pass: tokio::sync::Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Conflicts waiting for [`resolve_conflict`](Self::resolve_conflict).
    pub fn pending_conflicts(&self) -> Vec<SyncConflict> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one pass over every secondary provider.
    ///
    /// A failing provider is reported and skipped; it never stops the others.
    /// Overlapping calls are serialized.
    pub async fn sync_all(&self) -> SyncReport {
        let _pass = self.pass.lock().await;
        let mut report = SyncReport {
            started_at: now_millis(),
            ..SyncReport::default()
        };

        for provider in self.store.providers().secondaries() {
            let mut provider_report = ProviderSyncReport {
                provider: provider.name().to_string(),
                ..ProviderSyncReport::default()
            };
            if let Err(e) = self.sync_provider(provider.as_ref(), &mut provider_report).await {
                log::warn!("Sync with '{}' failed: {}", provider.name(), e);
                provider_report.error = Some(e);
            }
            report.providers.push(provider_report);
        }

        report.finished_at = now_millis();
        log::info!(
            "Sync pass finished: {} providers, {} conflicts, {} failed",
            report.providers.len(),
            report.conflicts_found(),
            report.failed().count()
        );
        report
    }

    async fn sync_provider(
        &self,
        remote: &dyn Provider,
        report: &mut ProviderSyncReport,
    ) -> AnnotationResult<()> {
        let prefix = self.store.config().sync.key_prefix.clone();
        remote.sync().await.map_err(|e| remote_error(remote, e))?;

        let local_keys = self.store.providers().primary().list(Some(prefix.as_str())).await?;
        let remote_keys = remote
            .list(Some(prefix.as_str()))
            .await
            .map_err(|e| remote_error(remote, e))?;
        let keys: BTreeSet<String> = local_keys.into_iter().chain(remote_keys).collect();

        for key in &keys {
            let Some(document_id) = self.store.document_id_for_key(key) else {
                continue;
            };
            match self.sync_key(remote, key, document_id, report).await {
                Ok(()) => {}
                Err(
                    e @ (AnnotationError::InvalidPage { .. } | AnnotationError::InvalidOperation(_)),
                ) => {
                    log::warn!("Skipping {} on '{}': {}", key, remote.name(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn sync_key(
        &self,
        remote: &dyn Provider,
        key: &str,
        document_id: &str,
        report: &mut ProviderSyncReport,
    ) -> AnnotationResult<()> {
        let local = self.store.load(document_id).await?;
        let remote_doc = load_remote(remote, key, document_id).await?;

        match (local, remote_doc) {
            (None, None) => {}
            (Some(local), None) => {
                save_remote(remote, key, &local).await?;
                report.pushed += 1;
            }
            (None, Some(remote_doc)) => {
                if self.store.commit_if_unchanged(&remote_doc, None).await? {
                    report.pulled += 1;
                } else {
                    report.deferred += 1;
                }
            }
            (Some(local), Some(remote_doc)) if local.total_pages() != remote_doc.total_pages() => {
                // Page counts are fixed at creation; the primary's layout wins.
                log::warn!(
                    "Replacing {} on '{}': {} pages, primary has {}",
                    key,
                    remote.name(),
                    remote_doc.total_pages(),
                    local.total_pages()
                );
                save_remote(remote, key, &local).await?;
                report.pushed += 1;
            }
            (Some(local), Some(remote_doc)) => {
                self.reconcile(remote, key, local, remote_doc, report).await?;
            }
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        remote: &dyn Provider,
        key: &str,
        local: AnnotationDocument,
        remote_doc: AnnotationDocument,
        report: &mut ProviderSyncReport,
    ) -> AnnotationResult<()> {
        let local_session = AnnotationSession::from_document(&local);
        let remote_session = AnnotationSession::from_document(&remote_doc);

        let Some(kind) = detect_conflict(&local_session, &remote_session) else {
            // Same annotations; carry metadata-only changes forward.
            if local.version > remote_doc.version {
                save_remote(remote, key, &local).await?;
                report.pushed += 1;
            } else if remote_doc.version > local.version {
                if self.store.commit_if_unchanged(&remote_doc, Some(&local)).await? {
                    report.pulled += 1;
                } else {
                    report.deferred += 1;
                }
            }
            return Ok(());
        };

        log::info!(
            "Conflict on {} with '{}': {:?} (local v{}, remote v{})",
            key,
            remote.name(),
            kind,
            local.version,
            remote_doc.version
        );
        report.conflicts_found += 1;

        let Some(resolution) = self.strategy.resolution(kind, &local_session, &remote_session)
        else {
            let conflict = SyncConflict {
                document_id: local.document_id.clone(),
                key: key.to_string(),
                provider: remote.name().to_string(),
                kind,
                local,
                remote: remote_doc,
                detected_at: now_millis(),
            };
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.retain(|c| !(c.key == conflict.key && c.provider == conflict.provider));
            pending.push(conflict);
            return Ok(());
        };

        if self.apply(remote, key, &local, &remote_doc, resolution).await? {
            report.conflicts_resolved += 1;
        } else {
            report.deferred += 1;
        }
        Ok(())
    }

    /// Write a resolution. Returns false if the primary moved on and the
    /// write was deferred.
    async fn apply(
        &self,
        remote: &dyn Provider,
        key: &str,
        local: &AnnotationDocument,
        remote_doc: &AnnotationDocument,
        resolution: Resolution,
    ) -> AnnotationResult<bool> {
        match resolution {
            Resolution::KeepLocal => {
                save_remote(remote, key, local).await?;
                Ok(true)
            }
            Resolution::KeepRemote => self.store.commit_if_unchanged(remote_doc, Some(local)).await,
            Resolution::Merge => {
                let merged = merge_sessions(
                    &AnnotationSession::from_document(local),
                    &AnnotationSession::from_document(remote_doc),
                );
                let mut doc = local.clone();
                doc.apply_session(&merged)?;
                if !self.store.commit_if_unchanged(&doc, Some(local)).await? {
                    return Ok(false);
                }
                save_remote(remote, key, &doc).await?;
                Ok(true)
            }
        }
    }

    /// Settle a conflict recorded under the manual strategy.
    ///
    /// Returns false if the primary changed since detection; the conflict is
    /// then re-detected on the next pass.
    pub async fn resolve_conflict(
        &self,
        document_id: &str,
        provider: &str,
        resolution: Resolution,
    ) -> AnnotationResult<bool> {
        let remote = self
            .store
            .providers()
            .secondaries()
            .iter()
            .find(|p| p.name() == provider)
            .cloned()
            .ok_or_else(|| AnnotationError::NotFound(format!("provider {}", provider)))?;

        let conflict = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let index = pending
                .iter()
                .position(|c| c.document_id == document_id && c.provider == provider)
                .ok_or_else(|| {
                    AnnotationError::NotFound(format!(
                        "conflict on {} with '{}'",
                        document_id, provider
                    ))
                })?;
            pending.remove(index)
        };

        self.apply(
            remote.as_ref(),
            &conflict.key,
            &conflict.local,
            &conflict.remote,
            resolution,
        )
        .await
    }

    /// Run [`sync_all`](Self::sync_all) every `period` until the handle is
    /// shut down or dropped. A pass in progress always runs to completion.
    pub fn spawn_periodic(self: &Arc<Self>, period: Duration) -> SyncHandle {
        let manager = Arc::clone(self);
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        manager.sync_all().await;
                    }
                }
            }
            log::debug!("Periodic sync stopped");
        });
        SyncHandle {
            shutdown: Some(shutdown),
            task,
        }
    }
}

/// Handle on a periodic sync task.
pub struct SyncHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop the timer and wait for any pass in progress.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            log::warn!("Periodic sync task ended abnormally: {}", e);
        }
    }
}

fn remote_error(remote: &dyn Provider, source: ProviderError) -> AnnotationError {
    AnnotationError::SyncProvider {
        provider: remote.name().to_string(),
        source,
    }
}

/// Load a secondary's copy. Unreadable or invalid copies count as absent.
async fn load_remote(
    remote: &dyn Provider,
    key: &str,
    document_id: &str,
) -> AnnotationResult<Option<AnnotationDocument>> {
    let value = match remote.load(key).await {
        Ok(Some(value)) => value,
        Ok(None) => return Ok(None),
        Err(ProviderError::Serialization(msg)) => {
            log::warn!("Unreadable copy of {} on '{}': {}", key, remote.name(), msg);
            return Ok(None);
        }
        Err(e) => return Err(remote_error(remote, e)),
    };
    match AnnotationDocument::from_value(value) {
        Ok(doc) if doc.document_id == document_id => Ok(Some(doc)),
        Ok(doc) => {
            log::warn!("Copy of {} on '{}' holds {}", key, remote.name(), doc.document_id);
            Ok(None)
        }
        Err(e) => {
            log::warn!("Invalid copy of {} on '{}': {}", key, remote.name(), e);
            Ok(None)
        }
    }
}

async fn save_remote(remote: &dyn Provider, key: &str, doc: &AnnotationDocument) -> AnnotationResult<()> {
    let value = doc.to_value()?;
    remote
        .save(key, &value)
        .await
        .map_err(|e| remote_error(remote, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Annotation;
    use crate::coords::DocPoint;
    use crate::document::DocumentMetadata;

    fn session(version: u64, modified: u64, annotations: Vec<Annotation>) -> AnnotationSession {
        let mut doc = AnnotationDocument::new("doc", 1, DocumentMetadata::default());
        doc.page_mut(1).unwrap().annotations = annotations;
        doc.version = version;
        doc.last_modified = modified;
        AnnotationSession::from_document(&doc)
    }

    fn line() -> Annotation {
        Annotation::line(DocPoint::new(0.0, 0.0), DocPoint::new(1.0, 1.0), 1.0)
    }

    #[test]
    fn test_detect_conflict_kinds() {
        let a = line();
        let same = session(3, 10, vec![a.clone()]);
        assert_eq!(detect_conflict(&same, &session(5, 20, vec![a.clone()])), None);
        assert_eq!(
            detect_conflict(&same, &session(4, 10, vec![a.clone(), line()])),
            Some(ConflictKind::Version)
        );
        assert_eq!(
            detect_conflict(&same, &session(3, 10, vec![line()])),
            Some(ConflictKind::Concurrent)
        );
    }

    #[test]
    fn test_latest_prefers_higher_version() {
        let local = session(2, 500, vec![line()]);
        let remote = session(3, 100, vec![line()]);
        assert_eq!(
            ConflictStrategy::Latest.resolution(ConflictKind::Version, &local, &remote),
            Some(Resolution::KeepRemote)
        );
        assert_eq!(
            ConflictStrategy::Latest.resolution(ConflictKind::Version, &remote, &local),
            Some(Resolution::KeepLocal)
        );
    }

    #[test]
    fn test_latest_concurrent_uses_modified_time() {
        let local = session(2, 100, vec![line()]);
        let newer = session(2, 200, vec![line()]);
        let tie = session(2, 100, vec![line()]);
        assert_eq!(
            ConflictStrategy::Latest.resolution(ConflictKind::Concurrent, &local, &newer),
            Some(Resolution::KeepRemote)
        );
        assert_eq!(
            ConflictStrategy::Latest.resolution(ConflictKind::Concurrent, &local, &tie),
            Some(Resolution::KeepLocal)
        );
    }

    #[test]
    fn test_manual_and_merge_strategies() {
        let local = session(1, 1, vec![line()]);
        let remote = session(1, 2, vec![line()]);
        assert_eq!(
            ConflictStrategy::Manual.resolution(ConflictKind::Concurrent, &local, &remote),
            None
        );
        assert_eq!(
            ConflictStrategy::Merge.resolution(ConflictKind::Version, &local, &remote),
            Some(Resolution::Merge)
        );
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Merge".parse::<ConflictStrategy>(), Ok(ConflictStrategy::Merge));
        assert_eq!("latest".parse::<ConflictStrategy>(), Ok(ConflictStrategy::Latest));
        assert!("newest".parse::<ConflictStrategy>().is_err());
    }
}
