//! Per-document CRUD over the provider set.
//!
//! Every mutation reads the whole document from the primary provider, changes
//! it, and writes the whole document back. Mutations on the same document are
//! serialized through a per-document async lock held across that cycle, so
//! concurrent callers never lose each other's updates. Secondary providers
//! receive a copy of each committed document in the background.

use crate::annotation::{Annotation, AnnotationId};
use crate::cache::{AnnotationCache, CacheStats};
use crate::config::AnnotatorConfig;
use crate::coords::PageSize;
use crate::document::{AnnotationDocument, DocumentMetadata};
use crate::error::{AnnotationError, AnnotationResult};
use crate::export::{PageExport, export_pages};
use crate::storage::{ProviderError, ProviderSet, Replication, ReplicationOutcome};
use dashmap::DashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

/// Owns documents persisted through a [`ProviderSet`].
pub struct DocumentStore {
    providers: ProviderSet,
    config: AnnotatorConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    caches: DashMap<String, Arc<AnnotationCache>>,
    replication: std::sync::Mutex<Replication>,
}

impl DocumentStore {
    pub fn new(providers: ProviderSet, config: AnnotatorConfig) -> Self {
        Self {
            providers,
            config,
            locks: DashMap::new(),
            caches: DashMap::new(),
            replication: std::sync::Mutex::new(Replication::default()),
        }
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub fn config(&self) -> &AnnotatorConfig {
        &self.config
    }

    /// Storage key for a document.
    pub fn key(&self, document_id: &str) -> String {
        self.config.document_key(document_id)
    }

    /// Inverse of [`key`](Self::key). `None` for keys outside the store's prefix.
    pub fn document_id_for_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.config.sync.key_prefix.as_str())
            .filter(|id| !id.is_empty())
    }

    fn lock_for(&self, document_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(document_id.to_string()).or_default().clone()
    }

    fn cache_for(&self, document_id: &str) -> Arc<AnnotationCache> {
        self.caches
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(AnnotationCache::new(&self.config.cache)))
            .clone()
    }

    fn drop_cache(&self, document_id: &str) {
        if let Some((_, cache)) = self.caches.remove(document_id) {
            cache.clear();
        }
    }

    fn track(&self, replication: Replication) {
        if replication.is_empty() {
            return;
        }
        self.replication
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(replication);
    }

    /// Read a document from the primary. Invalid documents are treated as absent.
    async fn read(&self, document_id: &str) -> AnnotationResult<Option<AnnotationDocument>> {
        let key = self.key(document_id);
        let value = match self.providers.primary().load(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(ProviderError::Serialization(msg)) => {
                log::error!("Data loss: {} is unreadable and will be replaced: {}", key, msg);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match AnnotationDocument::from_value(value) {
            Ok(doc) if doc.document_id == document_id => Ok(Some(doc)),
            Ok(doc) => {
                log::error!(
                    "Data loss: {} holds document {} and will be replaced",
                    key,
                    doc.document_id
                );
                Ok(None)
            }
            Err(e) => {
                log::error!("Data loss: {} failed validation and will be replaced: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Write to the primary, then fan out to secondaries in the background.
    async fn write(&self, doc: &AnnotationDocument) -> AnnotationResult<()> {
        let key = self.key(&doc.document_id);
        let value = doc.to_value()?;
        self.providers.primary().save(&key, &value).await?;
        self.track(self.providers.replicate(&key, &value));
        Ok(())
    }

    /// Run one read-modify-write cycle under the document's lock.
    ///
    /// `f` returns `None` to leave the document unchanged (nothing is written).
    /// After a commit the touched page is refreshed in the cache.
    async fn mutate<R, F>(&self, document_id: &str, page_number: u32, f: F) -> AnnotationResult<Option<R>>
    where
        F: FnOnce(&mut AnnotationDocument) -> AnnotationResult<Option<R>> + Send,
        R: Send,
    {
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;

        let mut doc = self
            .read(document_id)
            .await?
            .ok_or_else(|| AnnotationError::NotFound(format!("document {}", document_id)))?;
        let Some(result) = f(&mut doc)? else {
            return Ok(None);
        };

        doc.stamp(&self.config.device_id, self.config.user_id.as_deref());
        self.write(&doc).await?;
        self.cache_for(document_id)
            .fill_page(page_number, &doc.page(page_number)?.annotations);
        Ok(Some(result))
    }

    async fn create_locked(
        &self,
        document_id: &str,
        total_pages: u32,
        metadata: DocumentMetadata,
    ) -> AnnotationResult<AnnotationDocument> {
        if total_pages == 0 {
            return Err(AnnotationError::InvalidOperation(
                "a document needs at least one page".to_string(),
            ));
        }
        let mut doc = AnnotationDocument::new(document_id, total_pages, metadata);
        doc.stamp(&self.config.device_id, self.config.user_id.as_deref());
        self.write(&doc).await?;
        self.drop_cache(document_id);
        log::info!("Created annotation document {} with {} pages", document_id, total_pages);
        Ok(doc)
    }

    /// Create a document with `total_pages` empty pages.
    ///
    /// Fails if a valid document already exists under this id.
    pub async fn create(
        &self,
        document_id: &str,
        total_pages: u32,
        metadata: DocumentMetadata,
    ) -> AnnotationResult<AnnotationDocument> {
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;
        if self.read(document_id).await?.is_some() {
            return Err(AnnotationError::InvalidOperation(format!(
                "document {} already exists",
                document_id
            )));
        }
        self.create_locked(document_id, total_pages, metadata).await
    }

    /// Load a document, creating it if absent or invalid.
    ///
    /// The page count of an existing document is never changed.
    pub async fn open(
        &self,
        document_id: &str,
        total_pages: u32,
        metadata: DocumentMetadata,
    ) -> AnnotationResult<AnnotationDocument> {
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;
        match self.read(document_id).await? {
            Some(doc) => {
                if doc.total_pages() != total_pages {
                    log::warn!(
                        "Document {} has {} pages, ignoring requested {}",
                        document_id,
                        doc.total_pages(),
                        total_pages
                    );
                }
                Ok(doc)
            }
            None => self.create_locked(document_id, total_pages, metadata).await,
        }
    }

    /// Load a document from the primary provider.
    pub async fn load(&self, document_id: &str) -> AnnotationResult<Option<AnnotationDocument>> {
        self.read(document_id).await
    }

    /// Add an annotation to a page.
    pub async fn add(
        &self,
        document_id: &str,
        page_number: u32,
        annotation: Annotation,
    ) -> AnnotationResult<AnnotationId> {
        let id = annotation.id;
        self.mutate(document_id, page_number, move |doc| {
            let page = doc.page_mut(page_number)?;
            if page.position(id).is_some() {
                return Err(AnnotationError::InvalidOperation(format!(
                    "annotation {} already exists",
                    id
                )));
            }
            page.annotations.push(annotation);
            Ok(Some(()))
        })
        .await?;
        log::debug!("Added annotation {} to page {} of {}", id, page_number, document_id);
        Ok(id)
    }

    /// Replace an annotation in place, matched by id. Returns the stored copy.
    pub async fn update(
        &self,
        document_id: &str,
        page_number: u32,
        mut annotation: Annotation,
    ) -> AnnotationResult<Annotation> {
        let updated = self
            .mutate(document_id, page_number, move |doc| {
                let page = doc.page_mut(page_number)?;
                let index = page.position(annotation.id).ok_or_else(|| {
                    AnnotationError::NotFound(format!(
                        "annotation {} on page {}",
                        annotation.id, page_number
                    ))
                })?;
                annotation.touch();
                page.annotations[index] = annotation.clone();
                Ok(Some(annotation))
            })
            .await?;
        updated.ok_or_else(|| AnnotationError::NotFound(format!("document {}", document_id)))
    }

    /// Remove an annotation. Removing a missing annotation is a logged no-op.
    ///
    /// Returns whether anything was removed.
    pub async fn remove(
        &self,
        document_id: &str,
        page_number: u32,
        annotation_id: AnnotationId,
    ) -> AnnotationResult<bool> {
        let result = self
            .mutate(document_id, page_number, move |doc| {
                let page = doc.page_mut(page_number)?;
                Ok(page.position(annotation_id).map(|index| {
                    page.annotations.remove(index);
                }))
            })
            .await;

        let removed = match result {
            Ok(removed) => removed.is_some(),
            Err(AnnotationError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if !removed {
            log::warn!(
                "Annotation {} not found on page {} of {}, nothing to remove",
                annotation_id,
                page_number,
                document_id
            );
        }
        Ok(removed)
    }

    /// Record a page's size.
    pub async fn set_page_size(
        &self,
        document_id: &str,
        page_number: u32,
        size: PageSize,
    ) -> AnnotationResult<()> {
        self.mutate(document_id, page_number, move |doc| {
            let page = doc.page_mut(page_number)?;
            if page.page_size == Some(size) {
                return Ok(None);
            }
            page.page_size = Some(size);
            Ok(Some(()))
        })
        .await?;
        Ok(())
    }

    /// Annotations on one page, served from the cache when the page is fully cached.
    pub async fn page_annotations(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> AnnotationResult<Vec<Annotation>> {
        let cache = self.cache_for(document_id);
        if let Some(annotations) = cache.get_page(page_number) {
            return Ok(annotations);
        }

        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;
        let doc = self
            .read(document_id)
            .await?
            .ok_or_else(|| AnnotationError::NotFound(format!("document {}", document_id)))?;
        let annotations = doc.page(page_number)?.annotations.clone();
        cache.fill_page(page_number, &annotations);
        Ok(annotations)
    }

    pub fn cache_stats(&self, document_id: &str) -> Option<CacheStats> {
        self.caches.get(document_id).map(|cache| cache.stats())
    }

    /// Delete a document from every provider.
    pub async fn delete_document(&self, document_id: &str) -> AnnotationResult<()> {
        let key = self.key(document_id);
        {
            let lock = self.lock_for(document_id);
            let _guard = lock.lock().await;
            self.providers.primary().delete(&key).await?;
            self.track(self.providers.replicate_delete(&key));
            self.drop_cache(document_id);
        }
        self.locks
            .remove_if(document_id, |_, lock| Arc::strong_count(lock) == 1);
        log::info!("Deleted annotation document {}", document_id);
        Ok(())
    }

    /// Ids of every document on the primary provider.
    pub async fn list_documents(&self) -> AnnotationResult<Vec<String>> {
        let prefix = self.config.sync.key_prefix.as_str();
        let keys = self.providers.primary().list(Some(prefix)).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.document_id_for_key(key))
            .map(str::to_string)
            .collect())
    }

    /// Release in-memory state for a document.
    pub fn close(&self, document_id: &str) {
        self.drop_cache(document_id);
        self.locks
            .remove_if(document_id, |_, lock| Arc::strong_count(lock) == 1);
        log::debug!("Closed annotation document {}", document_id);
    }

    /// Replace a document with an exported JSON payload.
    ///
    /// The payload is parsed and validated before anything is written. The
    /// imported document's version is bumped past any stored copy, whose page
    /// count it must match.
    pub async fn import_json(&self, json: &str) -> AnnotationResult<AnnotationDocument> {
        let mut doc = AnnotationDocument::from_json(json).map_err(|e| match e {
            AnnotationError::Validation(msg) => AnnotationError::Parse(msg),
            other => other,
        })?;

        let lock = self.lock_for(&doc.document_id);
        let _guard = lock.lock().await;
        if let Some(existing) = self.read(&doc.document_id).await? {
            if existing.total_pages() != doc.total_pages() {
                return Err(AnnotationError::InvalidOperation(format!(
                    "document {} has {} pages, import has {}",
                    doc.document_id,
                    existing.total_pages(),
                    doc.total_pages()
                )));
            }
            doc.version = doc.version.max(existing.version);
        }
        doc.stamp(&self.config.device_id, self.config.user_id.as_deref());
        self.write(&doc).await?;
        self.drop_cache(&doc.document_id);
        log::info!(
            "Imported document {} ({} annotations)",
            doc.document_id,
            doc.annotation_count()
        );
        Ok(doc)
    }

    pub async fn export_json(&self, document_id: &str) -> AnnotationResult<String> {
        let doc = self.require(document_id).await?;
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Per-page annotation feed for the exporter.
    pub async fn export_pages(&self, document_id: &str) -> AnnotationResult<Vec<PageExport>> {
        let doc = self.require(document_id).await?;
        Ok(export_pages(&doc))
    }

    async fn require(&self, document_id: &str) -> AnnotationResult<AnnotationDocument> {
        self.read(document_id)
            .await?
            .ok_or_else(|| AnnotationError::NotFound(format!("document {}", document_id)))
    }

    /// Wait for outstanding background replication and report the outcomes.
    pub async fn flush_replication(&self) -> Vec<ReplicationOutcome> {
        let pending = std::mem::take(
            &mut *self
                .replication
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        pending.join().await
    }

    /// Commit a document produced by sync, but only if the primary still
    /// holds `expected` (`None` meaning absent). Returns whether it was written.
    /// A stored document is never replaced by one with a different page count.
    pub(crate) async fn commit_if_unchanged(
        &self,
        doc: &AnnotationDocument,
        expected: Option<&AnnotationDocument>,
    ) -> AnnotationResult<bool> {
        let lock = self.lock_for(&doc.document_id);
        let _guard = lock.lock().await;
        let current = self.read(&doc.document_id).await?;
        if current.as_ref() != expected {
            log::info!(
                "Primary copy of {} changed during sync, deferring to next pass",
                doc.document_id
            );
            return Ok(false);
        }
        if let Some(current) = current.filter(|c| c.total_pages() != doc.total_pages()) {
            return Err(AnnotationError::InvalidOperation(format!(
                "document {} has {} pages, sync copy has {}",
                doc.document_id,
                current.total_pages(),
                doc.total_pages()
            )));
        }
        self.write(doc).await?;
        self.drop_cache(&doc.document_id);
        Ok(true)
    }
}
