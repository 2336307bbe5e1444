//! In-memory LRU cache of annotations, indexed by page.
//!
//! The cache is volatile and always rebuildable from the document store. A
//! page is only served in bulk while every one of its annotations is still
//! cached; any eviction or invalidation on that page drops it back to
//! "incomplete" so readers fall through to storage.

use crate::annotation::{Annotation, AnnotationId, AnnotationType, now_millis};
use crate::config::CacheConfig;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

type CacheKey = (u32, AnnotationId);

/// A cached annotation plus cache bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnnotation {
    pub id: AnnotationId,
    pub page_number: u32,
    pub annotation_type: AnnotationType,
    pub data: Annotation,
    /// When the entry was inserted, in milliseconds. Drives TTL expiry.
    pub last_modified: u64,
    /// Pre-rendered pixels for static annotations. Advisory only.
    pub rendered_snapshot: Option<Vec<u8>>,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Cached ids for one page, in draw order.
#[derive(Default)]
struct PageEntry {
    ids: Vec<AnnotationId>,
    complete: bool,
}

struct Inner {
    entries: LruCache<CacheKey, CachedAnnotation>,
    pages: HashMap<u32, PageEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn unindex(&mut self, (page, id): CacheKey) {
        if let Some(entry) = self.pages.get_mut(&page) {
            entry.ids.retain(|cached| *cached != id);
            entry.complete = false;
        }
    }

    fn insert(&mut self, entry: CachedAnnotation) {
        let key = (entry.page_number, entry.id);
        let page = self.pages.entry(key.0).or_default();
        if !page.ids.contains(&key.1) {
            page.ids.push(key.1);
        }
        if let Some((evicted, _)) = self.entries.push(key, entry) {
            if evicted != key {
                log::debug!("Evicted annotation {} from page {}", evicted.1, evicted.0);
                self.evictions += 1;
                self.unindex(evicted);
            }
        }
    }

    /// Look up without touching the counters. Expired entries are dropped.
    fn lookup(&mut self, key: CacheKey, now: u64, max_age_ms: u64) -> Option<CachedAnnotation> {
        let expired = self
            .entries
            .peek(&key)
            .map(|entry| now.saturating_sub(entry.last_modified) > max_age_ms)?;
        if expired {
            self.entries.pop(&key);
            self.unindex(key);
            return None;
        }
        self.entries.get(&key).cloned()
    }
}

/// LRU annotation cache for one document.
///
/// All mutation, including LRU reordering on reads, happens under one mutex.
pub struct AnnotationCache {
    inner: Mutex<Inner>,
    max_age_ms: u64,
}

impl AnnotationCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                pages: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_age_ms: config.max_age_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or refresh an annotation at the most-recently-used position.
    pub fn set(&self, page_number: u32, annotation: Annotation) {
        self.set_at(page_number, annotation, now_millis());
    }

    /// [`set`](Self::set) with an explicit insertion time.
    pub fn set_at(&self, page_number: u32, annotation: Annotation, now: u64) {
        let entry = CachedAnnotation {
            id: annotation.id,
            page_number,
            annotation_type: annotation.annotation_type(),
            data: annotation,
            last_modified: now,
            rendered_snapshot: None,
        };
        self.lock().insert(entry);
    }

    pub fn get(&self, page_number: u32, id: AnnotationId) -> Option<CachedAnnotation> {
        self.get_at(page_number, id, now_millis())
    }

    /// Hit only if present and no older than the configured max age.
    pub fn get_at(&self, page_number: u32, id: AnnotationId, now: u64) -> Option<CachedAnnotation> {
        let mut inner = self.lock();
        let found = inner.lookup((page_number, id), now, self.max_age_ms);
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Replace a page's cached contents with the full annotation list from storage.
    pub fn fill_page(&self, page_number: u32, annotations: &[Annotation]) {
        let now = now_millis();
        let mut inner = self.lock();
        let stale: Vec<AnnotationId> = inner
            .pages
            .get(&page_number)
            .map(|entry| entry.ids.clone())
            .unwrap_or_default();
        for id in stale {
            inner.entries.pop(&(page_number, id));
        }
        inner.pages.insert(page_number, PageEntry::default());
        for annotation in annotations {
            inner.insert(CachedAnnotation {
                id: annotation.id,
                page_number,
                annotation_type: annotation.annotation_type(),
                data: annotation.clone(),
                last_modified: now,
                rendered_snapshot: None,
            });
        }
        // Filling may evict this page's own entries when the page exceeds capacity.
        if let Some(entry) = inner.pages.get_mut(&page_number) {
            entry.complete = entry.ids.len() == annotations.len();
        }
    }

    /// Every annotation on a page in draw order, or `None` unless the whole
    /// page is cached and fresh.
    pub fn get_page(&self, page_number: u32) -> Option<Vec<Annotation>> {
        self.get_page_at(page_number, now_millis())
    }

    pub fn get_page_at(&self, page_number: u32, now: u64) -> Option<Vec<Annotation>> {
        let mut inner = self.lock();
        let ids = inner
            .pages
            .get(&page_number)
            .filter(|entry| entry.complete)
            .map(|entry| entry.ids.clone());
        let Some(ids) = ids else {
            inner.misses += 1;
            return None;
        };

        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match inner.lookup((page_number, id), now, self.max_age_ms) {
                Some(entry) => found.push(entry.data),
                None => {
                    inner.misses += 1;
                    return None;
                }
            }
        }
        inner.hits += 1;
        Some(found)
    }

    /// Attach a rendered snapshot to a cached entry. Returns false if absent.
    pub fn set_snapshot(&self, page_number: u32, id: AnnotationId, snapshot: Vec<u8>) -> bool {
        let mut inner = self.lock();
        match inner.entries.peek_mut(&(page_number, id)) {
            Some(entry) => {
                entry.rendered_snapshot = Some(snapshot);
                true
            }
            None => false,
        }
    }

    pub fn invalidate(&self, page_number: u32, id: AnnotationId) {
        let mut inner = self.lock();
        inner.entries.pop(&(page_number, id));
        inner.unindex((page_number, id));
    }

    pub fn invalidate_page(&self, page_number: u32) {
        let mut inner = self.lock();
        if let Some(entry) = inner.pages.remove(&page_number) {
            for id in entry.ids {
                inner.entries.pop(&(page_number, id));
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::DocPoint;

    fn note(x: f64) -> Annotation {
        Annotation::line(DocPoint::new(x, 0.0), DocPoint::new(x + 10.0, 10.0), 2.0)
    }

    fn small_cache(max_cache_size: usize) -> AnnotationCache {
        AnnotationCache::new(&CacheConfig {
            max_cache_size,
            max_age_ms: 1_000,
        })
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = small_cache(2);
        let (a, b, c, d) = (note(0.0), note(1.0), note(2.0), note(3.0));
        let (ida, idb, idc, idd) = (a.id, b.id, c.id, d.id);

        cache.set_at(1, a, 100);
        cache.set_at(1, b, 100);
        cache.set_at(1, c, 100);
        assert!(cache.get_at(1, ida, 100).is_none());

        assert!(cache.get_at(1, idb, 100).is_some());
        cache.set_at(1, d, 100);
        assert!(cache.get_at(1, idc, 100).is_none());
        assert!(cache.get_at(1, idb, 100).is_some());
        assert!(cache.get_at(1, idd, 100).is_some());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_refresh_does_not_count_as_eviction() {
        let cache = small_cache(2);
        let a = note(0.0);
        cache.set_at(1, a.clone(), 100);
        cache.set_at(1, a, 200);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_ttl_expiry_is_miss_and_evicts() {
        let cache = small_cache(10);
        let a = note(0.0);
        let id = a.id;
        let now = 10_000;
        cache.set_at(1, a, now - 1_000 - 1);

        assert!(cache.get_at(1, id, now).is_none());
        assert!(cache.is_empty());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_entry_at_exact_max_age_is_hit() {
        let cache = small_cache(10);
        let a = note(0.0);
        let id = a.id;
        cache.set_at(1, a, 9_000);
        assert!(cache.get_at(1, id, 10_000).is_some());
    }

    #[test]
    fn test_hit_rate() {
        let cache = small_cache(10);
        let a = note(0.0);
        let id = a.id;
        cache.set_at(1, a, 0);
        cache.get_at(1, id, 0);
        cache.get_at(1, id, 0);
        cache.get_at(2, id, 0);
        cache.get_at(1, uuid::Uuid::new_v4(), 0);
        assert_eq!(cache.stats().hit_rate, 0.5);
    }

    #[test]
    fn test_page_served_only_when_complete() {
        let cache = small_cache(10);
        let (a, b) = (note(0.0), note(1.0));
        let ida = a.id;

        assert!(cache.get_page(3).is_none());
        cache.fill_page(3, &[a, b]);
        assert_eq!(cache.get_page(3).map(|v| v.len()), Some(2));

        cache.invalidate(3, ida);
        assert!(cache.get_page(3).is_none());
    }

    #[test]
    fn test_page_keeps_draw_order() {
        let cache = small_cache(10);
        let notes: Vec<Annotation> = (0..5).map(|i| note(i as f64)).collect();
        let ids: Vec<AnnotationId> = notes.iter().rev().map(|a| a.id).collect();
        let reversed: Vec<Annotation> = notes.into_iter().rev().collect();

        cache.fill_page(1, &reversed);
        let cached: Vec<AnnotationId> = cache.get_page(1).unwrap().iter().map(|a| a.id).collect();
        assert_eq!(cached, ids);
    }

    #[test]
    fn test_empty_page_can_be_cached() {
        let cache = small_cache(10);
        cache.fill_page(2, &[]);
        assert_eq!(cache.get_page(2), Some(vec![]));
    }

    #[test]
    fn test_set_keeps_complete_page_complete() {
        let cache = small_cache(10);
        cache.fill_page(1, &[note(0.0)]);
        cache.set(1, note(5.0));
        assert_eq!(cache.get_page(1).map(|v| v.len()), Some(2));
    }

    #[test]
    fn test_fill_page_beyond_capacity_stays_incomplete() {
        let cache = small_cache(2);
        cache.fill_page(1, &[note(0.0), note(1.0), note(2.0)]);
        assert!(cache.get_page(1).is_none());
    }

    #[test]
    fn test_eviction_marks_other_page_incomplete() {
        let cache = small_cache(2);
        cache.fill_page(1, &[note(0.0)]);
        cache.set(2, note(1.0));
        cache.set(2, note(2.0));
        assert!(cache.get_page(1).is_none());
    }

    #[test]
    fn test_invalidate_page_and_clear() {
        let cache = small_cache(10);
        cache.fill_page(1, &[note(0.0), note(1.0)]);
        cache.fill_page(2, &[note(2.0)]);

        cache.invalidate_page(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_page(1).is_none());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_slot() {
        let cache = small_cache(10);
        let a = note(0.0);
        let id = a.id;
        cache.set(1, a);
        assert!(cache.set_snapshot(1, id, vec![1, 2, 3]));
        assert_eq!(cache.get(1, id).unwrap().rendered_snapshot, Some(vec![1, 2, 3]));
        assert!(!cache.set_snapshot(1, uuid::Uuid::new_v4(), vec![]));
    }
}
