use pagemark_core::coords::DocPoint;
use pagemark_core::document::AnnotationDocument;
use pagemark_core::storage::{BoxFuture, MemoryProvider, Provider, ProviderResult, ProviderSet};
use pagemark_core::{
    Annotation, AnnotationError, AnnotatorConfig, ConflictStrategy, DocumentMetadata,
    DocumentStore, Resolution, SyncManager,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

const KEY: &str = "annotations/doc";

struct Fixture {
    primary: Arc<MemoryProvider>,
    remote: Arc<MemoryProvider>,
    store: Arc<DocumentStore>,
}

fn fixture() -> Fixture {
    let primary = Arc::new(MemoryProvider::named("local"));
    let remote = Arc::new(MemoryProvider::named("remote"));
    let store = Arc::new(DocumentStore::new(
        ProviderSet::new(primary.clone()).with_secondary(remote.clone()),
        AnnotatorConfig::default(),
    ));
    Fixture {
        primary,
        remote,
        store,
    }
}

fn mark(x: f64) -> Annotation {
    Annotation::rectangle(DocPoint::new(x, x), DocPoint::new(x + 20.0, x + 10.0), 1.0)
}

fn doc_with(annotations: &[Annotation], version: u64, last_modified: u64) -> AnnotationDocument {
    let mut doc = AnnotationDocument::new("doc", 2, DocumentMetadata::default());
    doc.page_mut(1).unwrap().annotations = annotations.to_vec();
    doc.version = version;
    doc.last_modified = last_modified;
    doc
}

async fn put(provider: &MemoryProvider, doc: &AnnotationDocument) {
    provider.save(KEY, &doc.to_value().unwrap()).await.unwrap();
}

async fn get(provider: &MemoryProvider) -> AnnotationDocument {
    let value = provider.load(KEY).await.unwrap().unwrap();
    AnnotationDocument::from_value(value).unwrap()
}

fn ids(doc: &AnnotationDocument) -> Vec<uuid::Uuid> {
    doc.annotations.iter().flat_map(|p| p.annotations.iter().map(|a| a.id)).collect()
}

#[tokio::test]
async fn missing_documents_are_copied_both_ways() {
    let f = fixture();
    put(&f.primary, &doc_with(&[mark(0.0)], 1, 100)).await;
    let mut other = doc_with(&[mark(1.0)], 1, 100);
    other.document_id = "other".to_string();
    f.remote
        .save("annotations/other", &other.to_value().unwrap())
        .await
        .unwrap();

    let manager = SyncManager::new(f.store.clone());
    let report = manager.sync_all().await;
    let remote = report.provider("remote").unwrap();
    assert_eq!(remote.pushed, 1);
    assert_eq!(remote.pulled, 1);
    assert_eq!(report.conflicts_found(), 0);

    assert!(f.remote.load(KEY).await.unwrap().is_some());
    assert!(f.store.load("other").await.unwrap().is_some());
}

#[tokio::test]
async fn failing_provider_does_not_stop_the_others() {
    let primary = Arc::new(MemoryProvider::named("local"));
    let broken = Arc::new(MemoryProvider::named("broken"));
    broken.set_offline(true);
    let healthy = Arc::new(MemoryProvider::named("healthy"));
    let store = Arc::new(DocumentStore::new(
        ProviderSet::new(primary.clone())
            .with_secondary(broken)
            .with_secondary(healthy.clone()),
        AnnotatorConfig::default(),
    ));
    put(&primary, &doc_with(&[mark(0.0)], 1, 100)).await;

    let report = SyncManager::new(store).sync_all().await;
    let failed: Vec<_> = report.failed().map(|p| p.provider.as_str()).collect();
    assert_eq!(failed, vec!["broken"]);
    assert!(matches!(
        report.provider("broken").unwrap().error,
        Some(AnnotationError::SyncProvider { ref provider, .. }) if provider == "broken"
    ));
    assert_eq!(report.provider("healthy").unwrap().pushed, 1);
    assert!(healthy.load(KEY).await.unwrap().is_some());
}

#[tokio::test]
async fn latest_keeps_the_higher_version() {
    let f = fixture();
    let local = doc_with(&[mark(0.0)], 2, 900);
    let remote = doc_with(&[mark(1.0), mark(2.0)], 3, 100);
    put(&f.primary, &local).await;
    put(&f.remote, &remote).await;

    let manager = SyncManager::with_strategy(f.store.clone(), ConflictStrategy::Latest);
    let report = manager.sync_all().await;
    assert_eq!(report.conflicts_found(), 1);
    assert_eq!(report.provider("remote").unwrap().conflicts_resolved, 1);
    assert_eq!(ids(&get(&f.primary).await), ids(&remote));
}

#[tokio::test]
async fn latest_concurrent_edit_keeps_the_newer_copy() {
    let f = fixture();
    let local = doc_with(&[mark(0.0)], 4, 5_000);
    let remote = doc_with(&[mark(1.0)], 4, 1_000);
    put(&f.primary, &local).await;
    put(&f.remote, &remote).await;

    SyncManager::with_strategy(f.store.clone(), ConflictStrategy::Latest)
        .sync_all()
        .await;
    assert_eq!(ids(&get(&f.primary).await), ids(&local));
    assert_eq!(ids(&get(&f.remote).await), ids(&local));
}

#[tokio::test]
async fn merge_unions_annotations_and_converges() {
    let f = fixture();
    let shared = mark(0.0);
    let mut remote_shared = shared.clone();
    remote_shared.opacity = 0.3;
    let (local_only, remote_only) = (mark(1.0), mark(2.0));

    put(&f.primary, &doc_with(&[shared.clone(), local_only.clone()], 5, 100)).await;
    put(&f.remote, &doc_with(&[remote_shared, remote_only.clone()], 7, 200)).await;

    let manager = SyncManager::with_strategy(f.store.clone(), ConflictStrategy::Merge);
    manager.sync_all().await;

    let merged = get(&f.primary).await;
    assert_eq!(ids(&merged), vec![shared.id, local_only.id, remote_only.id]);
    assert_eq!(merged.find(shared.id).unwrap().1.opacity, 1.0);
    assert_eq!(merged.version, 8);
    assert_eq!(get(&f.remote).await, merged);

    let second = manager.sync_all().await;
    assert_eq!(second.conflicts_found(), 0);
}

#[tokio::test]
async fn manual_conflicts_wait_for_a_decision() {
    let f = fixture();
    let local = doc_with(&[mark(0.0)], 2, 100);
    let remote = doc_with(&[mark(1.0)], 2, 200);
    put(&f.primary, &local).await;
    put(&f.remote, &remote).await;

    let manager = SyncManager::with_strategy(f.store.clone(), ConflictStrategy::Manual);
    let report = manager.sync_all().await;
    assert_eq!(report.conflicts_found(), 1);
    assert_eq!(ids(&get(&f.primary).await), ids(&local));
    assert_eq!(ids(&get(&f.remote).await), ids(&remote));

    let pending = manager.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].provider, "remote");

    assert!(
        manager
            .resolve_conflict("doc", "remote", Resolution::KeepRemote)
            .await
            .unwrap()
    );
    assert_eq!(ids(&get(&f.primary).await), ids(&remote));
    assert!(manager.pending_conflicts().is_empty());
    assert!(matches!(
        manager.resolve_conflict("doc", "remote", Resolution::KeepLocal).await,
        Err(AnnotationError::NotFound(_))
    ));
}

#[tokio::test]
async fn resolution_defers_to_newer_foreground_writes() {
    let f = fixture();
    put(&f.primary, &doc_with(&[mark(0.0)], 2, 100)).await;
    put(&f.remote, &doc_with(&[mark(1.0)], 2, 200)).await;

    let manager = SyncManager::with_strategy(f.store.clone(), ConflictStrategy::Manual);
    manager.sync_all().await;

    let added = f.store.add("doc", 2, mark(9.0)).await.unwrap();
    let applied = manager
        .resolve_conflict("doc", "remote", Resolution::KeepRemote)
        .await
        .unwrap();
    assert!(!applied);
    assert!(get(&f.primary).await.find(added).is_some());
}

/// Remote that lets a foreground edit land between sync's read of the
/// primary and its read of the remote copy.
struct EditDuringLoad {
    inner: MemoryProvider,
    store: OnceLock<Arc<DocumentStore>>,
    edit: Mutex<Option<Annotation>>,
}

impl Provider for EditDuringLoad {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn save(&self, key: &str, value: &Value) -> BoxFuture<'_, ProviderResult<()>> {
        self.inner.save(key, value)
    }

    fn load(&self, key: &str) -> BoxFuture<'_, ProviderResult<Option<Value>>> {
        let key = key.to_string();
        Box::pin(async move {
            let edit = self.edit.lock().unwrap().take();
            if let (Some(annotation), Some(store)) = (edit, self.store.get()) {
                store.add("doc", 1, annotation).await.unwrap();
            }
            self.inner.load(&key).await
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, ProviderResult<()>> {
        self.inner.delete(key)
    }

    fn list(&self, prefix: Option<&str>) -> BoxFuture<'_, ProviderResult<Vec<String>>> {
        self.inner.list(prefix)
    }
}

#[tokio::test]
async fn pass_defers_when_primary_changes_mid_pass() {
    let primary = Arc::new(MemoryProvider::named("local"));
    let late = mark(9.0);
    let remote = Arc::new(EditDuringLoad {
        inner: MemoryProvider::named("remote"),
        store: OnceLock::new(),
        edit: Mutex::new(Some(late.clone())),
    });
    let store = Arc::new(DocumentStore::new(
        ProviderSet::new(primary.clone()).with_secondary(remote.clone()),
        AnnotatorConfig::default(),
    ));
    assert!(remote.store.set(store.clone()).is_ok());

    put(&primary, &doc_with(&[mark(0.0)], 2, 100)).await;
    put(&remote.inner, &doc_with(&[mark(1.0)], 3, 200)).await;

    let manager = SyncManager::with_strategy(store.clone(), ConflictStrategy::Latest);
    let report = manager.sync_all().await;
    let outcome = report.provider("remote").unwrap();
    assert_eq!(outcome.conflicts_found, 1);
    assert_eq!(outcome.conflicts_resolved, 0);
    assert_eq!(outcome.deferred, 1);

    let kept = get(&primary).await;
    assert!(kept.find(late.id).is_some());
    assert_eq!(kept.version, 3);
}

#[tokio::test]
async fn remote_copy_with_other_page_count_is_replaced() {
    let f = fixture();
    let local = doc_with(&[mark(0.0)], 1, 100);
    let mut resized = AnnotationDocument::new("doc", 5, DocumentMetadata::default());
    resized.page_mut(4).unwrap().annotations.push(mark(1.0));
    resized.version = 9;
    resized.last_modified = 900;
    put(&f.primary, &local).await;
    put(&f.remote, &resized).await;

    let manager = SyncManager::with_strategy(f.store.clone(), ConflictStrategy::Latest);
    let report = manager.sync_all().await;
    assert!(report.failed().next().is_none());
    assert_eq!(report.provider("remote").unwrap().pushed, 1);

    let kept = get(&f.primary).await;
    assert_eq!(kept.total_pages(), 2);
    assert_eq!(ids(&kept), ids(&local));
    assert_eq!(get(&f.remote).await.total_pages(), 2);
}

#[tokio::test]
async fn invalid_secondary_copy_is_repaired() {
    let f = fixture();
    put(&f.primary, &doc_with(&[mark(0.0)], 1, 100)).await;
    f.remote.insert_raw(KEY, "{\"documentId\": 42");

    let report = SyncManager::new(f.store.clone()).sync_all().await;
    assert!(report.failed().next().is_none());
    assert_eq!(get(&f.remote).await, get(&f.primary).await);
}

#[tokio::test(start_paused = true)]
async fn periodic_sync_runs_until_shut_down() {
    let f = fixture();
    put(&f.primary, &doc_with(&[mark(0.0)], 1, 100)).await;
    let manager = Arc::new(SyncManager::new(f.store.clone()));

    let handle = manager.spawn_periodic(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(f.remote.load(KEY).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(f.remote.load(KEY).await.unwrap().is_some());

    handle.shutdown().await;
}
