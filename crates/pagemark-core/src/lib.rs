//! Pagemark Core Library
//!
//! Annotation geometry, persistence and multi-provider sync for paginated
//! documents. Coordinates are stored in document space and mapped to the
//! viewport on demand.

pub mod annotation;
pub mod cache;
pub mod config;
pub mod coords;
pub mod document;
pub mod error;
pub mod export;
pub mod selection;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;

pub use annotation::{Annotation, AnnotationId, AnnotationKind, AnnotationType, Capabilities, Color};
pub use cache::{AnnotationCache, CacheStats, CachedAnnotation};
pub use config::{AnnotatorConfig, CacheConfig, SyncConfig};
pub use coords::{Bounds, DocPoint, PageInfo, PageSize, to_document, to_viewport};
pub use document::{AnnotationDocument, AnnotationPage, DocumentMetadata};
pub use error::{AnnotationError, AnnotationResult};
pub use export::PageExport;
pub use selection::{DragState, HandleId, HandleKind, SelectionHandle, find_annotation_at_point};
pub use session::AnnotationSession;
pub use storage::{FileProvider, MemoryProvider, Provider, ProviderError, ProviderSet};
pub use store::DocumentStore;
pub use sync::{ConflictStrategy, Resolution, SyncConflict, SyncHandle, SyncManager, SyncReport};
