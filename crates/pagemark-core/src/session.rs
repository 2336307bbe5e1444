//! Flat, page-tagged view of a document used for sync comparison.
//!
//! A session is always derived from an [`AnnotationDocument`] and folded back
//! into one; it is never persisted on its own.

use crate::annotation::{Annotation, AnnotationId, now_millis};
use crate::document::AnnotationDocument;
use crate::error::{AnnotationError, AnnotationResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An annotation tagged with the page it lives on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnnotation {
    pub page_number: u32,
    pub annotation: Annotation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub created: u64,
    pub modified: u64,
    pub version: u64,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSession {
    pub id: String,
    pub document_id: String,
    pub annotations: Vec<SessionAnnotation>,
    pub metadata: SessionMetadata,
    pub checksum: String,
}

/// Hex blake3 digest of the canonical JSON of a page-tagged annotation list.
pub fn compute_checksum(annotations: &[SessionAnnotation]) -> String {
    let bytes = serde_json::to_vec(annotations).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

impl AnnotationSession {
    pub fn from_document(doc: &AnnotationDocument) -> Self {
        let annotations: Vec<SessionAnnotation> = doc
            .annotations
            .iter()
            .flat_map(|page| {
                page.annotations.iter().map(|annotation| SessionAnnotation {
                    page_number: page.page_number,
                    annotation: annotation.clone(),
                })
            })
            .collect();
        let checksum = compute_checksum(&annotations);
        Self {
            id: doc.document_id.clone(),
            document_id: doc.document_id.clone(),
            annotations,
            metadata: SessionMetadata {
                created: doc.created,
                modified: doc.last_modified,
                version: doc.version,
                device_id: doc.metadata.device_id.clone(),
                user_id: doc.metadata.user_id.clone(),
            },
            checksum,
        }
    }

    /// True if the stored checksum matches the annotation content.
    pub fn verify(&self) -> bool {
        self.checksum == compute_checksum(&self.annotations)
    }

    pub fn contains(&self, id: AnnotationId) -> bool {
        self.annotations.iter().any(|a| a.annotation.id == id)
    }
}

/// Union two sessions by annotation id.
///
/// Local copies win on id collision; remote-only annotations are appended in
/// their original order. The result's version is one past the larger input.
pub fn merge_sessions(local: &AnnotationSession, remote: &AnnotationSession) -> AnnotationSession {
    let local_ids: HashSet<AnnotationId> = local.annotations.iter().map(|a| a.annotation.id).collect();
    let mut annotations = local.annotations.clone();
    annotations.extend(
        remote
            .annotations
            .iter()
            .filter(|a| !local_ids.contains(&a.annotation.id))
            .cloned(),
    );
    let checksum = compute_checksum(&annotations);

    AnnotationSession {
        id: local.id.clone(),
        document_id: local.document_id.clone(),
        annotations,
        metadata: SessionMetadata {
            created: local.metadata.created.min(remote.metadata.created),
            modified: now_millis()
                .max(local.metadata.modified)
                .max(remote.metadata.modified),
            version: local.metadata.version.max(remote.metadata.version) + 1,
            device_id: local.metadata.device_id.clone(),
            user_id: local.metadata.user_id.clone(),
        },
        checksum,
    }
}

impl AnnotationDocument {
    /// Replace this document's annotations and version info with a session's.
    ///
    /// Page sizes, metadata title and source are kept. Fails without touching
    /// the document if the session references a page outside it.
    pub fn apply_session(&mut self, session: &AnnotationSession) -> AnnotationResult<()> {
        if session.document_id != self.document_id {
            return Err(AnnotationError::InvalidOperation(format!(
                "session for {} applied to {}",
                session.document_id, self.document_id
            )));
        }
        let total = self.total_pages();
        if let Some(bad) = session
            .annotations
            .iter()
            .find(|a| a.page_number == 0 || a.page_number > total)
        {
            return Err(AnnotationError::InvalidPage {
                page: bad.page_number,
                total,
            });
        }

        for page in &mut self.annotations {
            page.annotations.clear();
        }
        for tagged in &session.annotations {
            self.page_mut(tagged.page_number)?
                .annotations
                .push(tagged.annotation.clone());
        }
        self.version = session.metadata.version;
        self.last_modified = session.metadata.modified;
        self.metadata.device_id = session.metadata.device_id.clone();
        self.metadata.user_id = session.metadata.user_id.clone();
        Ok(())
    }
}
