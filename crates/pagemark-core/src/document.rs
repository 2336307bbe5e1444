//! The persisted, page-indexed annotation document.

use crate::annotation::{Annotation, AnnotationId, now_millis};
use crate::coords::PageSize;
use crate::error::{AnnotationError, AnnotationResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current persisted schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Fields every persisted document must carry.
const REQUIRED_FIELDS: [&str; 5] = [
    "documentId",
    "schemaVersion",
    "annotations",
    "created",
    "lastModified",
];

/// Annotations belonging to one page. Page numbers start at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPage {
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<PageSize>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl AnnotationPage {
    pub fn new(page_number: u32) -> Self {
        Self {
            page_number,
            page_size: None,
            annotations: Vec::new(),
        }
    }

    pub fn position(&self, id: AnnotationId) -> Option<usize> {
        self.annotations.iter().position(|a| a.id == id)
    }
}

/// Descriptive metadata about the annotated source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Where the source document lives (path or URL).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Device that wrote the last committed version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl DocumentMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

/// All annotations for one source document.
///
/// The page array has a fixed length set at creation. `version` increases by
/// one on every committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDocument {
    pub document_id: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    pub annotations: Vec<AnnotationPage>,
    pub created: u64,
    pub last_modified: u64,
    pub schema_version: u32,
    #[serde(default)]
    pub version: u64,
}

impl AnnotationDocument {
    /// Create a document with `total_pages` empty pages.
    pub fn new(document_id: impl Into<String>, total_pages: u32, metadata: DocumentMetadata) -> Self {
        let now = now_millis();
        Self {
            document_id: document_id.into(),
            metadata,
            annotations: (1..=total_pages).map(AnnotationPage::new).collect(),
            created: now,
            last_modified: now,
            schema_version: SCHEMA_VERSION,
            version: 0,
        }
    }

    /// Deserialize and validate a persisted document.
    pub fn from_value(value: Value) -> AnnotationResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| AnnotationError::Validation("document is not an object".to_string()))?;
        if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !object.contains_key(**f)) {
            return Err(AnnotationError::Validation(format!("missing field {}", missing)));
        }

        let doc: Self = serde_json::from_value(value)
            .map_err(|e| AnnotationError::Validation(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Parse and validate a JSON string.
    pub fn from_json(json: &str) -> AnnotationResult<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    fn validate(&self) -> AnnotationResult<()> {
        if self.document_id.is_empty() {
            return Err(AnnotationError::Validation("empty documentId".to_string()));
        }
        if self.schema_version == 0 || self.schema_version > SCHEMA_VERSION {
            return Err(AnnotationError::Validation(format!(
                "unsupported schema version {}",
                self.schema_version
            )));
        }
        for (index, page) in self.annotations.iter().enumerate() {
            if page.page_number as usize != index + 1 {
                return Err(AnnotationError::Validation(format!(
                    "page at index {} is numbered {}",
                    index, page.page_number
                )));
            }
        }
        Ok(())
    }

    pub fn to_value(&self) -> AnnotationResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn total_pages(&self) -> u32 {
        self.annotations.len() as u32
    }

    fn page_index(&self, page_number: u32) -> AnnotationResult<usize> {
        if page_number == 0 || page_number > self.total_pages() {
            return Err(AnnotationError::InvalidPage {
                page: page_number,
                total: self.total_pages(),
            });
        }
        Ok(page_number as usize - 1)
    }

    pub fn page(&self, page_number: u32) -> AnnotationResult<&AnnotationPage> {
        let index = self.page_index(page_number)?;
        Ok(&self.annotations[index])
    }

    pub fn page_mut(&mut self, page_number: u32) -> AnnotationResult<&mut AnnotationPage> {
        let index = self.page_index(page_number)?;
        Ok(&mut self.annotations[index])
    }

    /// Locate an annotation anywhere in the document.
    pub fn find(&self, id: AnnotationId) -> Option<(u32, &Annotation)> {
        self.annotations.iter().find_map(|page| {
            page.annotations
                .iter()
                .find(|a| a.id == id)
                .map(|a| (page.page_number, a))
        })
    }

    pub fn annotation_count(&self) -> usize {
        self.annotations.iter().map(|p| p.annotations.len()).sum()
    }

    /// Record a committed mutation.
    pub(crate) fn stamp(&mut self, device_id: &str, user_id: Option<&str>) {
        self.version += 1;
        self.last_modified = now_millis().max(self.last_modified);
        self.metadata.device_id = Some(device_id.to_string());
        if let Some(user_id) = user_id {
            self.metadata.user_id = Some(user_id.to_string());
        }
    }
}
