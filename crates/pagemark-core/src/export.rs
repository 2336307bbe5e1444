//! Annotation feed for the document export pipeline.
//!
//! The exporter burns annotations into the output file. It receives every
//! coordinate already in document space together with the unzoomed page
//! mapping, so it never re-derives viewport transforms.

use crate::annotation::Annotation;
use crate::coords::PageInfo;
use crate::document::AnnotationDocument;
use serde::{Deserialize, Serialize};

/// Annotations for one page, ready for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageExport {
    pub page_number: u32,
    /// Identity mapping for the page, if its size is known.
    pub page_info: Option<PageInfo>,
    pub annotations: Vec<Annotation>,
}

/// Build the export feed for every page that has annotations.
pub fn export_pages(doc: &AnnotationDocument) -> Vec<PageExport> {
    doc.annotations
        .iter()
        .filter(|page| !page.annotations.is_empty())
        .map(|page| PageExport {
            page_number: page.page_number,
            page_info: page.page_size.map(PageInfo::identity),
            annotations: page.annotations.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::{DocPoint, PageSize};
    use crate::document::DocumentMetadata;

    #[test]
    fn test_export_skips_empty_pages() {
        let mut doc = AnnotationDocument::new("doc", 4, DocumentMetadata::default());
        doc.page_mut(2).unwrap().page_size = Some(PageSize::a4());
        doc.page_mut(2)
            .unwrap()
            .annotations
            .push(Annotation::text(DocPoint::new(10.0, 800.0), "note", 12.0));
        doc.page_mut(4)
            .unwrap()
            .annotations
            .push(Annotation::line(DocPoint::new(0.0, 0.0), DocPoint::new(5.0, 5.0), 1.0));

        let pages = export_pages(&doc);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_number, 2);
        let info = pages[0].page_info.unwrap();
        assert_eq!(info.viewport_height, info.doc_height);
        assert_eq!(pages[0].annotations[0].coordinates[0], DocPoint::new(10.0, 800.0));
        assert!(pages[1].page_info.is_none());
    }
}
