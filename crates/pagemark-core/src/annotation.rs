//! Annotation data model.
//!
//! Every annotation kind carries only the properties relevant to it. Editing
//! capabilities are a fixed table keyed on [`AnnotationType`].

use crate::coords::{DocPoint, distance_to_segment};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for annotations.
pub type AnnotationId = Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn red() -> Self {
        Self::new(220, 38, 38, 255)
    }

    pub fn highlight_yellow() -> Self {
        Self::new(250, 204, 21, 255)
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::black()
    }
}

/// Properties of freehand strokes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeProps {
    pub stroke_width: f64,
    /// Full-resolution path, kept when `coordinates` has been simplified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<DocPoint>>,
}

/// Properties of outlined shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeProps {
    pub stroke_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<Color>,
}

/// Properties of arrows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrowProps {
    pub stroke_width: f64,
    pub head_size: f64,
}

/// Properties of text annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextProps {
    pub text: String,
    pub font_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
}

/// Annotation kind with its type-specific properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnnotationKind {
    Pen(StrokeProps),
    Highlighter(StrokeProps),
    Rectangle(ShapeProps),
    Circle(ShapeProps),
    Line(ShapeProps),
    Arrow(ArrowProps),
    Text(TextProps),
}

/// The bare variant tag of an [`AnnotationKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationType {
    Pen,
    Highlighter,
    Rectangle,
    Circle,
    Line,
    Arrow,
    Text,
}

/// What an annotation type allows the user to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub movable: bool,
    pub resizable: bool,
    pub rotatable: bool,
    pub text_editable: bool,
    pub stroke_editable: bool,
}

const FREEHAND_CAPS: Capabilities = Capabilities {
    movable: true,
    resizable: true,
    rotatable: false,
    text_editable: false,
    stroke_editable: true,
};

// Boxes are stored as two axis-aligned corners, so only segments can turn.
const BOX_CAPS: Capabilities = Capabilities {
    movable: true,
    resizable: true,
    rotatable: false,
    text_editable: false,
    stroke_editable: true,
};

const SEGMENT_CAPS: Capabilities = Capabilities {
    rotatable: true,
    ..BOX_CAPS
};

const TEXT_CAPS: Capabilities = Capabilities {
    movable: true,
    resizable: true,
    rotatable: false,
    text_editable: true,
    stroke_editable: false,
};

impl AnnotationType {
    pub const ALL: [AnnotationType; 7] = [
        AnnotationType::Pen,
        AnnotationType::Highlighter,
        AnnotationType::Rectangle,
        AnnotationType::Circle,
        AnnotationType::Line,
        AnnotationType::Arrow,
        AnnotationType::Text,
    ];

    pub fn capabilities(self) -> Capabilities {
        match self {
            AnnotationType::Pen | AnnotationType::Highlighter => FREEHAND_CAPS,
            AnnotationType::Rectangle | AnnotationType::Circle => BOX_CAPS,
            AnnotationType::Line | AnnotationType::Arrow => SEGMENT_CAPS,
            AnnotationType::Text => TEXT_CAPS,
        }
    }

    /// Freehand types draw a stroke through every coordinate.
    pub fn is_freehand(self) -> bool {
        matches!(self, AnnotationType::Pen | AnnotationType::Highlighter)
    }

    pub fn is_shape(self) -> bool {
        matches!(
            self,
            AnnotationType::Rectangle
                | AnnotationType::Circle
                | AnnotationType::Line
                | AnnotationType::Arrow
        )
    }
}

impl AnnotationKind {
    pub fn annotation_type(&self) -> AnnotationType {
        match self {
            AnnotationKind::Pen(_) => AnnotationType::Pen,
            AnnotationKind::Highlighter(_) => AnnotationType::Highlighter,
            AnnotationKind::Rectangle(_) => AnnotationType::Rectangle,
            AnnotationKind::Circle(_) => AnnotationType::Circle,
            AnnotationKind::Line(_) => AnnotationType::Line,
            AnnotationKind::Arrow(_) => AnnotationType::Arrow,
            AnnotationKind::Text(_) => AnnotationType::Text,
        }
    }

    /// Stroke width, if this kind is stroked.
    pub fn stroke_width(&self) -> Option<f64> {
        match self {
            AnnotationKind::Pen(p) | AnnotationKind::Highlighter(p) => Some(p.stroke_width),
            AnnotationKind::Rectangle(s) | AnnotationKind::Circle(s) | AnnotationKind::Line(s) => {
                Some(s.stroke_width)
            }
            AnnotationKind::Arrow(a) => Some(a.stroke_width),
            AnnotationKind::Text(_) => None,
        }
    }
}

/// A single annotation. Coordinates are always in document space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: AnnotationId,
    #[serde(flatten)]
    pub kind: AnnotationKind,
    pub coordinates: Vec<DocPoint>,
    #[serde(default)]
    pub color: Color,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    pub timestamp: u64,
    pub last_modified: u64,
}

fn default_opacity() -> f64 {
    1.0
}

impl Annotation {
    /// Create an annotation with a fresh id, stamped now.
    pub fn new(kind: AnnotationKind, coordinates: Vec<DocPoint>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            kind,
            coordinates,
            color: Color::default(),
            opacity: 1.0,
            timestamp: now,
            last_modified: now,
        }
    }

    pub fn pen(points: Vec<DocPoint>, stroke_width: f64) -> Self {
        Self::new(
            AnnotationKind::Pen(StrokeProps {
                stroke_width,
                path: None,
            }),
            points,
        )
    }

    pub fn highlighter(points: Vec<DocPoint>, stroke_width: f64) -> Self {
        let mut annotation = Self::new(
            AnnotationKind::Highlighter(StrokeProps {
                stroke_width,
                path: None,
            }),
            points,
        );
        annotation.color = Color::highlight_yellow();
        annotation.opacity = 0.4;
        annotation
    }

    pub fn rectangle(a: DocPoint, b: DocPoint, stroke_width: f64) -> Self {
        Self::new(
            AnnotationKind::Rectangle(ShapeProps {
                stroke_width,
                fill: None,
            }),
            vec![a, b],
        )
    }

    /// A circle centered in the box spanned by `a` and `b`, with a radius of
    /// half the box's larger side.
    pub fn circle(a: DocPoint, b: DocPoint, stroke_width: f64) -> Self {
        Self::new(
            AnnotationKind::Circle(ShapeProps {
                stroke_width,
                fill: None,
            }),
            vec![a, b],
        )
    }

    pub fn line(start: DocPoint, end: DocPoint, stroke_width: f64) -> Self {
        Self::new(
            AnnotationKind::Line(ShapeProps {
                stroke_width,
                fill: None,
            }),
            vec![start, end],
        )
    }

    pub fn arrow(start: DocPoint, end: DocPoint, stroke_width: f64) -> Self {
        Self::new(
            AnnotationKind::Arrow(ArrowProps {
                stroke_width,
                head_size: stroke_width * 4.0,
            }),
            vec![start, end],
        )
    }

    /// A text annotation anchored at its baseline-left corner.
    pub fn text(anchor: DocPoint, text: impl Into<String>, font_size: f64) -> Self {
        Self::new(
            AnnotationKind::Text(TextProps {
                text: text.into(),
                font_size,
                font_family: None,
            }),
            vec![anchor],
        )
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn annotation_type(&self) -> AnnotationType {
        self.kind.annotation_type()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.annotation_type().capabilities()
    }

    /// Stamp `last_modified` with the current time.
    pub fn touch(&mut self) {
        self.last_modified = now_millis().max(self.last_modified);
    }

    /// Simplify a freehand stroke, keeping the raw points as the full path.
    ///
    /// Returns false for non-freehand annotations.
    pub fn simplify_stroke(&mut self, tolerance: f64) -> bool {
        let props = match &mut self.kind {
            AnnotationKind::Pen(p) | AnnotationKind::Highlighter(p) => p,
            _ => return false,
        };
        if self.coordinates.len() < 3 {
            return true;
        }
        if props.path.is_none() {
            props.path = Some(self.coordinates.clone());
        }
        self.coordinates = rdp_simplify(&self.coordinates, tolerance);
        true
    }

    /// Apply `f` to every stored point, including any full freehand path.
    pub(crate) fn map_points(&mut self, mut f: impl FnMut(DocPoint) -> DocPoint) {
        for p in &mut self.coordinates {
            *p = f(*p);
        }
        if let AnnotationKind::Pen(props) | AnnotationKind::Highlighter(props) = &mut self.kind {
            if let Some(path) = &mut props.path {
                for p in path.iter_mut() {
                    *p = f(*p);
                }
            }
        }
    }
}

/// Ramer-Douglas-Peucker line simplification.
fn rdp_simplify(points: &[DocPoint], tolerance: f64) -> Vec<DocPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let first = points[0];
    let last = points[points.len() - 1];

    let mut max_dist = 0.0;
    let mut max_index = 0;
    for (i, point) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let dist = distance_to_segment(*point, first, last);
        if dist > max_dist {
            max_dist = dist;
            max_index = i;
        }
    }

    if max_dist > tolerance {
        let mut left = rdp_simplify(&points[..=max_index], tolerance);
        let right = rdp_simplify(&points[max_index..], tolerance);
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_table() {
        assert!(!AnnotationType::Pen.capabilities().rotatable);
        assert!(!AnnotationType::Rectangle.capabilities().rotatable);
        assert!(!AnnotationType::Circle.capabilities().rotatable);
        assert!(AnnotationType::Line.capabilities().rotatable);
        assert!(AnnotationType::Arrow.capabilities().stroke_editable);
        assert!(AnnotationType::Text.capabilities().text_editable);
        assert!(!AnnotationType::Text.capabilities().stroke_editable);
        for ty in AnnotationType::ALL {
            assert!(ty.capabilities().movable);
            if ty.capabilities().rotatable {
                assert!(ty.is_shape());
            }
        }
    }

    #[test]
    fn test_serialized_shape_is_tagged() {
        let a = Annotation::text(DocPoint::new(10.0, 20.0), "Note", 12.0);
        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "Note");
        assert_eq!(value["fontSize"], 12.0);
        assert!(value.get("lastModified").is_some());

        let back: Annotation = serde_json::from_value(value).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_simplify_keeps_raw_path() {
        let raw: Vec<DocPoint> = (0..50).map(|i| DocPoint::new(i as f64, 0.0)).collect();
        let mut pen = Annotation::pen(raw.clone(), 2.0);
        assert!(pen.simplify_stroke(0.5));
        assert_eq!(pen.coordinates.len(), 2);
        match &pen.kind {
            AnnotationKind::Pen(p) => assert_eq!(p.path.as_deref(), Some(raw.as_slice())),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_simplify_rejects_shapes() {
        let mut rect = Annotation::rectangle(DocPoint::new(0.0, 0.0), DocPoint::new(1.0, 1.0), 1.0);
        assert!(!rect.simplify_stroke(1.0));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut a = Annotation::line(DocPoint::new(0.0, 0.0), DocPoint::new(1.0, 1.0), 1.0);
        a.last_modified = u64::MAX - 1;
        a.touch();
        assert_eq!(a.last_modified, u64::MAX - 1);
    }
}
