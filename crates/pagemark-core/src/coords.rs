//! Coordinate transforms between document space and viewport space.
//!
//! Document space is the fixed frame of the annotated page (bottom-left origin,
//! y grows upward). Viewport space is the on-screen pixel frame (top-left origin,
//! y grows downward) and changes with every zoom or pan. Annotations are always
//! stored in document space.

use kurbo::{Point, Rect, Vec2};
use serde::{Deserialize, Serialize};

/// Padding added around annotation bounds before placing selection handles.
pub const BOUNDS_PADDING: f64 = 5.0;

/// A point in document space, optionally carrying stylus pressure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DocPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
}

impl DocPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, pressure: None }
    }

    pub fn with_pressure(x: f64, y: f64, pressure: f64) -> Self {
        Self {
            x,
            y,
            pressure: Some(pressure),
        }
    }

    /// Same pressure, new position.
    pub fn moved_to(self, point: Point) -> Self {
        Self {
            x: point.x,
            y: point.y,
            pressure: self.pressure,
        }
    }

    pub fn to_kurbo(self) -> Point {
        Point::new(self.x, self.y)
    }
}

impl From<Point> for DocPoint {
    fn from(point: Point) -> Self {
        Self::new(point.x, point.y)
    }
}

/// Page dimensions in document units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// US Letter in points.
    pub fn letter() -> Self {
        Self::new(612.0, 792.0)
    }

    /// A4 in points.
    pub fn a4() -> Self {
        Self::new(595.0, 842.0)
    }
}

/// The current viewport mapping for one page.
///
/// Viewport dimensions already include the zoom, so `scale` is informational
/// and is never reapplied by the transforms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub doc_width: f64,
    pub doc_height: f64,
    pub viewport_width: f64,
    pub viewport_height: f64,
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl PageInfo {
    /// Build a mapping from document dimensions, a zoom fraction and pan offsets.
    pub fn new(doc_width: f64, doc_height: f64, zoom: f64, offset_x: f64, offset_y: f64) -> Self {
        Self {
            doc_width,
            doc_height,
            viewport_width: doc_width * zoom,
            viewport_height: doc_height * zoom,
            scale: zoom,
            offset_x,
            offset_y,
        }
    }

    /// The unzoomed, unpanned mapping for a page.
    pub fn identity(size: PageSize) -> Self {
        Self::new(size.width, size.height, 1.0, 0.0, 0.0)
    }

    pub fn scale_x(&self) -> f64 {
        self.viewport_width / self.doc_width
    }

    pub fn scale_y(&self) -> f64 {
        self.viewport_height / self.doc_height
    }

    /// Whether the transforms are invertible for this mapping.
    pub fn is_valid(&self) -> bool {
        self.doc_width > 0.0
            && self.doc_height > 0.0
            && self.viewport_width > 0.0
            && self.viewport_height > 0.0
            && self.scale > 0.0
    }

    pub fn page_size(&self) -> PageSize {
        PageSize::new(self.doc_width, self.doc_height)
    }
}

/// Axis-aligned bounds in document space. `y` is the bottom edge.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// The top edge; document space grows upward.
    pub fn top(&self) -> f64 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.right(), self.top())
    }
}

impl From<Rect> for Bounds {
    fn from(rect: Rect) -> Self {
        let rect = rect.abs();
        Self::new(rect.x0, rect.y0, rect.width(), rect.height())
    }
}

/// Map a document-space point into viewport space.
pub fn to_viewport(point: DocPoint, info: &PageInfo) -> DocPoint {
    let x = point.x * info.scale_x() + info.offset_x;
    let y = (info.doc_height - point.y) * info.scale_y() + info.offset_y;
    point.moved_to(Point::new(x, y))
}

/// Map a viewport-space point back into document space.
pub fn to_document(point: DocPoint, info: &PageInfo) -> DocPoint {
    let x = (point.x - info.offset_x) / info.scale_x();
    let y = info.doc_height - (point.y - info.offset_y) / info.scale_y();
    point.moved_to(Point::new(x, y))
}

/// Map document-space bounds into a viewport-space rectangle (top-left origin).
pub fn bounds_to_viewport(bounds: &Bounds, info: &PageInfo) -> Rect {
    let top_left = to_viewport(DocPoint::new(bounds.x, bounds.top()), info);
    let bottom_right = to_viewport(DocPoint::new(bounds.right(), bounds.y), info);
    Rect::new(top_left.x, top_left.y, bottom_right.x, bottom_right.y)
}

/// Euclidean distance.
pub fn distance(a: DocPoint, b: DocPoint) -> f64 {
    a.to_kurbo().distance(b.to_kurbo())
}

/// Distance from a point to the segment `a`-`b`.
///
/// A degenerate segment (`a == b`) reduces to point distance.
pub fn distance_to_segment(point: DocPoint, a: DocPoint, b: DocPoint) -> f64 {
    let seg = Vec2::new(b.x - a.x, b.y - a.y);
    let pv = Vec2::new(point.x - a.x, point.y - a.y);
    let len_sq = seg.hypot2();
    if len_sq < f64::EPSILON {
        return pv.hypot();
    }
    let t = (pv.dot(seg) / len_sq).clamp(0.0, 1.0);
    let proj = a.to_kurbo() + seg * t;
    point.to_kurbo().distance(proj)
}

/// Minimum distance from a point to a polyline.
///
/// A single-point polyline is treated as a degenerate segment.
pub fn distance_to_polyline(point: DocPoint, points: &[DocPoint]) -> f64 {
    match points {
        [] => f64::INFINITY,
        [only] => distance(point, *only),
        _ => points
            .windows(2)
            .map(|w| distance_to_segment(point, w[0], w[1]))
            .fold(f64::INFINITY, f64::min),
    }
}

/// Min/max bounds over a point set. Empty input yields zero bounds at the origin.
pub fn calculate_bounds(points: &[DocPoint]) -> Bounds {
    let Some(first) = points.first() else {
        return Bounds::default();
    };
    let mut rect = Rect::from_points(first.to_kurbo(), first.to_kurbo());
    for p in &points[1..] {
        rect = rect.union_pt(p.to_kurbo());
    }
    Bounds::from(rect)
}

/// Grow bounds by `padding` on every side.
pub fn pad_bounds(bounds: &Bounds, padding: f64) -> Bounds {
    Bounds::from(bounds.to_rect().inflate(padding, padding))
}

/// Whether `point` lies within `bounds` expanded by `tolerance` on all sides.
pub fn is_point_in_bounds(point: DocPoint, bounds: &Bounds, tolerance: f64) -> bool {
    point.x >= bounds.x - tolerance
        && point.x <= bounds.right() + tolerance
        && point.y >= bounds.y - tolerance
        && point.y <= bounds.top() + tolerance
}
