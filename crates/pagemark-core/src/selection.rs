//! Hit-testing, selection handles and move/resize/rotate geometry.

use crate::annotation::{Annotation, AnnotationKind};
use crate::coords::{
    BOUNDS_PADDING, Bounds, DocPoint, calculate_bounds, distance, distance_to_polyline,
    distance_to_segment, is_point_in_bounds, pad_bounds,
};
use crate::error::{AnnotationError, AnnotationResult};
use kurbo::{Affine, Vec2};
use serde::{Deserialize, Serialize};

/// Minimum hit tolerance around freehand strokes.
pub const FREEHAND_HIT_TOLERANCE: f64 = 15.0;
/// Minimum hit tolerance around rectangle and circle outlines.
pub const SHAPE_EDGE_TOLERANCE: f64 = 3.0;
/// Minimum hit tolerance around lines and arrows.
pub const LINE_HIT_TOLERANCE: f64 = 8.0;
/// Padding around the approximate text glyph box.
pub const TEXT_HIT_PADDING: f64 = 5.0;
/// Approximate glyph advance as a fraction of font size.
pub const TEXT_CHAR_WIDTH: f64 = 0.6;
/// Line height as a multiple of font size.
pub const TEXT_LINE_HEIGHT: f64 = 1.2;
/// Distance of the delete handle outside the top-right corner.
pub const DELETE_HANDLE_OFFSET: f64 = 15.0;
/// Distance of the rotation handle above the top edge.
pub const ROTATE_HANDLE_OFFSET: f64 = 25.0;
/// Handle hit radius in document units.
pub const HANDLE_HIT_TOLERANCE: f64 = 8.0;
/// Smallest extent a resize may collapse an annotation to.
pub const MIN_RESIZE_EXTENT: f64 = 1.0;

/// Identity of a selection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleId {
    TopLeft,
    Top,
    TopRight,
    Right,
    BottomRight,
    Bottom,
    BottomLeft,
    Left,
    Delete,
    Rotate,
}

impl HandleId {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleId::TopLeft => "top-left",
            HandleId::Top => "top",
            HandleId::TopRight => "top-right",
            HandleId::Right => "right",
            HandleId::BottomRight => "bottom-right",
            HandleId::Bottom => "bottom",
            HandleId::BottomLeft => "bottom-left",
            HandleId::Left => "left",
            HandleId::Delete => "delete",
            HandleId::Rotate => "rotate",
        }
    }

    fn moves_left(self) -> bool {
        matches!(self, HandleId::TopLeft | HandleId::Left | HandleId::BottomLeft)
    }

    fn moves_right(self) -> bool {
        matches!(self, HandleId::TopRight | HandleId::Right | HandleId::BottomRight)
    }

    fn moves_top(self) -> bool {
        matches!(self, HandleId::TopLeft | HandleId::Top | HandleId::TopRight)
    }

    fn moves_bottom(self) -> bool {
        matches!(self, HandleId::BottomLeft | HandleId::Bottom | HandleId::BottomRight)
    }
}

/// What dragging a handle does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Corner,
    Edge,
    Delete,
    Rotate,
}

/// Cursor shown while hovering a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CursorHint {
    NwseResize,
    NeswResize,
    NsResize,
    EwResize,
    Pointer,
    Grab,
}

/// A selection handle, positioned in document space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionHandle {
    pub id: HandleId,
    pub kind: HandleKind,
    pub position: DocPoint,
    pub cursor: CursorHint,
}

impl SelectionHandle {
    fn new(id: HandleId, kind: HandleKind, x: f64, y: f64, cursor: CursorHint) -> Self {
        Self {
            id,
            kind,
            position: DocPoint::new(x, y),
            cursor,
        }
    }

    /// Check if a point (document space) hits this handle.
    pub fn hit_test(&self, point: DocPoint, tolerance: f64) -> bool {
        distance(point, self.position) <= tolerance
    }
}

/// Approximate glyph box of a text annotation, anchored at its baseline-left.
fn text_box(anchor: DocPoint, text: &str, font_size: f64) -> Bounds {
    let chars = text.chars().count() as f64;
    let width = (chars * font_size * TEXT_CHAR_WIDTH).max(font_size * 2.0);
    let height = font_size * TEXT_LINE_HEIGHT;
    Bounds::new(anchor.x, anchor.y, width, height)
}

/// Unpadded bounds of an annotation in document space.
pub fn annotation_bounds(annotation: &Annotation) -> Bounds {
    match (&annotation.kind, annotation.coordinates.first()) {
        (AnnotationKind::Text(t), Some(anchor)) => text_box(*anchor, &t.text, t.font_size),
        _ => calculate_bounds(&annotation.coordinates),
    }
}

/// Check if a point (document space) hits an annotation.
pub fn hit_test_annotation(annotation: &Annotation, point: DocPoint) -> bool {
    let coords = &annotation.coordinates;
    if coords.is_empty() {
        return false;
    }
    match &annotation.kind {
        AnnotationKind::Pen(p) | AnnotationKind::Highlighter(p) => {
            distance_to_polyline(point, coords) <= p.stroke_width.max(FREEHAND_HIT_TOLERANCE)
        }
        AnnotationKind::Rectangle(s) => {
            let tolerance = (s.stroke_width / 2.0).max(SHAPE_EDGE_TOLERANCE);
            is_point_in_bounds(point, &calculate_bounds(coords), tolerance)
        }
        AnnotationKind::Circle(s) => {
            let bounds = calculate_bounds(coords);
            let radius = bounds.width.max(bounds.height) / 2.0;
            let tolerance = (s.stroke_width / 2.0).max(SHAPE_EDGE_TOLERANCE);
            point.to_kurbo().distance(bounds.center()) <= radius + tolerance
        }
        AnnotationKind::Text(t) => {
            is_point_in_bounds(point, &text_box(coords[0], &t.text, t.font_size), TEXT_HIT_PADDING)
        }
        AnnotationKind::Line(s) => segment_hit(coords, point, s.stroke_width),
        AnnotationKind::Arrow(a) => segment_hit(coords, point, a.stroke_width),
    }
}

fn segment_hit(coords: &[DocPoint], point: DocPoint, stroke_width: f64) -> bool {
    let tolerance = stroke_width.max(LINE_HIT_TOLERANCE);
    match coords {
        [start, .., end] => distance_to_segment(point, *start, *end) <= tolerance,
        [only] => distance(point, *only) <= tolerance,
        [] => false,
    }
}

/// Find the topmost annotation under a point.
///
/// Later annotations are drawn over earlier ones, so the scan runs in reverse.
pub fn find_annotation_at_point(point: DocPoint, annotations: &[Annotation]) -> Option<&Annotation> {
    annotations
        .iter()
        .rev()
        .find(|annotation| hit_test_annotation(annotation, point))
}

/// Build the selection handles around an annotation's padded bounds.
///
/// Every annotation gets four corner handles, four edge handles and a delete
/// handle. Rotatable types also get a rotation handle above the top edge.
pub fn generate_selection_handles(annotation: &Annotation) -> Vec<SelectionHandle> {
    let b = pad_bounds(&annotation_bounds(annotation), BOUNDS_PADDING);
    let (left, right, bottom, top) = (b.x, b.right(), b.y, b.top());
    let center = b.center();

    let mut handles = vec![
        SelectionHandle::new(HandleId::TopLeft, HandleKind::Corner, left, top, CursorHint::NwseResize),
        SelectionHandle::new(HandleId::TopRight, HandleKind::Corner, right, top, CursorHint::NeswResize),
        SelectionHandle::new(HandleId::BottomRight, HandleKind::Corner, right, bottom, CursorHint::NwseResize),
        SelectionHandle::new(HandleId::BottomLeft, HandleKind::Corner, left, bottom, CursorHint::NeswResize),
        SelectionHandle::new(HandleId::Top, HandleKind::Edge, center.x, top, CursorHint::NsResize),
        SelectionHandle::new(HandleId::Right, HandleKind::Edge, right, center.y, CursorHint::EwResize),
        SelectionHandle::new(HandleId::Bottom, HandleKind::Edge, center.x, bottom, CursorHint::NsResize),
        SelectionHandle::new(HandleId::Left, HandleKind::Edge, left, center.y, CursorHint::EwResize),
        SelectionHandle::new(
            HandleId::Delete,
            HandleKind::Delete,
            right + DELETE_HANDLE_OFFSET,
            top + DELETE_HANDLE_OFFSET,
            CursorHint::Pointer,
        ),
    ];

    if annotation.capabilities().rotatable {
        handles.push(SelectionHandle::new(
            HandleId::Rotate,
            HandleKind::Rotate,
            center.x,
            top + ROTATE_HANDLE_OFFSET,
            CursorHint::Grab,
        ));
    }
    handles
}

/// Find which handle (if any) is under a point. Later handles win.
pub fn hit_test_handles(
    handles: &[SelectionHandle],
    point: DocPoint,
    tolerance: f64,
) -> Option<&SelectionHandle> {
    handles.iter().rev().find(|h| h.hit_test(point, tolerance))
}

fn axis_scale(new_extent: f64, old_extent: f64) -> f64 {
    if old_extent.abs() < f64::EPSILON {
        1.0
    } else {
        new_extent / old_extent
    }
}

/// Resize an annotation by dragging one of its handles to `new_pos`.
///
/// `original_bounds` are the unpadded bounds at drag start; `new_pos` is where
/// the handle itself now sits, so dropping a handle where it was generated is
/// the identity. Each coordinate is mapped by
/// `p' = (p - anchor) * scale + anchor + offset`, with the anchor at the
/// bottom-left of the original bounds.
pub fn resize_annotation(
    annotation: &Annotation,
    handle: HandleId,
    new_pos: DocPoint,
    original_bounds: &Bounds,
) -> AnnotationResult<Annotation> {
    if matches!(handle, HandleId::Delete | HandleId::Rotate) {
        return Err(AnnotationError::InvalidOperation(format!(
            "{} handle does not resize",
            handle.as_str()
        )));
    }
    if !annotation.capabilities().resizable {
        return Err(AnnotationError::InvalidOperation(format!(
            "{:?} annotations cannot be resized",
            annotation.annotation_type()
        )));
    }

    let ob = original_bounds;
    let mut scale = Vec2::new(1.0, 1.0);
    let mut offset = Vec2::ZERO;

    if handle.moves_left() {
        let new_left = (new_pos.x + BOUNDS_PADDING).min(ob.right() - MIN_RESIZE_EXTENT);
        scale.x = axis_scale(ob.right() - new_left, ob.width);
        if ob.width.abs() >= f64::EPSILON {
            offset.x = new_left - ob.x;
        }
    } else if handle.moves_right() {
        let new_right = (new_pos.x - BOUNDS_PADDING).max(ob.x + MIN_RESIZE_EXTENT);
        scale.x = axis_scale(new_right - ob.x, ob.width);
    }

    if handle.moves_top() {
        let new_top = (new_pos.y - BOUNDS_PADDING).max(ob.y + MIN_RESIZE_EXTENT);
        scale.y = axis_scale(new_top - ob.y, ob.height);
    } else if handle.moves_bottom() {
        let new_bottom = (new_pos.y + BOUNDS_PADDING).min(ob.top() - MIN_RESIZE_EXTENT);
        scale.y = axis_scale(ob.top() - new_bottom, ob.height);
        if ob.height.abs() >= f64::EPSILON {
            offset.y = new_bottom - ob.y;
        }
    }

    let anchor = Vec2::new(ob.x, ob.y);
    let affine = Affine::translate(anchor + offset)
        * Affine::scale_non_uniform(scale.x, scale.y)
        * Affine::translate(-anchor);

    let mut resized = annotation.clone();
    resized.map_points(|p| p.moved_to(affine * p.to_kurbo()));
    if let AnnotationKind::Text(t) = &mut resized.kind {
        t.font_size = (t.font_size * scale.y).max(MIN_RESIZE_EXTENT);
    }
    Ok(resized)
}

/// Translate every coordinate by a delta.
pub fn move_annotation(annotation: &Annotation, dx: f64, dy: f64) -> Annotation {
    let translation = Affine::translate((dx, dy));
    let mut moved = annotation.clone();
    moved.map_points(|p| p.moved_to(translation * p.to_kurbo()));
    moved
}

/// Rotate a line or arrow about the center of its bounds.
pub fn rotate_annotation(annotation: &Annotation, radians: f64) -> AnnotationResult<Annotation> {
    if !annotation.capabilities().rotatable {
        return Err(AnnotationError::InvalidOperation(format!(
            "{:?} annotations cannot be rotated",
            annotation.annotation_type()
        )));
    }
    let center = annotation_bounds(annotation).center();
    let affine = Affine::rotate_about(radians, center);
    let mut rotated = annotation.clone();
    rotated.map_points(|p| p.moved_to(affine * p.to_kurbo()));
    Ok(rotated)
}

/// Angle of the pointer around the annotation center, measured from straight up.
pub fn rotation_angle(annotation: &Annotation, pointer: DocPoint) -> f64 {
    let center = annotation_bounds(annotation).center();
    let v = pointer.to_kurbo() - center;
    v.x.atan2(v.y)
}

/// An in-progress drag on a selected annotation.
#[derive(Debug, Clone)]
pub struct DragState {
    /// The handle being dragged (None = moving the whole annotation).
    pub handle: Option<HandleId>,
    /// Where the drag started, in document space.
    pub start_point: DocPoint,
    /// The annotation as it was when the drag started.
    pub original: Annotation,
    /// Bounds of `original`.
    pub original_bounds: Bounds,
}

impl DragState {
    pub fn new(original: Annotation, handle: Option<HandleId>, start_point: DocPoint) -> Self {
        let original_bounds = annotation_bounds(&original);
        Self {
            handle,
            start_point,
            original,
            original_bounds,
        }
    }

    /// The annotation as it would look with the pointer at `current`.
    pub fn preview(&self, current: DocPoint) -> AnnotationResult<Annotation> {
        match self.handle {
            None => Ok(move_annotation(
                &self.original,
                current.x - self.start_point.x,
                current.y - self.start_point.y,
            )),
            Some(HandleId::Rotate) => {
                let start = rotation_angle(&self.original, self.start_point);
                let now = rotation_angle(&self.original, current);
                // Clockwise on screen is negative in a y-up frame.
                rotate_annotation(&self.original, start - now)
            }
            Some(handle) => resize_annotation(&self.original, handle, current, &self.original_bounds),
        }
    }
}
