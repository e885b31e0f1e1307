//! Coordinate conventions.
//!
//! All continuous coordinates use the pixel-edge convention: raster cell
//! `(col, row)` covers `[col, col + 1) x [row, row + 1)` and its centre is
//! `(col + 0.5, row + 0.5)`. `x` grows to the right, `y` grows downwards.
//!
//! Named spaces a point can live in:
//! - native: MIMS pixels as acquired
//! - mirrored: native after the optional horizontal mirror
//! - coarse: canvas pixels after the similarity transform
//! - canvas: final canvas pixels after local deformation
//!
//! All of them share [`Point2D`]; conversions between them go through the
//! functions below or through [`TransformChain`](crate::TransformChain).

use glam::DVec2;
use serde::{Deserialize, Serialize};

pub type Point2D = DVec2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterIndex {
    pub row: usize,
    pub col: usize,
}

impl RasterIndex {
    #[inline]
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

#[inline]
pub fn pixel_center(idx: RasterIndex) -> Point2D {
    DVec2::new(idx.col as f64 + 0.5, idx.row as f64 + 0.5)
}

/// Signed `(col, row)` of the cell containing `p`.
#[inline]
pub fn containing_cell(p: Point2D) -> (i64, i64) {
    (p.x.floor() as i64, p.y.floor() as i64)
}

/// The single mirror rule: `x' = width - x`. Its own inverse, and equivalent
/// to flipping a `width`-wide raster left to right.
#[inline]
pub fn mirror_x(p: Point2D, width: f64) -> Point2D {
    DVec2::new(width - p.x, p.y)
}

/// Canvas point to the local frame of a patch whose top-left cell is `origin`.
#[inline]
pub fn canvas_to_local(p: Point2D, origin: (i64, i64)) -> Point2D {
    DVec2::new(p.x - origin.0 as f64, p.y - origin.1 as f64)
}

#[inline]
pub fn local_to_canvas(p: Point2D, origin: (i64, i64)) -> Point2D {
    DVec2::new(p.x + origin.0 as f64, p.y + origin.1 as f64)
}

/// The four corners of a `width x height` raster in continuous coordinates,
/// clockwise from the origin.
pub fn raster_corners(width: usize, height: usize) -> [Point2D; 4] {
    let (w, h) = (width as f64, height as f64);
    [
        DVec2::new(0.0, 0.0),
        DVec2::new(w, 0.0),
        DVec2::new(w, h),
        DVec2::new(0.0, h),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: usize,
    pub height: usize,
}

impl CanvasSize {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn bounds(&self) -> PixelBox {
        PixelBox::new(0, 0, self.width as i64, self.height as i64)
    }
}

/// Rounding noise tolerated before `floor`/`ceil` move a value to the next integer.
const SNAP_EPSILON: f64 = 1e-6;

#[inline]
fn snap(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < SNAP_EPSILON { r } else { v }
}

/// Half-open integer box `[x0, x1) x [y0, y1)` in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelBox {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

impl PixelBox {
    pub const fn new(x0: i64, y0: i64, x1: i64, y1: i64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Smallest box covering every point: `floor` of the minimum, `ceil` of the maximum.
    pub fn enclosing(points: &[Point2D]) -> Option<Self> {
        if points.is_empty() || points.iter().any(|p| !p.is_finite()) {
            return None;
        }
        let min = points.iter().copied().reduce(DVec2::min)?;
        let max = points.iter().copied().reduce(DVec2::max)?;
        Some(Self::new(
            snap(min.x).floor() as i64,
            snap(min.y).floor() as i64,
            snap(max.x).ceil() as i64,
            snap(max.y).ceil() as i64,
        ))
    }

    #[inline]
    pub fn width(&self) -> i64 {
        (self.x1 - self.x0).max(0)
    }

    #[inline]
    pub fn height(&self) -> i64 {
        (self.y1 - self.y0).max(0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    pub fn intersect(&self, other: &PixelBox) -> PixelBox {
        PixelBox::new(
            self.x0.max(other.x0),
            self.y0.max(other.y0),
            self.x1.min(other.x1),
            self.y1.min(other.y1),
        )
    }

    pub fn union(&self, other: &PixelBox) -> PixelBox {
        PixelBox::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
    }

    pub fn contains_box(&self, other: &PixelBox) -> bool {
        other.x0 >= self.x0 && other.y0 >= self.y0 && other.x1 <= self.x1 && other.y1 <= self.y1
    }

    /// Corner pairs in the persisted order: top-left, top-right, bottom-right, bottom-left.
    pub fn corner_pairs(&self) -> [(i64, i64); 4] {
        [
            (self.x0, self.y0),
            (self.x1, self.y0),
            (self.x1, self.y1),
            (self.x0, self.y1),
        ]
    }

    pub fn origin(&self) -> Point2D {
        DVec2::new(self.x0 as f64, self.y0 as f64)
    }
}

impl std::fmt::Display for PixelBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}) x [{}, {})", self.x0, self.x1, self.y0, self.y1)
    }
}
