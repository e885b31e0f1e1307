//! Landmark correspondences between one MIMS image and the canvas.

use common::BitBuffer2;
use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::geometry::Point2D;
use crate::math::centroid;
use crate::registration::error::RegistrationError;

/// Closed polygon; the last vertex connects back to the first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub vertices: Vec<Point2D>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point2D>) -> Self {
        Self { vertices }
    }

    /// Fewer than three vertices do not describe an area.
    pub fn is_valid(&self) -> bool {
        self.vertices.len() >= 3 && self.vertices.iter().all(|v| v.is_finite())
    }

    /// Vertex mean.
    pub fn centroid(&self) -> Option<Point2D> {
        centroid(&self.vertices)
    }

    pub fn map(&self, f: impl Fn(Point2D) -> Point2D) -> Polygon {
        Polygon::new(self.vertices.iter().map(|&v| f(v)).collect())
    }

    /// For each of `n` evenly spaced directions starting at +x, the vertex with the
    /// largest projection onto that direction relative to the centroid.
    pub fn radial_spokes(&self, n: usize) -> Vec<Point2D> {
        let Some(c) = self.centroid() else {
            return Vec::new();
        };
        (0..n)
            .filter_map(|k| {
                let angle = std::f64::consts::TAU * k as f64 / n as f64;
                let dir = DVec2::new(angle.cos(), angle.sin());
                self.vertices
                    .iter()
                    .copied()
                    .max_by(|a, b| (*a - c).dot(dir).total_cmp(&(*b - c).dot(dir)))
            })
            .collect()
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, p: Point2D) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n.wrapping_sub(1);
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[j];
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    fn scanline_crossings(&self, y: f64, out: &mut Vec<f64>) {
        let n = self.vertices.len();
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            if (a.y > y) != (b.y > y) {
                out.push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
            }
        }
    }
}

/// Rasterizes the union of `polygons` into a `width x height` mask.
///
/// Cell `(col, row)` is sampled at `origin + (col + 0.5, row + 0.5) * cell_size`
/// and is set when that point is inside any polygon (even-odd per polygon).
pub fn rasterize_polygons(
    polygons: &[Polygon],
    width: usize,
    height: usize,
    origin: Point2D,
    cell_size: f64,
) -> BitBuffer2 {
    let mut mask = BitBuffer2::new_default(width, height);
    let mut crossings = Vec::new();
    for polygon in polygons.iter().filter(|p| p.is_valid()) {
        for row in 0..height {
            let y = origin.y + (row as f64 + 0.5) * cell_size;
            crossings.clear();
            polygon.scanline_crossings(y, &mut crossings);
            crossings.sort_by(f64::total_cmp);
            for span in crossings.chunks_exact(2) {
                // Cells whose centre lies in [span[0], span[1]).
                let first = ((span[0] - origin.x) / cell_size - 0.5).ceil().max(0.0);
                let last = ((span[1] - origin.x) / cell_size - 0.5).ceil().min(width as f64);
                if last <= first {
                    continue;
                }
                for col in first as usize..last as usize {
                    mask.set_xy(col, row, true);
                }
            }
        }
    }
    mask
}

/// Matched points and polygons in MIMS native space and canvas space.
///
/// Entry `i` of each MIMS list corresponds to entry `i` of the EM list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    pub mims_points: Vec<Point2D>,
    pub em_points: Vec<Point2D>,
    pub mims_polygons: Vec<Polygon>,
    pub em_polygons: Vec<Polygon>,
    /// Bumped by the landmark store whenever any correspondence changes.
    pub revision: u64,
}

impl LandmarkSet {
    pub fn from_points(mims: Vec<Point2D>, em: Vec<Point2D>) -> Self {
        Self {
            mims_points: mims,
            em_points: em,
            ..Default::default()
        }
    }

    pub fn from_polygons(mims: Vec<Polygon>, em: Vec<Polygon>) -> Self {
        Self {
            mims_polygons: mims,
            em_polygons: em,
            ..Default::default()
        }
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.mims_points.len() != self.em_points.len() {
            return Err(RegistrationError::LandmarkCountMismatch {
                kind: "points",
                mims: self.mims_points.len(),
                em: self.em_points.len(),
            });
        }
        if self.mims_polygons.len() != self.em_polygons.len() {
            return Err(RegistrationError::LandmarkCountMismatch {
                kind: "polygons",
                mims: self.mims_polygons.len(),
                em: self.em_polygons.len(),
            });
        }
        Ok(())
    }

    /// Polygon pairs where both sides describe an area.
    pub fn polygon_pairs(&self) -> impl Iterator<Item = (&Polygon, &Polygon)> {
        self.mims_polygons
            .iter()
            .zip(&self.em_polygons)
            .filter(|(m, e)| m.is_valid() && e.is_valid())
    }

    /// Point correspondences `(mims, em)`: explicit points first, then polygon
    /// centroids in polygon order.
    pub fn correspondences(&self) -> Result<Vec<(Point2D, Point2D)>, RegistrationError> {
        self.validate()?;
        let mut pairs: Vec<(Point2D, Point2D)> = self
            .mims_points
            .iter()
            .copied()
            .zip(self.em_points.iter().copied())
            .filter(|(m, e)| m.is_finite() && e.is_finite())
            .collect();
        pairs.extend(
            self.polygon_pairs()
                .filter_map(|(m, e)| Some((m.centroid()?, e.centroid()?))),
        );
        Ok(pairs)
    }
}
