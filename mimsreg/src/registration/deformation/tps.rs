//! Thin-plate spline refinement.
//!
//! ```text
//! f(x,y) = a₀ + a₁x + a₂y + Σᵢ wᵢ U(||(x,y) - (xᵢ,yᵢ)||),   U(r) = r² log(r)
//! ```

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::geometry::Point2D;
use crate::math::centroid;
use crate::math::linalg::solve_linear_system;

/// Control points closer than this are treated as duplicates.
pub const DUPLICATE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinPlateSpline {
    /// Inputs are evaluated as `(p - center) / scale` to keep the system well conditioned.
    center: DVec2,
    scale: f64,
    /// Normalized control points.
    control_points: Vec<DVec2>,
    weights_x: Vec<f64>,
    weights_y: Vec<f64>,
    /// a0 + a1*x + a2*y
    affine_x: [f64; 3],
    affine_y: [f64; 3],
}

impl ThinPlateSpline {
    /// Fits a spline sending `source[i]` to `target[i]`.
    ///
    /// `None` with fewer than 3 points, mismatched lengths, or a singular
    /// system (e.g. all points collinear or duplicated).
    pub fn fit(source: &[DVec2], target: &[DVec2], regularization: f64) -> Option<Self> {
        let n = source.len();
        if n < 3 || n != target.len() {
            return None;
        }

        let center = centroid(source)?;
        let rms = (source.iter().map(|p| p.distance_squared(center)).sum::<f64>() / n as f64).sqrt();
        if !(rms > 1e-12) {
            return None;
        }
        let source: Vec<DVec2> = source.iter().map(|&p| (p - center) / rms).collect();

        // [K + λI  P] [w]   [v]
        // [P^T     0] [a] = [0]
        let size = n + 3;
        let mut matrix = vec![vec![0.0; size]; size];
        for i in 0..n {
            for j in 0..n {
                matrix[i][j] = if i == j {
                    regularization
                } else {
                    tps_kernel(source[i].distance(source[j]))
                };
            }
            let p = source[i];
            matrix[i][n] = 1.0;
            matrix[i][n + 1] = p.x;
            matrix[i][n + 2] = p.y;
            matrix[n][i] = 1.0;
            matrix[n + 1][i] = p.x;
            matrix[n + 2][i] = p.y;
        }

        let mut rhs_x = vec![0.0; size];
        let mut rhs_y = vec![0.0; size];
        for (i, t) in target.iter().enumerate() {
            rhs_x[i] = t.x;
            rhs_y[i] = t.y;
        }

        let solution_x = solve_linear_system(&matrix, &rhs_x)?;
        let solution_y = solve_linear_system(&matrix, &rhs_y)?;

        Some(Self {
            center,
            scale: rms,
            control_points: source,
            weights_x: solution_x[..n].to_vec(),
            weights_y: solution_y[..n].to_vec(),
            affine_x: [solution_x[n], solution_x[n + 1], solution_x[n + 2]],
            affine_y: [solution_y[n], solution_y[n + 1], solution_y[n + 2]],
        })
    }

    pub fn transform(&self, p: DVec2) -> DVec2 {
        let p = (p - self.center) / self.scale;
        let mut tx = self.affine_x[0] + self.affine_x[1] * p.x + self.affine_x[2] * p.y;
        let mut ty = self.affine_y[0] + self.affine_y[1] * p.x + self.affine_y[2] * p.y;
        for (i, &cp) in self.control_points.iter().enumerate() {
            let u = tps_kernel(p.distance(cp));
            tx += self.weights_x[i] * u;
            ty += self.weights_y[i] * u;
        }
        DVec2::new(tx, ty)
    }

    pub fn num_control_points(&self) -> usize {
        self.control_points.len()
    }

    /// Control points in input coordinates.
    pub fn control_points(&self) -> Vec<DVec2> {
        self.control_points
            .iter()
            .map(|&p| p * self.scale + self.center)
            .collect()
    }
}

/// U(r) = r² ln r, with U(0) = 0.
#[inline]
pub(crate) fn tps_kernel(r: f64) -> f64 {
    if r < 1e-10 { 0.0 } else { r * r * r.ln() }
}

/// Forward (coarse to canvas) and inverse (canvas to coarse) splines fitted
/// from the same control pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplinePair {
    pub forward: ThinPlateSpline,
    pub inverse: ThinPlateSpline,
}

impl SplinePair {
    pub fn fit(pairs: &ControlPairs, regularization: f64) -> Option<Self> {
        Some(Self {
            forward: ThinPlateSpline::fit(&pairs.source, &pairs.target, regularization)?,
            inverse: ThinPlateSpline::fit(&pairs.target, &pairs.source, regularization)?,
        })
    }
}

/// Control point correspondences with duplicates on either side dropped.
/// The first occurrence wins.
#[derive(Debug, Clone, Default)]
pub struct ControlPairs {
    pub source: Vec<Point2D>,
    pub target: Vec<Point2D>,
}

impl ControlPairs {
    pub fn push(&mut self, source: Point2D, target: Point2D) -> bool {
        if !source.is_finite() || !target.is_finite() {
            return false;
        }
        let duplicate = self
            .source
            .iter()
            .zip(&self.target)
            .any(|(s, t)| {
                s.distance(source) < DUPLICATE_EPSILON || t.distance(target) < DUPLICATE_EPSILON
            });
        if duplicate {
            return false;
        }
        self.source.push(source);
        self.target.push(target);
        true
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_grid() -> Vec<DVec2> {
        vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(100.0, 0.0),
            DVec2::new(0.0, 100.0),
            DVec2::new(100.0, 100.0),
            DVec2::new(50.0, 50.0),
        ]
    }

    #[test]
    fn test_kernel_values() {
        assert_eq!(tps_kernel(0.0), 0.0);
        assert_eq!(tps_kernel(1.0), 0.0);
        assert!((tps_kernel(std::f64::consts::E) - std::f64::consts::E.powi(2)).abs() < 1e-12);
    }

    #[test]
    fn test_interpolates_control_points() {
        let src = square_grid();
        let mut tgt = src.clone();
        tgt[4] += DVec2::new(3.0, -2.0);
        let tps = ThinPlateSpline::fit(&src, &tgt, 0.0).unwrap();
        for (s, t) in src.iter().zip(&tgt) {
            assert!((tps.transform(*s) - *t).length() < 1e-8);
        }
        // The bump decays away from the displaced control point.
        let near = tps.transform(DVec2::new(55.0, 50.0)) - DVec2::new(55.0, 50.0);
        assert!(near.length() > 1.0);
    }

    #[test]
    fn test_reproduces_affine_exactly() {
        let src = square_grid();
        let affine = |p: DVec2| DVec2::new(1.5 * p.x - 0.2 * p.y + 7.0, 0.3 * p.x + 0.9 * p.y - 4.0);
        let tgt: Vec<_> = src.iter().map(|&p| affine(p)).collect();
        let tps = ThinPlateSpline::fit(&src, &tgt, 0.0).unwrap();
        let sample = DVec2::new(12.5, 81.0);
        assert!((tps.transform(sample) - affine(sample)).length() < 1e-6);
    }

    #[test]
    fn test_collinear_points_fail() {
        let src = vec![DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0), DVec2::new(2.0, 2.0)];
        assert!(ThinPlateSpline::fit(&src, &src, 0.0).is_none());
        assert!(ThinPlateSpline::fit(&src[..2], &src[..2], 0.0).is_none());
    }

    #[test]
    fn test_regularization_smooths() {
        let src = square_grid();
        let mut tgt = src.clone();
        tgt[4] += DVec2::new(10.0, 0.0);
        let exact = ThinPlateSpline::fit(&src, &tgt, 0.0).unwrap();
        let smooth = ThinPlateSpline::fit(&src, &tgt, 1.0).unwrap();
        let err_exact = (exact.transform(src[4]) - tgt[4]).length();
        let err_smooth = (smooth.transform(src[4]) - tgt[4]).length();
        assert!(err_exact < 1e-8);
        assert!(err_smooth > err_exact);
    }

    #[test]
    fn test_control_pairs_drop_duplicates() {
        let mut pairs = ControlPairs::default();
        assert!(pairs.push(DVec2::ZERO, DVec2::ONE));
        assert!(!pairs.push(DVec2::new(1e-9, 0.0), DVec2::splat(5.0)));
        assert!(!pairs.push(DVec2::splat(3.0), DVec2::ONE));
        assert!(!pairs.push(DVec2::new(f64::NAN, 0.0), DVec2::ZERO));
        assert!(pairs.push(DVec2::splat(3.0), DVec2::splat(4.0)));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_spline_pair_is_mutually_inverse_at_controls() {
        let src = square_grid();
        let tgt: Vec<_> = src
            .iter()
            .map(|&p| p * 1.1 + DVec2::new(2.0, 0.5 * (p.x / 100.0)))
            .collect();
        let mut pairs = ControlPairs::default();
        for (s, t) in src.iter().zip(&tgt) {
            pairs.push(*s, *t);
        }
        let pair = SplinePair::fit(&pairs, 0.0).unwrap();
        for s in &src {
            let back = pair.inverse.transform(pair.forward.transform(*s));
            assert!((back - *s).length() < 1e-6);
        }
    }
}
