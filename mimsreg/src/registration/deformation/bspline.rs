//! Mask-driven cubic B-spline free-form deformation.
//!
//! Registers a moving mask onto a fixed mask by minimizing mean squared
//! difference over the control-point displacements of a uniform cubic
//! B-spline grid. Coordinates inside this module are working-raster indices
//! (pixel `i` sits at coordinate `i`).

use common::Buffer2;
use glam::DVec2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geometry::Point2D;
use crate::math::filter::gradient;
use crate::registration::config::BSplineConfig;

/// Cubic B-spline basis weights at fractional offset `t`.
#[inline]
fn basis(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    let s = 1.0 - t;
    [
        s * s * s / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ]
}

/// Uniform control grid with `mesh + 3` points per axis; control point `k`
/// sits at `(k - 1) * spacing`.
#[derive(Debug, Clone, PartialEq)]
pub struct BSplineGrid {
    mesh: usize,
    spacing: DVec2,
    coeffs: Vec<DVec2>,
}

impl BSplineGrid {
    pub fn zeros(mesh: usize, width: usize, height: usize) -> Self {
        let mesh = mesh.max(1);
        let spacing = DVec2::new(
            (width.max(2) - 1) as f64 / mesh as f64,
            (height.max(2) - 1) as f64 / mesh as f64,
        );
        let n = mesh + 3;
        Self {
            mesh,
            spacing,
            coeffs: vec![DVec2::ZERO; n * n],
        }
    }

    #[inline]
    fn side(&self) -> usize {
        self.mesh + 3
    }

    #[inline]
    fn locate(&self, v: f64, spacing: f64) -> (usize, f64) {
        let u = v / spacing;
        let cell = (u.floor().max(0.0) as usize).min(self.mesh - 1);
        (cell, u - cell as f64)
    }

    /// Index of the first control point and the 4x4 weights for `p`.
    #[inline]
    fn support(&self, p: DVec2) -> (usize, usize, [f64; 4], [f64; 4]) {
        let (ix, tx) = self.locate(p.x, self.spacing.x);
        let (iy, ty) = self.locate(p.y, self.spacing.y);
        (ix, iy, basis(tx), basis(ty))
    }

    pub fn displacement(&self, p: DVec2) -> DVec2 {
        let (ix, iy, bx, by) = self.support(p);
        let side = self.side();
        let mut d = DVec2::ZERO;
        for (k, wy) in by.iter().enumerate() {
            let row = (iy + k) * side + ix;
            for (j, wx) in bx.iter().enumerate() {
                d += self.coeffs[row + j] * (wx * wy);
            }
        }
        d
    }

    pub fn max_coefficient(&self) -> f64 {
        self.coeffs.iter().map(|c| c.length()).fold(0.0, f64::max)
    }
}

#[inline]
fn sample_clamped(buf: &Buffer2<f32>, p: DVec2) -> f32 {
    let max_x = buf.width() as f64 - 1.0;
    let max_y = buf.height() as f64 - 1.0;
    let x = p.x.clamp(0.0, max_x);
    let y = p.y.clamp(0.0, max_y);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(buf.width() - 1);
    let y1 = (y0 + 1).min(buf.height() - 1);
    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;
    let top = buf[(x0, y0)] * (1.0 - fx) + buf[(x1, y0)] * fx;
    let bottom = buf[(x0, y1)] * (1.0 - fx) + buf[(x1, y1)] * fx;
    top * (1.0 - fy) + bottom * fy
}

struct MaskProblem<'a> {
    fixed: &'a Buffer2<f32>,
    moving: &'a Buffer2<f32>,
    moving_dx: Buffer2<f32>,
    moving_dy: Buffer2<f32>,
}

impl MaskProblem<'_> {
    fn metric(&self, grid: &BSplineGrid) -> f64 {
        let width = self.fixed.width();
        let total: f64 = (0..self.fixed.height())
            .into_par_iter()
            .map(|y| {
                let mut sum = 0.0f64;
                for x in 0..width {
                    let p = DVec2::new(x as f64, y as f64);
                    let warped = sample_clamped(self.moving, p + grid.displacement(p));
                    let r = (warped - self.fixed[(x, y)]) as f64;
                    sum += r * r;
                }
                sum
            })
            .sum();
        total / self.fixed.len() as f64
    }

    fn gradient(&self, grid: &BSplineGrid) -> Vec<DVec2> {
        let width = self.fixed.width();
        let side = grid.side();
        let n = self.fixed.len() as f64;
        (0..self.fixed.height())
            .into_par_iter()
            .fold(
                || vec![DVec2::ZERO; side * side],
                |mut acc, y| {
                    for x in 0..width {
                        let p = DVec2::new(x as f64, y as f64);
                        let q = p + grid.displacement(p);
                        let r = sample_clamped(self.moving, q) - self.fixed[(x, y)];
                        if r == 0.0 {
                            continue;
                        }
                        let g = DVec2::new(
                            sample_clamped(&self.moving_dx, q) as f64,
                            sample_clamped(&self.moving_dy, q) as f64,
                        ) * (2.0 * r as f64 / n);
                        let (ix, iy, bx, by) = grid.support(p);
                        for (k, wy) in by.iter().enumerate() {
                            let row = (iy + k) * side + ix;
                            for (j, wx) in bx.iter().enumerate() {
                                acc[row + j] += g * (wx * wy);
                            }
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![DVec2::ZERO; side * side],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            )
    }
}

#[derive(Debug, Clone)]
pub struct MaskRegistration {
    pub grid: BSplineGrid,
    pub initial_metric: f64,
    pub final_metric: f64,
    pub iterations: usize,
}

/// Finds `u` such that `moving(x + u(x))` best matches `fixed(x)`.
///
/// Steps along the max-normalized negative gradient; a step is kept only if
/// the metric decreases, otherwise it is halved.
pub fn register_masks(
    fixed: &Buffer2<f32>,
    moving: &Buffer2<f32>,
    config: &BSplineConfig,
) -> MaskRegistration {
    assert_eq!(
        (fixed.width(), fixed.height()),
        (moving.width(), moving.height()),
        "mask shapes must match"
    );
    let (moving_dx, moving_dy) = gradient(moving);
    let problem = MaskProblem {
        fixed,
        moving,
        moving_dx,
        moving_dy,
    };

    let mut grid = BSplineGrid::zeros(config.mesh_size, fixed.width(), fixed.height());
    let initial_metric = problem.metric(&grid);
    let mut metric = initial_metric;
    let mut step = config.initial_step;
    let mut iterations = 0;

    'outer: while iterations < config.iterations {
        iterations += 1;
        let grad = problem.gradient(&grid);
        let max_norm = grad.iter().map(|g| g.length()).fold(0.0, f64::max);
        if !(max_norm > 0.0) || !max_norm.is_finite() {
            break;
        }
        loop {
            let mut candidate = grid.clone();
            for (c, g) in candidate.coeffs.iter_mut().zip(&grad) {
                *c -= *g * (step / max_norm);
            }
            let candidate_metric = problem.metric(&candidate);
            if candidate_metric < metric {
                grid = candidate;
                metric = candidate_metric;
                break;
            }
            step *= 0.5;
            if step < config.min_step {
                break 'outer;
            }
        }
    }

    tracing::debug!(
        initial_metric,
        final_metric = metric,
        iterations,
        max_coefficient = grid.max_coefficient(),
        "B-spline mask registration finished"
    );

    MaskRegistration {
        grid,
        initial_metric,
        final_metric: metric,
        iterations,
    }
}

/// Dense inverse displacement on a regular canvas-aligned lattice:
/// `coarse = canvas + u(canvas)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplacementField {
    /// Canvas position of the lattice's top-left cell corner.
    pub origin: Point2D,
    /// Canvas pixels per lattice cell.
    pub cell_size: f64,
    pub width: usize,
    pub height: usize,
    pub dx: Vec<f32>,
    pub dy: Vec<f32>,
}

impl DisplacementField {
    /// Samples `grid` at every working cell and converts to canvas units.
    pub fn from_grid(
        grid: &BSplineGrid,
        origin: Point2D,
        cell_size: f64,
        width: usize,
        height: usize,
    ) -> Self {
        let mut dx = Vec::with_capacity(width * height);
        let mut dy = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let d = grid.displacement(DVec2::new(x as f64, y as f64)) * cell_size;
                dx.push(d.x as f32);
                dy.push(d.y as f32);
            }
        }
        Self {
            origin,
            cell_size,
            width,
            height,
            dx,
            dy,
        }
    }

    /// Bilinear lookup with edge clamping.
    pub fn displacement(&self, p: Point2D) -> DVec2 {
        if self.width == 0 || self.height == 0 {
            return DVec2::ZERO;
        }
        let f = (p - self.origin) / self.cell_size - DVec2::splat(0.5);
        let x = f.x.clamp(0.0, (self.width - 1) as f64);
        let y = f.y.clamp(0.0, (self.height - 1) as f64);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let tx = x - x0 as f64;
        let ty = y - y0 as f64;
        let at = |v: &[f32], xi: usize, yi: usize| v[yi * self.width + xi] as f64;
        let lerp2 = |v: &[f32]| {
            let top = at(v, x0, y0) * (1.0 - tx) + at(v, x1, y0) * tx;
            let bottom = at(v, x0, y1) * (1.0 - tx) + at(v, x1, y1) * tx;
            top * (1.0 - ty) + bottom * ty
        };
        DVec2::new(lerp2(&self.dx), lerp2(&self.dy))
    }

    /// Canvas to coarse.
    #[inline]
    pub fn inverse(&self, p: Point2D) -> Point2D {
        p + self.displacement(p)
    }

    /// Coarse to canvas, solving `p + u(p) = c` by fixed-point iteration.
    pub fn forward(&self, c: Point2D) -> Point2D {
        let mut p = c;
        for _ in 0..50 {
            let next = c - self.displacement(p);
            if next.distance_squared(p) < 1e-16 {
                return next;
            }
            p = next;
        }
        p
    }

    pub fn max_magnitude(&self) -> f64 {
        self.dx
            .iter()
            .zip(&self.dy)
            .map(|(&x, &y)| (x as f64).hypot(y as f64))
            .fold(0.0, f64::max)
    }
}
