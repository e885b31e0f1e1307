//! Local (non-rigid) refinement applied after the coarse similarity.
//!
//! Both strategies produce a [`LocalDeformation`] operating between coarse
//! space and canvas space, evaluated in either direction.

pub mod bspline;
pub mod tps;

use common::Buffer2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geometry::{PixelBox, Point2D};
use crate::landmarks::{LandmarkSet, Polygon, rasterize_polygons};
use crate::math::filter::gaussian_blur;
use crate::registration::config::{DeformationConfig, DeformationStrategy};
use crate::registration::error::RegistrationError;
use crate::registration::transform::TransformChain;

pub use bspline::{BSplineGrid, DisplacementField, MaskRegistration, register_masks};
pub use tps::{ControlPairs, SplinePair, ThinPlateSpline};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalDeformation {
    Spline(SplinePair),
    DisplacementField(DisplacementField),
}

impl LocalDeformation {
    /// Coarse to canvas.
    pub fn forward(&self, p: Point2D) -> Point2D {
        match self {
            LocalDeformation::Spline(pair) => pair.forward.transform(p),
            LocalDeformation::DisplacementField(field) => field.forward(p),
        }
    }

    /// Canvas to coarse.
    pub fn inverse(&self, p: Point2D) -> Point2D {
        match self {
            LocalDeformation::Spline(pair) => pair.inverse.transform(p),
            LocalDeformation::DisplacementField(field) => field.inverse(p),
        }
    }
}

/// Outcome of local refinement, including the landmark quality figures.
#[derive(Debug, Clone)]
pub struct LocalFit {
    pub deformation: LocalDeformation,
    /// Largest distance between a refined MIMS landmark and its EM partner.
    pub max_residual: f64,
    /// Largest distance between a landmark and where the deformation fitted
    /// without it places that landmark. Equals `max_residual` for
    /// deformations that do not interpolate their landmarks.
    pub holdout_residual: f64,
}

/// Fits the configured deformation on top of `coarse` and applies the
/// residual ceiling to the worse of the fitted and held-out residuals.
pub fn solve_local(
    coarse: &TransformChain,
    landmarks: &LandmarkSet,
    config: &DeformationConfig,
) -> Result<LocalFit, RegistrationError> {
    let deformation = match config.strategy {
        DeformationStrategy::Spline => fit_spline(coarse, landmarks, config)?,
        DeformationStrategy::DeformableMask => fit_deformable_mask(coarse, landmarks, config)?,
    };

    let max_residual = landmarks
        .correspondences()?
        .iter()
        .map(|&(mims, em)| deformation.forward(coarse.native_to_coarse(mims)).distance(em))
        .fold(0.0, f64::max);
    let holdout_residual = match deformation {
        LocalDeformation::Spline(_) => spline_holdout_residual(coarse, landmarks, config)?,
        LocalDeformation::DisplacementField(_) => max_residual,
    };

    if !max_residual.is_finite() || !holdout_residual.is_finite() {
        return Err(RegistrationError::DegenerateTransform(
            "local deformation produced non-finite landmark positions".to_string(),
        ));
    }
    let worst = max_residual.max(holdout_residual);
    if worst > config.max_residual_px {
        return Err(RegistrationError::ResidualTooLarge {
            max_residual: worst,
            limit: config.max_residual_px,
        });
    }

    tracing::debug!(
        strategy = ?config.strategy,
        max_residual,
        holdout_residual,
        "Local deformation fitted"
    );
    Ok(LocalFit {
        deformation,
        max_residual,
        holdout_residual,
    })
}

/// Control pairs contributed by one landmark: an explicit point, or a
/// polygon centroid followed by its spokes. The first pair is the anchor
/// the landmark is judged by.
#[derive(Debug, Clone)]
struct ControlGroup {
    pairs: Vec<(Point2D, Point2D)>,
}

impl ControlGroup {
    fn anchor(&self) -> Option<(Point2D, Point2D)> {
        self.pairs.first().copied()
    }
}

fn control_groups(
    coarse: &TransformChain,
    landmarks: &LandmarkSet,
    spokes_per_polygon: usize,
) -> Result<Vec<ControlGroup>, RegistrationError> {
    landmarks.validate()?;
    let mut groups = Vec::new();

    for (&mims, &em) in landmarks.mims_points.iter().zip(&landmarks.em_points) {
        let src = coarse.native_to_coarse(mims);
        if src.is_finite() && em.is_finite() {
            groups.push(ControlGroup {
                pairs: vec![(src, em)],
            });
        }
    }

    for (mims, em) in landmarks.polygon_pairs() {
        let mapped = mims.map(|v| coarse.native_to_coarse(v));
        let (Some(c_src), Some(c_tgt)) = (mapped.centroid(), em.centroid()) else {
            continue;
        };
        let mut pairs = vec![(c_src, c_tgt)];
        if spokes_per_polygon > 0 {
            pairs.extend(
                mapped
                    .radial_spokes(spokes_per_polygon)
                    .into_iter()
                    .zip(em.radial_spokes(spokes_per_polygon)),
            );
        }
        groups.push(ControlGroup { pairs });
    }

    Ok(groups)
}

fn assemble_pairs(
    coarse: &TransformChain,
    groups: &[ControlGroup],
    pin_corners: bool,
    skip: Option<usize>,
) -> ControlPairs {
    let mut pairs = ControlPairs::default();
    for (i, group) in groups.iter().enumerate() {
        if skip == Some(i) {
            continue;
        }
        for &(s, t) in &group.pairs {
            pairs.push(s, t);
        }
    }
    if pin_corners {
        for corner in coarse.native_corners() {
            let c = coarse.native_to_coarse(corner);
            pairs.push(c, c);
        }
    }
    pairs
}

/// Control pairs for the spline: explicit points, then per polygon its
/// centroid and radial spokes, then the pinned image corners.
pub fn spline_control_pairs(
    coarse: &TransformChain,
    landmarks: &LandmarkSet,
    spokes_per_polygon: usize,
    pin_corners: bool,
) -> Result<ControlPairs, RegistrationError> {
    let groups = control_groups(coarse, landmarks, spokes_per_polygon)?;
    Ok(assemble_pairs(coarse, &groups, pin_corners, None))
}

/// Leave-one-out residual of the forward spline.
///
/// Each landmark is dropped in turn, the spline refitted from the rest, and
/// the dropped anchor measured against its EM position. Subsets whose system
/// is singular are not scored.
pub fn spline_holdout_residual(
    coarse: &TransformChain,
    landmarks: &LandmarkSet,
    config: &DeformationConfig,
) -> Result<f64, RegistrationError> {
    let groups = control_groups(coarse, landmarks, config.tps.spokes_per_polygon)?;
    let residual = (0..groups.len())
        .into_par_iter()
        .filter_map(|i| {
            let (src, em) = groups[i].anchor()?;
            let pairs = assemble_pairs(coarse, &groups, config.tps.pin_corners, Some(i));
            let Some(spline) =
                ThinPlateSpline::fit(&pairs.source, &pairs.target, config.tps.regularization)
            else {
                tracing::debug!(landmark = i, "Held-out spline is singular, not scored");
                return None;
            };
            Some(spline.transform(src).distance(em))
        })
        .reduce(|| 0.0, f64::max);
    Ok(residual)
}

fn fit_spline(
    coarse: &TransformChain,
    landmarks: &LandmarkSet,
    config: &DeformationConfig,
) -> Result<LocalDeformation, RegistrationError> {
    let pairs = spline_control_pairs(
        coarse,
        landmarks,
        config.tps.spokes_per_polygon,
        config.tps.pin_corners,
    )?;
    let pair = SplinePair::fit(&pairs, config.tps.regularization).ok_or_else(|| {
        RegistrationError::DegenerateTransform(format!(
            "thin-plate spline system is singular ({} control points)",
            pairs.len()
        ))
    })?;
    tracing::debug!(control_points = pairs.len(), "Thin-plate spline fitted");
    Ok(LocalDeformation::Spline(pair))
}

/// Canvas region covering the coarse image footprint and every polygon, padded.
fn mask_region(
    coarse: &TransformChain,
    mims_polygons: &[Polygon],
    em_polygons: &[Polygon],
    padding: usize,
) -> Option<PixelBox> {
    let mut points: Vec<Point2D> = coarse
        .native_corners()
        .iter()
        .map(|&c| coarse.native_to_coarse(c))
        .collect();
    for polygon in mims_polygons.iter().chain(em_polygons) {
        points.extend_from_slice(&polygon.vertices);
    }
    let b = PixelBox::enclosing(&points)?;
    let pad = padding as i64;
    Some(PixelBox::new(b.x0 - pad, b.y0 - pad, b.x1 + pad, b.y1 + pad))
}

fn mask_to_f32(mask: &common::BitBuffer2) -> Buffer2<f32> {
    Buffer2::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_xy(x, y) { 1.0 } else { 0.0 }
    })
}

fn fit_deformable_mask(
    coarse: &TransformChain,
    landmarks: &LandmarkSet,
    config: &DeformationConfig,
) -> Result<LocalDeformation, RegistrationError> {
    landmarks.validate()?;
    let (mims_polygons, em_polygons): (Vec<Polygon>, Vec<Polygon>) = landmarks
        .polygon_pairs()
        .map(|(m, e)| (m.map(|v| coarse.native_to_coarse(v)), e.clone()))
        .unzip();
    if mims_polygons.is_empty() {
        return Err(RegistrationError::InsufficientLandmarks {
            found: 0,
            required: 1,
        });
    }

    let settings = &config.bspline;
    let region = mask_region(coarse, &mims_polygons, &em_polygons, settings.padding_px)
        .ok_or_else(|| RegistrationError::DegenerateTransform("empty mask region".to_string()))?;
    let longest = region.width().max(region.height()).max(1) as f64;
    let scale = (settings.working_max_dim as f64 / longest).min(1.0);
    let cell_size = 1.0 / scale;
    let width = ((region.width() as f64) * scale).ceil().max(2.0) as usize;
    let height = ((region.height() as f64) * scale).ceil().max(2.0) as usize;
    let origin = region.origin();

    let fixed_mask = rasterize_polygons(&em_polygons, width, height, origin, cell_size);
    let moving_mask = rasterize_polygons(&mims_polygons, width, height, origin, cell_size);
    if !fixed_mask.any() || !moving_mask.any() {
        return Err(RegistrationError::DegenerateTransform(
            "polygon masks rasterize to nothing".to_string(),
        ));
    }

    let fixed = gaussian_blur(&mask_to_f32(&fixed_mask), settings.smoothing_sigma);
    let moving = gaussian_blur(&mask_to_f32(&moving_mask), settings.smoothing_sigma);

    tracing::info!(
        width,
        height,
        cell_size,
        "Registering polygon masks over {}",
        region
    );
    let result = register_masks(&fixed, &moving, settings);
    let field = DisplacementField::from_grid(&result.grid, origin, cell_size, width, height);
    Ok(LocalDeformation::DisplacementField(field))
}
