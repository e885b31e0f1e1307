//! Landmark-free alignment estimates.
//!
//! The canvas and one MIMS raster are thresholded to foreground masks, with
//! the canvas resampled to the MIMS pixel size. For every rotation step, with
//! and without mirroring, the rotated MIMS mask slides over the canvas mask
//! and each window is scored by the IoU of the two masks over the pixels
//! valid in both. The best few placements become [`AlignmentCandidate`]s.
//!
//! Once one image of a set is aligned, the others follow from their stage
//! positions, see [`alignment_from_set`].

use std::cmp::Ordering;

use common::{BitBuffer2, Buffer2};
use glam::DVec2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geometry::{PixelBox, RasterIndex, pixel_center};
use crate::math::filter::gaussian_blur;
use crate::registration::config::EstimateConfig;
use crate::registration::error::RegistrationError;
use crate::registration::interpolation::inside_extent;
use crate::registration::transform::{SimilarityTransform, TransformChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimateSource {
    /// Full rotation and mirror search.
    Initial,
    /// Orientation or placement taken from an aligned image of the same set.
    FromSet,
}

/// A proposed coarse placement of a MIMS image on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentCandidate {
    pub similarity: SimilarityTransform,
    pub mirrored: bool,
    /// Mask overlap that ranked this candidate; 0 for stage propagation.
    pub iou: f64,
    pub source: EstimateSource,
}

impl AlignmentCandidate {
    pub fn chain(&self, native_width: usize, native_height: usize) -> TransformChain {
        TransformChain::coarse(self.similarity, self.mirrored, native_width, native_height)
    }
}

/// Canvas pixels per MIMS pixel.
pub fn pixel_scale(mims_pixel_size_nm: f64, em_pixel_size_nm: f64) -> Option<f64> {
    let scale = mims_pixel_size_nm / em_pixel_size_nm;
    (scale.is_finite() && scale > 0.0).then_some(scale)
}

// =============================================================================
// Masks
// =============================================================================

/// Linear-interpolated percentile of the finite values, `p` in [0, 100].
fn percentile(raster: &Buffer2<f32>, p: f64) -> Option<f32> {
    let mut values: Vec<f32> = raster.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(f32::total_cmp);
    let rank = (p / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let t = (rank - lo as f64) as f32;
    Some(values[lo] + (values[hi] - values[lo]) * t)
}

/// Foreground is `value > percentile(p) - buffer`.
pub fn threshold_mask(raster: &Buffer2<f32>, p: f64, buffer: f32) -> BitBuffer2 {
    let Some(level) = percentile(raster, p) else {
        return BitBuffer2::new_default(raster.width(), raster.height());
    };
    let threshold = level - buffer;
    BitBuffer2::from_fn(raster.width(), raster.height(), |x, y| {
        raster[(x, y)] > threshold
    })
}

/// Intersection over union of two equally sized masks. `None` when the
/// sizes differ or both masks are empty.
pub fn mask_iou(a: &BitBuffer2, b: &BitBuffer2) -> Option<f64> {
    if a.width() != b.width() || a.height() != b.height() {
        return None;
    }
    let (intersection, union) = a
        .iter()
        .zip(b.iter())
        .fold((0usize, 0usize), |(i, u), (x, y)| {
            (i + (x && y) as usize, u + (x || y) as usize)
        });
    (union > 0).then(|| intersection as f64 / union as f64)
}

/// Canvas resampled so one cell covers one MIMS pixel.
fn working_canvas(canvas: &Buffer2<f32>, scale: f64) -> Buffer2<f32> {
    if (scale - 1.0).abs() < 1e-9 {
        return canvas.clone();
    }
    let smoothed = if scale > 1.0 {
        gaussian_blur(canvas, scale / 2.0)
    } else {
        canvas.clone()
    };
    let width = ((canvas.width() as f64 / scale).floor() as usize).max(1);
    let height = ((canvas.height() as f64 / scale).floor() as usize).max(1);
    Buffer2::from_fn(width, height, |x, y| {
        let sx = (((x as f64 + 0.5) * scale) as usize).min(canvas.width() - 1);
        let sy = (((y as f64 + 0.5) * scale) as usize).min(canvas.height() - 1);
        smoothed[(sx, sy)]
    })
}

/// The MIMS mask under one orientation hypothesis, at unit scale.
struct Orientation {
    rotation_deg: f64,
    mirrored: bool,
    /// Where the oriented raster sits when the translation is zero.
    bbox: PixelBox,
    foreground: BitBuffer2,
    valid: BitBuffer2,
}

impl Orientation {
    fn new(mims: &BitBuffer2, rotation_deg: f64, mirrored: bool) -> Option<Self> {
        let (w, h) = (mims.width(), mims.height());
        let chain = TransformChain::coarse(
            SimilarityTransform::new(1.0, rotation_deg.to_radians(), DVec2::ZERO),
            mirrored,
            w,
            h,
        );
        let bbox = PixelBox::enclosing(&chain.canvas_corners())?;
        let (bw, bh) = (bbox.width() as usize, bbox.height() as usize);
        let origin = bbox.origin();

        let mut foreground = BitBuffer2::new_default(bw, bh);
        let mut valid = BitBuffer2::new_default(bw, bh);
        for y in 0..bh {
            for x in 0..bw {
                let native = chain.inverse(pixel_center(RasterIndex::new(y, x)) + origin);
                if !inside_extent(native, w, h) {
                    continue;
                }
                valid.set_xy(x, y, true);
                if mims.get_xy(native.x as usize, native.y as usize) {
                    foreground.set_xy(x, y, true);
                }
            }
        }
        Some(Self {
            rotation_deg,
            mirrored,
            bbox,
            foreground,
            valid,
        })
    }
}

// =============================================================================
// Ranking
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Scored {
    /// Top-left of the oriented mask, working pixels.
    offset: DVec2,
    /// Top-left of the oriented mask at zero translation.
    anchor: DVec2,
    rotation_deg: f64,
    mirrored: bool,
    iou: f64,
}

fn rotation_gap(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Best `capacity` placements; near-duplicates share a slot.
struct TopCandidates {
    capacity: usize,
    merge_distance: f64,
    merge_rotation: f64,
    entries: Vec<Scored>,
}

impl TopCandidates {
    fn new(config: &EstimateConfig) -> Self {
        Self {
            capacity: config.candidates,
            merge_distance: config.merge_distance_px,
            merge_rotation: config.merge_rotation_deg,
            entries: Vec::new(),
        }
    }

    fn offer(&mut self, candidate: Scored) {
        let neighbor = self.entries.iter().position(|e| {
            e.mirrored == candidate.mirrored
                && e.offset.distance(candidate.offset) < self.merge_distance
                && rotation_gap(e.rotation_deg, candidate.rotation_deg) < self.merge_rotation
        });
        match neighbor {
            Some(i) if candidate.iou > self.entries[i].iou => self.entries[i] = candidate,
            Some(_) => return,
            None => self.entries.push(candidate),
        }
        self.entries
            .sort_by(|a, b| b.iou.partial_cmp(&a.iou).unwrap_or(Ordering::Equal));
        self.entries.truncate(self.capacity);
    }
}

// =============================================================================
// Search
// =============================================================================

fn slide(
    canvas_fg: &BitBuffer2,
    orientation: &Orientation,
    config: &EstimateConfig,
) -> TopCandidates {
    let mut top = TopCandidates::new(config);
    let (cw, ch) = (canvas_fg.width() as i64, canvas_fg.height() as i64);
    let (bw, bh) = (orientation.bbox.width(), orientation.bbox.height());
    let pad = (config.overhang_fraction * bw.max(bh) as f64) as i64;

    let ys: Vec<i64> = (-pad..=ch - bh + pad).step_by(config.stride_px).collect();
    let xs: Vec<i64> = (-pad..=cw - bw + pad).step_by(config.stride_px).collect();
    for &oy in &ys {
        for &ox in &xs {
            let (mut valid, mut intersection, mut union) = (0usize, 0usize, 0usize);
            for my in 0..bh {
                let cy = oy + my;
                if cy < 0 || cy >= ch {
                    continue;
                }
                for mx in 0..bw {
                    let cx = ox + mx;
                    let (mx, my_u) = (mx as usize, my as usize);
                    if cx < 0 || cx >= cw || !orientation.valid.get_xy(mx, my_u) {
                        continue;
                    }
                    let a = canvas_fg.get_xy(cx as usize, cy as usize);
                    let b = orientation.foreground.get_xy(mx, my_u);
                    valid += 1;
                    intersection += (a && b) as usize;
                    union += (a || b) as usize;
                }
            }
            if valid < config.min_valid_px
                || union < config.min_union_px
                || union == 0
                || intersection as f64 / valid as f64 > config.max_fill_fraction
            {
                continue;
            }
            top.offer(Scored {
                offset: DVec2::new(ox as f64, oy as f64),
                anchor: orientation.bbox.origin(),
                rotation_deg: orientation.rotation_deg,
                mirrored: orientation.mirrored,
                iou: intersection as f64 / union as f64,
            });
        }
    }
    top
}

fn search(
    canvas: &Buffer2<f32>,
    mims: &Buffer2<f32>,
    scale: f64,
    hypotheses: &[(f64, bool)],
    source: EstimateSource,
    config: &EstimateConfig,
) -> Result<Vec<AlignmentCandidate>, RegistrationError> {
    if canvas.is_empty() || mims.is_empty() {
        return Err(RegistrationError::InvalidFile(
            "alignment estimate needs non-empty canvas and MIMS rasters".to_string(),
        ));
    }
    if !(scale.is_finite() && scale > 0.0) {
        return Err(RegistrationError::DegenerateTransform(format!(
            "invalid pixel scale {scale}"
        )));
    }

    let canvas_fg = threshold_mask(
        &working_canvas(canvas, scale),
        config.threshold_percentile,
        config.threshold_buffer,
    );
    let mims_fg = threshold_mask(mims, config.threshold_percentile, config.threshold_buffer);

    let per_hypothesis: Vec<TopCandidates> = hypotheses
        .par_iter()
        .filter_map(|&(rotation_deg, mirrored)| {
            let orientation = Orientation::new(&mims_fg, rotation_deg, mirrored)?;
            Some(slide(&canvas_fg, &orientation, config))
        })
        .collect();

    // Merged in hypothesis order so ties resolve the same way every run.
    let mut top = TopCandidates::new(config);
    for scored in per_hypothesis.into_iter().flat_map(|found| found.entries) {
        top.offer(scored);
    }

    let candidates: Vec<AlignmentCandidate> = top
        .entries
        .iter()
        .map(|scored| AlignmentCandidate {
            similarity: SimilarityTransform::new(
                scale,
                scored.rotation_deg.to_radians(),
                (scored.offset - scored.anchor) * scale,
            ),
            mirrored: scored.mirrored,
            iou: scored.iou,
            source,
        })
        .collect();

    tracing::info!(
        hypotheses = hypotheses.len(),
        candidates = candidates.len(),
        best_iou = candidates.first().map(|c| c.iou),
        "Alignment estimates ready"
    );
    Ok(candidates)
}

/// Searches every rotation step with and without mirroring. `scale` is
/// canvas pixels per MIMS pixel. Candidates are best first; an empty list
/// means no window passed the overlap gates.
pub fn estimate_alignment(
    canvas: &Buffer2<f32>,
    mims: &Buffer2<f32>,
    scale: f64,
    config: &EstimateConfig,
) -> Result<Vec<AlignmentCandidate>, RegistrationError> {
    let steps = (360.0 / config.rotation_step_deg).round().max(1.0) as usize;
    let hypotheses: Vec<(f64, bool)> = (0..steps)
        .flat_map(|k| {
            let rotation = k as f64 * config.rotation_step_deg;
            [(rotation, false), (rotation, true)]
        })
        .collect();
    search(canvas, mims, scale, &hypotheses, EstimateSource::Initial, config)
}

/// Sliding search at a known orientation, typically the one of an image
/// already aligned in the same set.
pub fn estimate_with_orientation(
    canvas: &Buffer2<f32>,
    mims: &Buffer2<f32>,
    scale: f64,
    rotation_deg: f64,
    mirrored: bool,
    config: &EstimateConfig,
) -> Result<Vec<AlignmentCandidate>, RegistrationError> {
    search(
        canvas,
        mims,
        scale,
        &[(rotation_deg, mirrored)],
        EstimateSource::FromSet,
        config,
    )
}

/// Places an image from an aligned neighbour of the same set.
///
/// Stage positions are in micrometres with axes along the native raster
/// axes. The neighbour's coarse similarity and mirroring carry over; only
/// the translation moves by the stage offset.
pub fn alignment_from_set(
    reference: &TransformChain,
    reference_stage_um: DVec2,
    stage_um: DVec2,
    mims_pixel_size_nm: f64,
    native_width: usize,
) -> Result<AlignmentCandidate, RegistrationError> {
    if !(mims_pixel_size_nm.is_finite() && mims_pixel_size_nm > 0.0) {
        return Err(RegistrationError::DegenerateTransform(format!(
            "invalid MIMS pixel size {mims_pixel_size_nm} nm"
        )));
    }
    let similarity = reference.similarity;
    // Offset of this image's native origin in the reference's native frame.
    let delta = (stage_um - reference_stage_um) * 1000.0 / mims_pixel_size_nm;
    let shift = if reference.mirrored {
        DVec2::new(
            reference.native_width as f64 - native_width as f64 - delta.x,
            delta.y,
        )
    } else {
        delta
    };
    let rotated = SimilarityTransform::new(similarity.scale, similarity.rotation, DVec2::ZERO)
        .apply(shift);
    let placed = SimilarityTransform::new(
        similarity.scale,
        similarity.rotation,
        similarity.translation + rotated,
    );
    if !placed.is_valid() {
        return Err(RegistrationError::DegenerateTransform(format!(
            "stage propagation produced {placed}"
        )));
    }
    tracing::debug!(
        dx_um = stage_um.x - reference_stage_um.x,
        dy_um = stage_um.y - reference_stage_um.y,
        "Alignment propagated from set: {}",
        placed
    );
    Ok(AlignmentCandidate {
        similarity: placed,
        mirrored: reference.mirrored,
        iou: 0.0,
        source: EstimateSource::FromSet,
    })
}

#[cfg(test)]
mod tests;
