//! Coarse alignment: least-squares similarity plus mirror selection.

use glam::DVec2;

use crate::geometry::{Point2D, mirror_x};
use crate::landmarks::LandmarkSet;
use crate::math::centroid;
use crate::registration::config::CoarseConfig;
use crate::registration::error::RegistrationError;
use crate::registration::transform::SimilarityTransform;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoarseFit {
    /// Similarity applied after the optional mirror.
    pub similarity: SimilarityTransform,
    pub mirrored: bool,
    /// Sum of squared residuals of the chosen hypothesis.
    pub sse: f64,
    /// Sum of squared residuals of the rejected hypothesis (`INFINITY` if it failed).
    pub rejected_sse: f64,
}

/// Closed-form least-squares similarity (Umeyama without reflection) mapping
/// `source[i]` onto `target[i]`.
pub fn estimate_similarity(source: &[Point2D], target: &[Point2D]) -> Option<SimilarityTransform> {
    if source.len() < 2 || source.len() != target.len() {
        return None;
    }
    let src_centroid = centroid(source)?;
    let tgt_centroid = centroid(target)?;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syx = 0.0;
    let mut syy = 0.0;
    let mut src_var = 0.0;
    for (s, t) in source.iter().zip(target) {
        let s = *s - src_centroid;
        let t = *t - tgt_centroid;
        sxx += s.x * t.x;
        sxy += s.x * t.y;
        syx += s.y * t.x;
        syy += s.y * t.y;
        src_var += s.length_squared();
    }

    if src_var < 1e-10 {
        return None;
    }

    let angle = (sxy - syx).atan2(sxx + syy);
    let (sin, cos) = angle.sin_cos();
    let scale = ((sxx + syy) * cos + (sxy - syx) * sin) / src_var;
    if !(scale > 1e-10) || !scale.is_finite() {
        return None;
    }

    let t = DVec2::new(
        tgt_centroid.x - scale * (cos * src_centroid.x - sin * src_centroid.y),
        tgt_centroid.y - scale * (sin * src_centroid.x + cos * src_centroid.y),
    );
    let similarity = SimilarityTransform::new(scale, angle, t);
    similarity.is_valid().then_some(similarity)
}

pub fn sum_squared_residuals(
    similarity: &SimilarityTransform,
    source: &[Point2D],
    target: &[Point2D],
) -> f64 {
    source
        .iter()
        .zip(target)
        .map(|(&s, &t)| similarity.apply(s).distance_squared(t))
        .sum()
}

/// The mirrored hypothesis must beat the plain one by more than `tolerance`
/// times the larger residual sum; anything closer is a tie.
pub(crate) fn mirror_wins(sse: f64, msse: f64, tolerance: f64) -> bool {
    sse - msse > tolerance * sse.max(msse)
}

/// Fits the similarity with and without mirroring MIMS x about the native
/// width and keeps the hypothesis with the lower residual. Ties keep no mirror.
pub fn solve_coarse(
    landmarks: &LandmarkSet,
    native_width: usize,
    config: &CoarseConfig,
) -> Result<CoarseFit, RegistrationError> {
    let pairs = landmarks.correspondences()?;
    if pairs.len() < config.min_correspondences {
        return Err(RegistrationError::InsufficientLandmarks {
            found: pairs.len(),
            required: config.min_correspondences,
        });
    }

    let (source, target): (Vec<Point2D>, Vec<Point2D>) = pairs.into_iter().unzip();
    let width = native_width as f64;
    let mirrored_source: Vec<Point2D> = source.iter().map(|&p| mirror_x(p, width)).collect();

    let fit = |src: &[Point2D]| {
        estimate_similarity(src, &target).map(|s| (s, sum_squared_residuals(&s, src, &target)))
    };
    let plain = fit(&source);
    let mirrored = fit(&mirrored_source);

    let result = match (plain, mirrored) {
        (Some((s, sse)), Some((ms, msse))) => {
            if mirror_wins(sse, msse, config.mirror_tie_tolerance) {
                CoarseFit {
                    similarity: ms,
                    mirrored: true,
                    sse: msse,
                    rejected_sse: sse,
                }
            } else {
                CoarseFit {
                    similarity: s,
                    mirrored: false,
                    sse,
                    rejected_sse: msse,
                }
            }
        }
        (Some((s, sse)), None) => CoarseFit {
            similarity: s,
            mirrored: false,
            sse,
            rejected_sse: f64::INFINITY,
        },
        (None, Some((ms, msse))) => CoarseFit {
            similarity: ms,
            mirrored: true,
            sse: msse,
            rejected_sse: f64::INFINITY,
        },
        (None, None) => {
            return Err(RegistrationError::DegenerateTransform(
                "landmarks admit no similarity (coincident points?)".to_string(),
            ));
        }
    };

    if !result.sse.is_finite() {
        return Err(RegistrationError::DegenerateTransform(
            "non-finite residual".to_string(),
        ));
    }

    tracing::debug!(
        mirrored = result.mirrored,
        sse = result.sse,
        rejected_sse = result.rejected_sse,
        "Coarse alignment: {}",
        result.similarity
    );
    Ok(result)
}

#[cfg(test)]
mod tests;
