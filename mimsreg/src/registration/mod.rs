//! Registration of one MIMS image onto the EM canvas.
//!
//! The pipeline for a single image:
//!
//! 1. **Coarse alignment**: least-squares similarity, with and without mirroring
//! 2. **Local deformation**: thin-plate spline or polygon-mask B-spline field
//! 3. **Canvas geometry**: footprint of the warped raster, clamped to the canvas
//! 4. **Warping**: every channel rasterized through the chain
//!
//! Steps 1 to 3 are pure functions of the landmarks and sizes, see
//! [`solve_registration`]. Step 4 runs per channel via [`warp::WarpMap`].
//!
//! Before any landmark exists, [`estimate`] proposes coarse placements from
//! the image content or from an aligned image of the same set.

pub mod canvas;
pub mod coarse;
pub mod config;
pub mod deformation;
pub mod error;
pub mod estimate;
pub mod interpolation;
pub mod transform;
pub mod warp;

use crate::geometry::CanvasSize;
use crate::landmarks::LandmarkSet;

pub use canvas::{CanvasGeometry, resolve_geometry};
pub use coarse::{CoarseFit, solve_coarse};
pub use config::MimsRegConfig;
pub use deformation::{LocalDeformation, LocalFit, solve_local};
pub use error::{ChannelSourceError, Diagnostic, DiagnosticKind, RegistrationError};
pub use estimate::{
    AlignmentCandidate, EstimateSource, alignment_from_set, estimate_alignment,
    estimate_with_orientation, mask_iou,
};
pub use transform::{SimilarityTransform, TransformChain, TransformParameters};
pub use warp::{ChannelPatch, WarpMap, warp_channel};

/// Everything computed for an image before any channel is touched.
#[derive(Debug, Clone)]
pub struct SolvedRegistration {
    pub chain: TransformChain,
    pub geometry: CanvasGeometry,
    pub coarse: CoarseFit,
    /// Largest landmark residual after local refinement, canvas pixels.
    pub max_residual: f64,
    /// Leave-one-out landmark residual, canvas pixels.
    pub holdout_residual: f64,
}

/// Coarse fit, local refinement, chain validation and canvas footprint.
pub fn solve_registration(
    landmarks: &LandmarkSet,
    native_width: usize,
    native_height: usize,
    canvas: CanvasSize,
    config: &MimsRegConfig,
) -> Result<SolvedRegistration, RegistrationError> {
    let coarse = solve_coarse(landmarks, native_width, &config.coarse)?;
    let coarse_chain =
        TransformChain::coarse(coarse.similarity, coarse.mirrored, native_width, native_height);
    coarse_chain.validate()?;

    let local = solve_local(&coarse_chain, landmarks, &config.deformation)?;
    let chain = coarse_chain.with_local(Some(local.deformation));
    chain.validate()?;

    let geometry = resolve_geometry(&chain, canvas)?;

    tracing::info!(
        mirrored = chain.mirrored,
        max_residual = local.max_residual,
        holdout_residual = local.holdout_residual,
        "Registration solved: {}, footprint {}",
        chain.similarity,
        geometry.clamped
    );

    Ok(SolvedRegistration {
        chain,
        geometry,
        coarse,
        max_residual: local.max_residual,
        holdout_residual: local.holdout_residual,
    })
}
