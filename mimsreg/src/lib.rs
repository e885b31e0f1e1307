//! mimsreg - correlative registration of MIMS isotope images onto EM canvases.
//!
//! This library provides:
//! - Landmark-free alignment estimates by sliding mask IoU, and stage propagation
//! - Coarse similarity alignment with mirror detection from landmarks
//! - Local non-rigid refinement (thin-plate spline or mask-driven B-spline)
//! - Warping of native channels into canvas-aligned patches
//! - Canvas-wide mosaics per channel and derived isotope ratio channels
//! - Per-image and per-set state machines that sequence all of the above
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mimsreg::prelude::*;
//!
//! let orchestrator = Orchestrator::new(config, channels, landmarks, artifacts);
//! let set = orchestrator.create_set(canvas_id, CanvasSize::new(2048, 2048));
//! let image = orchestrator.add_image(set, "acquisition_01.im")?;
//! orchestrator.mark_preprocessed(image, 256, 256, vec!["12C".into(), "13C".into()], Some(50.0))?;
//!
//! let outcome = orchestrator.register(image)?;
//! println!("{} -> set {}", outcome.status, outcome.set_status);
//! ```

pub mod geometry;
pub mod landmarks;
pub(crate) mod math;
pub mod mosaic;
pub mod orchestrator;
pub mod registration;
pub mod segmentation;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude;

// ============================================================================
// Geometry and landmarks
// ============================================================================

pub use geometry::{CanvasSize, PixelBox, Point2D, RasterIndex};
pub use landmarks::{LandmarkSet, Polygon, rasterize_polygons};

// ============================================================================
// Registration
// ============================================================================

pub use registration::config::{
    BSplineConfig, CoarseConfig, ConfigError, DeformationConfig, DeformationStrategy,
    EstimateConfig, InterpolationMethod, MimsRegConfig, MosaicConfig, RatioDefinition,
    RetryPolicy, TpsConfig, WarpConfig,
};
pub use registration::{
    AlignmentCandidate, CanvasGeometry, ChannelPatch, ChannelSourceError, Diagnostic,
    DiagnosticKind, EstimateSource, RegistrationError, SimilarityTransform, SolvedRegistration,
    TransformChain, TransformParameters, WarpMap, alignment_from_set, estimate_alignment,
    estimate_with_orientation, mask_iou, solve_registration, warp_channel,
};

// ============================================================================
// Compositing
// ============================================================================

pub use mosaic::{BitDepth, CompositeOutcome, Raster, SkippedChannel, composite_set};

// ============================================================================
// Orchestration
// ============================================================================

pub use orchestrator::{
    ArtifactStore, ChannelSource, CompositeReport, ImageRecord, ImageSetRecord, ImageStatus,
    InMemoryArtifactStore, InMemoryChannelSource, InMemoryLandmarkStore, LandmarkStore,
    Orchestrator, RegistrationOutcome, RegistrationRecord, SetStatus,
};

// ============================================================================
// Segmentation assistant
// ============================================================================

pub use segmentation::{
    CachedSegmentation, PredictorCache, SegmentationAssistant, SegmentationError,
    SegmentationPrompt, SegmentationTarget,
};
