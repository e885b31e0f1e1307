//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use mimsreg::prelude::*;
//! ```

// Geometry
pub use crate::{CanvasSize, LandmarkSet, PixelBox, Point2D, Polygon};

// Registration
pub use crate::{
    InterpolationMethod, MimsRegConfig, RegistrationError, TransformChain, TransformParameters,
};

// Compositing
pub use crate::{BitDepth, Raster};

// Orchestration
pub use crate::{
    ArtifactStore, ChannelSource, ImageStatus, LandmarkStore, Orchestrator, RegistrationOutcome,
    SetStatus,
};
