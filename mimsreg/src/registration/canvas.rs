//! Canvas footprint of a registered image.

use serde::{Deserialize, Serialize};

use crate::geometry::{CanvasSize, PixelBox};
use crate::registration::error::RegistrationError;
use crate::registration::transform::TransformChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasGeometry {
    /// Integer hull of the forward-mapped native corners, possibly off-canvas.
    pub precrop: PixelBox,
    /// `precrop` clamped to the canvas. Never empty.
    pub clamped: PixelBox,
}

impl CanvasGeometry {
    /// Offset of the clamped box inside the precrop box.
    pub fn crop_offset(&self) -> (i64, i64) {
        (
            self.clamped.x0 - self.precrop.x0,
            self.clamped.y0 - self.precrop.y0,
        )
    }

    pub fn raster_width(&self) -> usize {
        self.clamped.width() as usize
    }

    pub fn raster_height(&self) -> usize {
        self.clamped.height() as usize
    }
}

/// Maps the native corners through `chain` and derives the precrop and
/// clamped boxes.
///
/// Only the corners are mapped; with a strong local deformation interior
/// content may bulge past the box and is cut off there.
pub fn resolve_geometry(
    chain: &TransformChain,
    canvas: CanvasSize,
) -> Result<CanvasGeometry, RegistrationError> {
    let corners = chain.canvas_corners();
    let precrop = PixelBox::enclosing(&corners).ok_or_else(|| {
        RegistrationError::DegenerateTransform(format!(
            "corners map to non-finite positions {corners:?}"
        ))
    })?;
    if precrop.is_empty() {
        return Err(RegistrationError::DegenerateTransform(format!(
            "warped footprint {precrop} has no area"
        )));
    }

    let clamped = precrop.intersect(&canvas.bounds());
    if clamped.is_empty() {
        return Err(RegistrationError::OutsideCanvas {
            bbox: precrop,
            canvas,
        });
    }

    tracing::debug!("Canvas footprint {} clamped to {}", precrop, clamped);
    Ok(CanvasGeometry { precrop, clamped })
}
