//! Catalog rows kept by the orchestrator.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{CanvasSize, PixelBox};
use crate::orchestrator::status::{ImageStatus, SetStatus};
use crate::registration::canvas::CanvasGeometry;
use crate::registration::error::Diagnostic;
use crate::registration::transform::{TransformChain, TransformParameters};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSetRecord {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub canvas: CanvasSize,
    pub status: SetStatus,
    /// Union of the registered images' clamped boxes.
    pub bbox: Option<PixelBox>,
    /// Member images in set order, which is also the compositing order.
    pub images: Vec<Uuid>,
    pub composite_runs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub set_id: Uuid,
    pub path: PathBuf,
    pub status: ImageStatus,
    pub native_width: usize,
    pub native_height: usize,
    pub pixel_size_nm: Option<f64>,
    pub channels: Vec<String>,
    pub registration: Option<RegistrationRecord>,
    pub diagnostic: Option<Diagnostic>,
    /// Landmark revision of the attempt that ended in `REGISTRATION_ISSUE`.
    pub last_failed_revision: Option<u64>,
}

impl ImageRecord {
    pub fn mirrored(&self) -> Option<bool> {
        self.registration.as_ref().map(|r| r.parameters.mirrored)
    }
}

/// Everything persisted for one successful registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub parameters: TransformParameters,
    pub chain: TransformChain,
    pub geometry: CanvasGeometry,
    /// Clamped box corners: top-left, top-right, bottom-right, bottom-left.
    pub corners: [(i64, i64); 4],
    pub landmark_revision: u64,
    pub max_residual_px: f64,
}
