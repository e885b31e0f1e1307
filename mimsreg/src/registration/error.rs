//! Error types for registration, warping and compositing.

use thiserror::Error;
use uuid::Uuid;

use crate::geometry::{CanvasSize, PixelBox};

/// Failure reported by a [`ChannelSource`](crate::ChannelSource).
#[derive(Debug, Error)]
pub enum ChannelSourceError {
    /// The file cannot be decoded; retrying will not help.
    #[error("Unreadable channel '{channel}': {message}")]
    Unreadable { channel: String, message: String },

    /// Storage hiccup; the load may succeed on retry.
    #[error("Transient failure loading channel '{channel}': {message}")]
    Transient { channel: String, message: String },

    #[error("Channel '{0}' not present in file")]
    MissingChannel(String),
}

impl ChannelSourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelSourceError::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Insufficient landmarks: found {found} correspondences, need {required}")]
    InsufficientLandmarks { found: usize, required: usize },

    #[error("Landmark {kind} count mismatch: {mims} in MIMS space, {em} in EM space")]
    LandmarkCountMismatch {
        kind: &'static str,
        mims: usize,
        em: usize,
    },

    #[error("Degenerate transform: {0}")]
    DegenerateTransform(String),

    #[error("Landmark residual too large: {max_residual:.2} px (limit {limit:.2} px)")]
    ResidualTooLarge { max_residual: f64, limit: f64 },

    #[error(
        "Warped image {bbox} does not overlap canvas {}x{}",
        .canvas.width,
        .canvas.height
    )]
    OutsideCanvas { bbox: PixelBox, canvas: CanvasSize },

    #[error("Channel '{0}' is empty")]
    EmptyChannel(String),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Failed to load channel '{channel}' after {attempts} attempt(s): {source}")]
    ChannelLoad {
        channel: String,
        attempts: u32,
        #[source]
        source: ChannelSourceError,
    },

    #[error("Cannot composite: {pending} image(s) still pending")]
    CompositingPrecondition { pending: usize },

    #[error("Compositing channel '{channel}' failed: {message}")]
    CompositeChannel { channel: String, message: String },

    #[error("Image {0} is not preprocessed yet")]
    NotPreprocessed(Uuid),

    #[error("Image {0} is already registering")]
    AlreadyRegistering(Uuid),

    #[error("Image {0} is in terminal status {1}")]
    TerminalStatus(Uuid, String),

    #[error("Image {image} cannot be {action} from status {status}")]
    InvalidTransition {
        image: Uuid,
        status: String,
        action: &'static str,
    },

    #[error("Landmarks for image {image} unchanged since failed attempt (revision {revision})")]
    LandmarksUnchanged { image: Uuid, revision: u64 },

    #[error("Unknown image {0}")]
    UnknownImage(Uuid),

    #[error("Unknown image set {0}")]
    UnknownImageSet(Uuid),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistrationError {
    /// Errors that classify the image rather than leaving it untouched.
    pub fn diagnostic_kind(&self) -> DiagnosticKind {
        match self {
            RegistrationError::InsufficientLandmarks { .. } => DiagnosticKind::InsufficientLandmarks,
            RegistrationError::LandmarkCountMismatch { .. } => DiagnosticKind::LandmarkMismatch,
            RegistrationError::DegenerateTransform(_) => DiagnosticKind::DegenerateTransform,
            RegistrationError::ResidualTooLarge { .. } => DiagnosticKind::ResidualTooLarge,
            RegistrationError::OutsideCanvas { .. } => DiagnosticKind::OutsideCanvas,
            RegistrationError::EmptyChannel(_) => DiagnosticKind::EmptyChannel,
            RegistrationError::InvalidFile(_) => DiagnosticKind::InvalidFile,
            RegistrationError::ChannelLoad { source, .. } if !source.is_transient() => {
                DiagnosticKind::InvalidFile
            }
            RegistrationError::ChannelLoad { .. } => DiagnosticKind::TransientFailure,
            _ => DiagnosticKind::Other,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticKind {
    InsufficientLandmarks,
    LandmarkMismatch,
    DegenerateTransform,
    ResidualTooLarge,
    OutsideCanvas,
    EmptyChannel,
    InvalidFile,
    TransientFailure,
    Other,
}

/// Structured record of the last thing that went wrong for an image.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub max_residual_px: Option<f64>,
}

impl From<&RegistrationError> for Diagnostic {
    fn from(err: &RegistrationError) -> Self {
        let max_residual_px = match err {
            RegistrationError::ResidualTooLarge { max_residual, .. } => Some(*max_residual),
            _ => None,
        };
        Self {
            kind: err.diagnostic_kind(),
            message: err.to_string(),
            max_residual_px,
        }
    }
}
