//! Transform chain from MIMS native pixels to canvas pixels.
//!
//! Forward: `canvas = D(S(M(native)))` where `M` is the optional mirror,
//! `S` the similarity and `D` the optional local deformation.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::geometry::{Point2D, mirror_x, raster_corners};
use crate::math::DMat3;
use crate::registration::deformation::LocalDeformation;
use crate::registration::error::RegistrationError;

/// Coordinates beyond this magnitude are treated as a runaway transform.
const MAX_COORDINATE: f64 = 1e7;

/// Uniform scale, rotation, then translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityTransform {
    pub scale: f64,
    /// Radians; positive turns +x towards +y.
    pub rotation: f64,
    pub translation: DVec2,
}

impl Default for SimilarityTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Display for SimilarityTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Similarity(dx={:.2}, dy={:.2}, rot={:.3}°, scale={:.4})",
            self.translation.x,
            self.translation.y,
            self.rotation_degrees(),
            self.scale
        )
    }
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: 0.0,
            translation: DVec2::ZERO,
        }
    }

    pub fn new(scale: f64, rotation: f64, translation: DVec2) -> Self {
        Self {
            scale,
            rotation,
            translation,
        }
    }

    pub fn matrix(&self) -> DMat3 {
        let (sin, cos) = self.rotation.sin_cos();
        let a = self.scale * cos;
        let c = self.scale * sin;
        DMat3::from_array([
            a,
            -c,
            self.translation.x,
            c,
            a,
            self.translation.y,
            0.0,
            0.0,
            1.0,
        ])
    }

    #[inline]
    pub fn apply(&self, p: Point2D) -> Point2D {
        let (sin, cos) = self.rotation.sin_cos();
        DVec2::new(
            self.scale * (cos * p.x - sin * p.y) + self.translation.x,
            self.scale * (sin * p.x + cos * p.y) + self.translation.y,
        )
    }

    #[inline]
    pub fn apply_inverse(&self, p: Point2D) -> Point2D {
        let (sin, cos) = self.rotation.sin_cos();
        let d = p - self.translation;
        DVec2::new(
            (cos * d.x + sin * d.y) / self.scale,
            (-sin * d.x + cos * d.y) / self.scale,
        )
    }

    /// `atan2(m10, m00)` of the matrix in degrees, normalized to (-180, 180].
    pub fn rotation_degrees(&self) -> f64 {
        let m = self.matrix();
        let m = m.as_array();
        normalize_degrees(m[3].atan2(m[0]).to_degrees())
    }

    pub fn is_valid(&self) -> bool {
        self.scale.is_finite()
            && self.scale > 1e-10
            && self.rotation.is_finite()
            && self.translation.is_finite()
    }
}

fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped > 180.0 { wrapped - 360.0 } else { wrapped }
}

/// Persisted form of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformParameters {
    pub scale: f64,
    pub rotation_degrees: f64,
    pub translation_x: f64,
    pub translation_y: f64,
    pub mirrored: bool,
    /// Opaque JSON of the local deformation, if any.
    pub local_deformation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformChain {
    pub similarity: SimilarityTransform,
    pub mirrored: bool,
    pub native_width: usize,
    pub native_height: usize,
    pub local: Option<LocalDeformation>,
}

impl TransformChain {
    pub fn coarse(
        similarity: SimilarityTransform,
        mirrored: bool,
        native_width: usize,
        native_height: usize,
    ) -> Self {
        Self {
            similarity,
            mirrored,
            native_width,
            native_height,
            local: None,
        }
    }

    pub fn with_local(mut self, local: Option<LocalDeformation>) -> Self {
        self.local = local;
        self
    }

    /// Native point to mirrored space (identity when not mirrored).
    #[inline]
    pub fn native_to_mirrored(&self, p: Point2D) -> Point2D {
        if self.mirrored {
            mirror_x(p, self.native_width as f64)
        } else {
            p
        }
    }

    #[inline]
    pub fn native_to_coarse(&self, p: Point2D) -> Point2D {
        self.similarity.apply(self.native_to_mirrored(p))
    }

    /// Canvas point to coarse space, undoing the local deformation only.
    #[inline]
    pub fn canvas_to_coarse(&self, p: Point2D) -> Point2D {
        match &self.local {
            Some(local) => local.inverse(p),
            None => p,
        }
    }

    /// Canvas point to mirrored space, where a pre-flipped native raster is sampled.
    #[inline]
    pub fn canvas_to_mirrored(&self, p: Point2D) -> Point2D {
        self.similarity.apply_inverse(self.canvas_to_coarse(p))
    }

    pub fn forward(&self, p: Point2D) -> Point2D {
        let coarse = self.native_to_coarse(p);
        match &self.local {
            Some(local) => local.forward(coarse),
            None => coarse,
        }
    }

    pub fn inverse(&self, p: Point2D) -> Point2D {
        self.native_to_mirrored(self.canvas_to_mirrored(p))
    }

    pub fn native_corners(&self) -> [Point2D; 4] {
        raster_corners(self.native_width, self.native_height)
    }

    /// Corners of the native raster mapped to the canvas.
    pub fn canvas_corners(&self) -> [Point2D; 4] {
        self.native_corners().map(|c| self.forward(c))
    }

    /// Rejects chains whose native corners do not land on a bounded, finite,
    /// non-collapsed quadrilateral.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if !self.similarity.is_valid() {
            return Err(RegistrationError::DegenerateTransform(format!(
                "invalid similarity {}",
                self.similarity
            )));
        }
        if self.native_width == 0 || self.native_height == 0 {
            return Err(RegistrationError::DegenerateTransform(format!(
                "empty native raster {}x{}",
                self.native_width, self.native_height
            )));
        }
        let corners = self.canvas_corners();
        if corners
            .iter()
            .any(|c| !c.is_finite() || c.abs().max_element() > MAX_COORDINATE)
        {
            return Err(RegistrationError::DegenerateTransform(format!(
                "corners map to unbounded positions {corners:?}"
            )));
        }
        let area = quad_area(&corners);
        if area.abs() < 1e-6 {
            return Err(RegistrationError::DegenerateTransform(
                "corners collapse to zero area".to_string(),
            ));
        }
        Ok(())
    }

    pub fn parameters(&self) -> Result<TransformParameters, RegistrationError> {
        let local_deformation = match &self.local {
            Some(local) => Some(serde_json::to_string(local)?),
            None => None,
        };
        Ok(TransformParameters {
            scale: self.similarity.scale,
            rotation_degrees: self.similarity.rotation_degrees(),
            translation_x: self.similarity.translation.x,
            translation_y: self.similarity.translation.y,
            mirrored: self.mirrored,
            local_deformation,
        })
    }
}

/// Shoelace area of a quadrilateral.
fn quad_area(q: &[Point2D; 4]) -> f64 {
    (0..4)
        .map(|i| {
            let a = q[i];
            let b = q[(i + 1) % 4];
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
        * 0.5
}
