//! Row-major 3x3 matrix for 2D homogeneous transforms.

use glam::DVec2;
use std::ops::Mul;

/// ```text
/// | m[0] m[1] m[2] |   | a  b  tx |
/// | m[3] m[4] m[5] | = | c  d  ty |
/// | m[6] m[7] m[8] |   | 0  0  1  |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DMat3 {
    data: [f64; 9],
}

impl DMat3 {
    #[inline]
    pub const fn from_array(data: [f64; 9]) -> Self {
        Self { data }
    }

    #[inline]
    pub const fn identity() -> Self {
        Self {
            data: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }

    /// Horizontal mirror `x' = width - x`.
    #[inline]
    pub const fn mirror_x(width: f64) -> Self {
        Self {
            data: [-1.0, 0.0, width, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }

    #[inline]
    pub const fn as_array(&self) -> &[f64; 9] {
        &self.data
    }

    pub fn mul_mat(&self, rhs: &DMat3) -> DMat3 {
        let a = &self.data;
        let b = &rhs.data;
        let mut out = [0.0; 9];
        for row in 0..3 {
            for col in 0..3 {
                out[row * 3 + col] = a[row * 3] * b[col]
                    + a[row * 3 + 1] * b[3 + col]
                    + a[row * 3 + 2] * b[6 + col];
            }
        }
        DMat3 { data: out }
    }

    #[inline]
    pub fn determinant(&self) -> f64 {
        let d = &self.data;
        d[0] * (d[4] * d[8] - d[5] * d[7]) - d[1] * (d[3] * d[8] - d[5] * d[6])
            + d[2] * (d[3] * d[7] - d[4] * d[6])
    }

    /// `None` when the determinant is below 1e-12.
    pub fn inverse(&self) -> Option<DMat3> {
        let det = self.determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let d = &self.data;
        Some(DMat3 {
            data: [
                (d[4] * d[8] - d[5] * d[7]) * inv_det,
                (d[2] * d[7] - d[1] * d[8]) * inv_det,
                (d[1] * d[5] - d[2] * d[4]) * inv_det,
                (d[5] * d[6] - d[3] * d[8]) * inv_det,
                (d[0] * d[8] - d[2] * d[6]) * inv_det,
                (d[2] * d[3] - d[0] * d[5]) * inv_det,
                (d[3] * d[7] - d[4] * d[6]) * inv_det,
                (d[1] * d[6] - d[0] * d[7]) * inv_det,
                (d[0] * d[4] - d[1] * d[3]) * inv_det,
            ],
        })
    }

    /// Applies the matrix to a point, dividing by w.
    #[inline]
    pub fn transform_point(&self, p: DVec2) -> DVec2 {
        let d = &self.data;
        let x = d[0] * p.x + d[1] * p.y + d[2];
        let y = d[3] * p.x + d[4] * p.y + d[5];
        let w = d[6] * p.x + d[7] * p.y + d[8];
        DVec2::new(x / w, y / w)
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

impl Default for DMat3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for DMat3 {
    type Output = DMat3;

    #[inline]
    fn mul(self, rhs: DMat3) -> DMat3 {
        self.mul_mat(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_inverse() {
        assert_eq!(DMat3::identity().inverse(), Some(DMat3::identity()));
    }

    #[test]
    fn test_mirror_is_involution() {
        let m = DMat3::mirror_x(256.0);
        assert_eq!(m * m, DMat3::identity());
        let p = m.transform_point(DVec2::new(10.0, 3.0));
        assert_eq!(p, DVec2::new(246.0, 3.0));
        assert!(m.determinant() < 0.0);
    }

    #[test]
    fn test_inverse_of_affine() {
        let m = DMat3::from_array([2.0, -1.0, 5.0, 1.0, 2.0, -3.0, 0.0, 0.0, 1.0]);
        let inv = m.inverse().unwrap();
        let p = DVec2::new(7.5, -2.25);
        let back = inv.transform_point(m.transform_point(p));
        assert!((back - p).length() < 1e-12);
    }

    #[test]
    fn test_singular_has_no_inverse() {
        let m = DMat3::from_array([1.0, 2.0, 0.0, 2.0, 4.0, 0.0, 0.0, 0.0, 1.0]);
        assert!(m.inverse().is_none());
    }

    #[test]
    fn test_mul_applies_right_first() {
        let translate = DMat3::from_array([1.0, 0.0, 10.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        let scale = DMat3::from_array([2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0]);
        let p = (translate * scale).transform_point(DVec2::new(1.0, 1.0));
        assert_eq!(p, DVec2::new(12.0, 2.0));
    }
}
