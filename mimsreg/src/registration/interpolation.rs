//! Point sampling of native rasters in continuous pixel-edge coordinates.
//!
//! A continuous point `p` falls inside cell `floor(p)`; cell centres sit at
//! `+0.5`. Bilinear sampling interpolates between the four nearest centres
//! and replicates edge pixels for points between the outermost centre and
//! the raster border.

use common::Buffer2;

use crate::geometry::{Point2D, containing_cell};
use crate::registration::config::InterpolationMethod;

/// Pixel with coordinates clamped into the raster (edge replication).
#[inline]
fn clamped_pixel(data: &Buffer2<f32>, x: i64, y: i64) -> f32 {
    let cx = x.clamp(0, data.width() as i64 - 1) as usize;
    let cy = y.clamp(0, data.height() as i64 - 1) as usize;
    data[(cx, cy)]
}

/// True when `p` lies in `[0, width) x [0, height)`.
#[inline]
pub fn inside_extent(p: Point2D, width: usize, height: usize) -> bool {
    p.x >= 0.0 && p.y >= 0.0 && p.x < width as f64 && p.y < height as f64
}

/// Value of the cell containing `p`, edge-clamped.
#[inline]
pub fn sample_nearest(data: &Buffer2<f32>, p: Point2D) -> f32 {
    let (x, y) = containing_cell(p);
    clamped_pixel(data, x, y)
}

#[inline]
pub fn sample_bilinear(data: &Buffer2<f32>, p: Point2D) -> f32 {
    // Shift to centre-based coordinates.
    let u = p.x - 0.5;
    let v = p.y - 0.5;
    let x0 = u.floor();
    let y0 = v.floor();
    let fx = (u - x0) as f32;
    let fy = (v - y0) as f32;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let p00 = clamped_pixel(data, x0, y0);
    let p10 = clamped_pixel(data, x0 + 1, y0);
    let p01 = clamped_pixel(data, x0, y0 + 1);
    let p11 = clamped_pixel(data, x0 + 1, y0 + 1);

    let top = p00 + fx * (p10 - p00);
    let bottom = p01 + fx * (p11 - p01);
    top + fy * (bottom - top)
}

#[inline]
pub fn sample(data: &Buffer2<f32>, p: Point2D, method: InterpolationMethod) -> f32 {
    match method {
        InterpolationMethod::Nearest => sample_nearest(data, p),
        InterpolationMethod::Bilinear => sample_bilinear(data, p),
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec2;

    use super::*;

    fn ramp() -> Buffer2<f32> {
        // value = 10 * x + y
        Buffer2::from_fn(4, 3, |x, y| 10.0 * x as f32 + y as f32)
    }

    #[test]
    fn test_bilinear_hits_pixel_centres_exactly() {
        let data = ramp();
        for y in 0..3 {
            for x in 0..4 {
                let p = DVec2::new(x as f64 + 0.5, y as f64 + 0.5);
                assert_eq!(sample_bilinear(&data, p), data[(x, y)]);
            }
        }
    }

    #[test]
    fn test_bilinear_interpolates_between_centres() {
        let data = ramp();
        let v = sample_bilinear(&data, DVec2::new(1.0, 1.0));
        // Halfway between columns 0 and 1, rows 0 and 1.
        assert!((v - 5.5).abs() < 1e-6);
    }

    #[test]
    fn test_edges_replicate() {
        let data = ramp();
        assert_eq!(sample_bilinear(&data, DVec2::new(0.1, 0.1)), 0.0);
        assert_eq!(sample_bilinear(&data, DVec2::new(3.99, 2.99)), 32.0);
        assert_eq!(sample_nearest(&data, DVec2::new(-3.0, 1.2)), 1.0);
    }

    #[test]
    fn test_nearest_uses_containing_cell() {
        let data = ramp();
        assert_eq!(sample_nearest(&data, DVec2::new(2.99, 0.0)), 20.0);
        assert_eq!(sample(&data, DVec2::new(3.0, 2.5), InterpolationMethod::Nearest), 32.0);
    }

    #[test]
    fn test_inside_extent_is_half_open() {
        assert!(inside_extent(DVec2::new(0.0, 0.0), 4, 3));
        assert!(inside_extent(DVec2::new(3.999, 2.999), 4, 3));
        assert!(!inside_extent(DVec2::new(4.0, 1.0), 4, 3));
        assert!(!inside_extent(DVec2::new(1.0, -1e-9), 4, 3));
        assert!(!inside_extent(DVec2::new(f64::NAN, 1.0), 4, 3));
    }
}
