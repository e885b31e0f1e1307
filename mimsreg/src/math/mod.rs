//! Small numeric helpers shared by the solvers.

mod dmat3;
pub mod filter;
pub mod linalg;

pub use dmat3::DMat3;

/// Arithmetic mean of a point cloud. `None` for an empty slice.
pub fn centroid(points: &[glam::DVec2]) -> Option<glam::DVec2> {
    if points.is_empty() {
        return None;
    }
    let sum: glam::DVec2 = points.iter().copied().sum();
    Some(sum / points.len() as f64)
}
