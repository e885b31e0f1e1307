use glam::DVec2;

use super::*;
use crate::geometry::CanvasSize;
use crate::registration::canvas::resolve_geometry;
use crate::registration::transform::SimilarityTransform;
use crate::testing::{constant_raster, gradient_raster};

fn similarity_chain(
    scale: f64,
    rotation: f64,
    translation: DVec2,
    mirrored: bool,
    width: usize,
    height: usize,
) -> TransformChain {
    TransformChain::coarse(
        SimilarityTransform::new(scale, rotation, translation),
        mirrored,
        width,
        height,
    )
}

fn warp(
    chain: &TransformChain,
    canvas: CanvasSize,
    native: &Buffer2<f32>,
    method: InterpolationMethod,
) -> ChannelPatch {
    let geometry = resolve_geometry(chain, canvas).unwrap();
    warp_channel(chain, &geometry, "12C", native, method).unwrap()
}

#[test]
fn test_translation_copies_pixels() {
    let native = gradient_raster(8, 6);
    let chain = similarity_chain(1.0, 0.0, DVec2::new(10.0, 20.0), false, 8, 6);
    let patch = warp(&chain, CanvasSize::new(100, 100), &native, InterpolationMethod::Bilinear);

    assert_eq!(patch.bbox, PixelBox::new(10, 20, 18, 26));
    assert_eq!(patch.offset(), (10, 20));
    assert!(patch.valid.all());
    assert_eq!(patch.data, native);
    assert_eq!(patch.channel, "12C");
}

#[test]
fn test_mirror_flips_columns() {
    let native = gradient_raster(8, 6);
    let chain = similarity_chain(1.0, 0.0, DVec2::ZERO, true, 8, 6);
    let patch = warp(&chain, CanvasSize::new(50, 50), &native, InterpolationMethod::Bilinear);

    assert_eq!(patch.bbox, PixelBox::new(0, 0, 8, 6));
    for y in 0..6 {
        for x in 0..8 {
            assert_eq!(patch.data[(x, y)], native[(7 - x, y)]);
        }
    }
}

#[test]
fn test_mirror_agrees_with_forward_chain() {
    // The canvas cell reached by a native pixel centre holds that pixel's value.
    let native = gradient_raster(10, 10);
    let chain = similarity_chain(1.0, 0.0, DVec2::new(40.0, 5.0), true, 10, 10);
    let patch = warp(&chain, CanvasSize::new(100, 100), &native, InterpolationMethod::Nearest);
    let origin = patch.offset();

    for (col, row) in [(2usize, 3usize), (5, 5), (7, 1)] {
        let canvas = chain.forward(pixel_center(RasterIndex::new(row, col)));
        let local = crate::geometry::canvas_to_local(canvas, origin);
        let (x, y) = (local.x.floor() as usize, local.y.floor() as usize);
        assert!(patch.valid.get_xy(x, y));
        assert_eq!(patch.data[(x, y)], native[(col, row)]);
    }
}

#[test]
fn test_upscale_with_nearest() {
    let native = gradient_raster(4, 4);
    let chain = similarity_chain(2.0, 0.0, DVec2::ZERO, false, 4, 4);
    let patch = warp(&chain, CanvasSize::new(64, 64), &native, InterpolationMethod::Nearest);

    assert_eq!(patch.data.width(), 8);
    assert_eq!(patch.data.height(), 8);
    for y in 0..8 {
        for x in 0..8 {
            assert_eq!(patch.data[(x, y)], native[(x / 2, y / 2)]);
        }
    }
}

#[test]
fn test_clamped_footprint_keeps_alignment() {
    let native = gradient_raster(8, 8);
    let chain = similarity_chain(1.0, 0.0, DVec2::new(-3.0, 0.0), false, 8, 8);
    let patch = warp(&chain, CanvasSize::new(20, 20), &native, InterpolationMethod::Bilinear);

    assert_eq!(patch.bbox, PixelBox::new(0, 0, 5, 8));
    assert_eq!(patch.data[(0, 0)], native[(3, 0)]);
    assert_eq!(patch.data[(4, 7)], native[(7, 7)]);
}

#[test]
fn test_rotation_marks_uncovered_cells_invalid() {
    let native = constant_raster(20, 20, 7.0);
    let chain = similarity_chain(
        1.0,
        std::f64::consts::FRAC_PI_4,
        DVec2::new(50.0, 20.0),
        false,
        20,
        20,
    );
    let patch = warp(&chain, CanvasSize::new(100, 100), &native, InterpolationMethod::Bilinear);

    let valid = patch.valid_count();
    assert!((330..=470).contains(&valid), "valid cells {valid}");
    assert!(!patch.valid.all());
    for (i, &v) in patch.data.iter().enumerate() {
        if patch.valid.get(i) {
            assert_eq!(v, 7.0);
        } else {
            assert_eq!(v, 0.0);
        }
    }
}

#[test]
fn test_map_is_reused_across_channels() {
    let chain = similarity_chain(1.5, 0.1, DVec2::new(12.0, 7.0), false, 16, 12);
    let geometry = resolve_geometry(&chain, CanvasSize::new(80, 80)).unwrap();
    let map = WarpMap::build(&chain, &geometry);

    let a = map
        .apply("12C", &constant_raster(16, 12, 1.0), InterpolationMethod::Bilinear)
        .unwrap();
    let b = map
        .apply("13C", &gradient_raster(16, 12), InterpolationMethod::Bilinear)
        .unwrap();
    assert_eq!(a.valid, b.valid);
    assert_eq!(a.bbox, map.bbox());
    assert_eq!(map.valid(), &a.valid);
}

#[test]
fn test_empty_and_mismatched_channels() {
    let chain = similarity_chain(1.0, 0.0, DVec2::ZERO, false, 8, 8);
    let geometry = resolve_geometry(&chain, CanvasSize::new(20, 20)).unwrap();
    let map = WarpMap::build(&chain, &geometry);

    let empty = Buffer2::new(0, 0, Vec::new());
    assert!(matches!(
        map.apply("12C", &empty, InterpolationMethod::Bilinear),
        Err(RegistrationError::EmptyChannel(name)) if name == "12C"
    ));
    assert!(matches!(
        map.apply("12C", &constant_raster(4, 8, 1.0), InterpolationMethod::Bilinear),
        Err(RegistrationError::InvalidFile(_))
    ));
}

#[test]
fn test_zero_width_footprint_builds_empty_map() {
    let chain = similarity_chain(1.0, 0.0, DVec2::new(10.0, 10.0), false, 8, 8);
    let sliver = PixelBox::new(10, 10, 10, 18);
    let geometry = CanvasGeometry {
        precrop: sliver,
        clamped: sliver,
    };
    let map = WarpMap::build(&chain, &geometry);
    assert_eq!(map.valid().count_ones(), 0);

    let patch = map
        .apply("12C", &constant_raster(8, 8, 3.0), InterpolationMethod::Bilinear)
        .unwrap();
    assert_eq!(patch.data.width(), 0);
    assert_eq!(patch.valid_count(), 0);
}
