use super::*;
use crate::geometry::{containing_cell, pixel_center};
use crate::testing::{Lcg, init_tracing};

const SIZE: usize = 24;
const BRIGHT: f32 = 200.0;
const DIM: f32 = 20.0;

/// Asymmetric L with a tab, so every rotation and mirror is distinguishable.
fn pattern() -> Buffer2<f32> {
    Buffer2::from_fn(SIZE, SIZE, |x, y| {
        let on = (x < 8 && y < 20) || (y >= 16 && x < 20) || (x >= 18 && y < 5);
        if on { BRIGHT } else { DIM }
    })
}

/// Canvas showing `mims` through `truth`, with bright clutter elsewhere.
fn canvas_through(truth: &TransformChain, mims: &Buffer2<f32>, size: usize) -> Buffer2<f32> {
    let mut rng = Lcg::new(11);
    Buffer2::from_fn(size, size, |x, y| {
        let clutter = if rng.next_f64() < 0.15 { BRIGHT } else { DIM };
        let native = truth.inverse(pixel_center(RasterIndex::new(y, x)));
        if inside_extent(native, mims.width(), mims.height()) {
            let (nx, ny) = containing_cell(native);
            mims[(nx as usize, ny as usize)]
        } else {
            clutter
        }
    })
}

fn search_config() -> EstimateConfig {
    EstimateConfig {
        stride_px: 4,
        min_valid_px: 200,
        min_union_px: 20,
        ..Default::default()
    }
}

/// Rotated 90 degrees and mirrored, top-left of the footprint at (58, 30).
fn truth() -> TransformChain {
    TransformChain::coarse(
        SimilarityTransform::new(1.0, 90f64.to_radians(), DVec2::new(82.0, 30.0)),
        true,
        SIZE,
        SIZE,
    )
}

#[test]
fn test_search_recovers_rotation_mirror_and_offset() {
    init_tracing();
    let mims = pattern();
    let canvas = canvas_through(&truth(), &mims, 120);

    let candidates = estimate_alignment(&canvas, &mims, 1.0, &search_config()).unwrap();
    assert!(!candidates.is_empty() && candidates.len() <= 3);
    let best = &candidates[0];
    assert_eq!(best.source, EstimateSource::Initial);
    assert!(best.mirrored);
    assert!((best.similarity.rotation_degrees() - 90.0).abs() < 1e-9);
    assert!(best.similarity.translation.distance(DVec2::new(82.0, 30.0)) < 1e-6);
    assert_eq!(best.iou, 1.0);
    for pair in candidates.windows(2) {
        assert!(pair[0].iou >= pair[1].iou);
    }

    let chain = best.chain(SIZE, SIZE);
    let corner = DVec2::new(3.0, 7.0);
    assert!(chain.forward(corner).distance(truth().forward(corner)) < 1e-6);
}

#[test]
fn test_known_orientation_searches_one_hypothesis() {
    let mims = pattern();
    let canvas = canvas_through(&truth(), &mims, 120);

    let candidates =
        estimate_with_orientation(&canvas, &mims, 1.0, 90.0, true, &search_config()).unwrap();
    let best = &candidates[0];
    assert_eq!(best.source, EstimateSource::FromSet);
    assert!(candidates.iter().all(|c| c.mirrored));
    assert!(best.similarity.translation.distance(DVec2::new(82.0, 30.0)) < 1e-6);
}

#[test]
fn test_scaled_canvas_scales_translation() {
    let mims = pattern();
    let truth = TransformChain::coarse(
        SimilarityTransform::new(2.0, 0.0, DVec2::new(64.0, 48.0)),
        false,
        SIZE,
        SIZE,
    );
    let canvas = canvas_through(&truth, &mims, 160);

    let config = EstimateConfig {
        stride_px: 2,
        ..search_config()
    };
    let candidates = estimate_with_orientation(&canvas, &mims, 2.0, 0.0, false, &config).unwrap();
    let best = &candidates[0];
    assert_eq!(best.similarity.scale, 2.0);
    assert!(
        best.similarity.translation.distance(DVec2::new(64.0, 48.0)) <= 6.0,
        "{}",
        best.similarity
    );
}

#[test]
fn test_uniform_rasters_yield_no_candidates() {
    let canvas = Buffer2::new_filled(60, 60, BRIGHT);
    let mims = Buffer2::new_filled(SIZE, SIZE, BRIGHT);
    let candidates = estimate_with_orientation(&canvas, &mims, 1.0, 0.0, false, &search_config())
        .unwrap();
    assert!(candidates.is_empty());
}

#[test]
fn test_invalid_inputs_are_rejected() {
    let mims = pattern();
    let empty = Buffer2::new(0, 0, Vec::new());
    assert!(matches!(
        estimate_alignment(&empty, &mims, 1.0, &search_config()),
        Err(RegistrationError::InvalidFile(_))
    ));
    assert!(matches!(
        estimate_alignment(&mims, &mims, 0.0, &search_config()),
        Err(RegistrationError::DegenerateTransform(_))
    ));
    assert_eq!(pixel_scale(50.0, 25.0), Some(2.0));
    assert_eq!(pixel_scale(50.0, 0.0), None);
}

#[test]
fn test_threshold_uses_percentile_minus_buffer() {
    let raster = Buffer2::new(10, 1, (0..10).map(|v| v as f32 * 10.0).collect());
    // 90th percentile of 0..=90 is 81; minus 10 leaves 71.
    let mask = threshold_mask(&raster, 90.0, 10.0);
    let on: Vec<bool> = mask.iter().collect();
    assert_eq!(on.iter().filter(|&&b| b).count(), 2);
    assert!(on[8] && on[9] && !on[7]);
}

#[test]
fn test_mask_iou() {
    let a = BitBuffer2::from_fn(4, 4, |x, _| x < 2);
    let b = BitBuffer2::from_fn(4, 4, |x, _| x >= 1 && x < 3);
    assert_eq!(mask_iou(&a, &b), Some(4.0 / 12.0));
    assert_eq!(mask_iou(&a, &a), Some(1.0));
    assert_eq!(mask_iou(&BitBuffer2::new_default(4, 4), &BitBuffer2::new_default(4, 4)), None);
    assert_eq!(mask_iou(&a, &BitBuffer2::new_default(3, 4)), None);
}

#[test]
fn test_near_duplicates_share_a_slot() {
    let mut top = TopCandidates::new(&EstimateConfig::default());
    let at = |x: f64, rotation_deg: f64, iou: f64| Scored {
        offset: DVec2::new(x, 0.0),
        anchor: DVec2::ZERO,
        rotation_deg,
        mirrored: false,
        iou,
    };
    top.offer(at(0.0, 0.0, 0.5));
    top.offer(at(10.0, 345.0, 0.7));
    assert_eq!(top.entries.len(), 1);
    assert_eq!(top.entries[0].iou, 0.7);
    top.offer(at(20.0, 0.0, 0.6));
    assert_eq!(top.entries.len(), 1);

    top.offer(at(100.0, 0.0, 0.4));
    top.offer(at(200.0, 0.0, 0.9));
    top.offer(at(300.0, 0.0, 0.3));
    let ious: Vec<f64> = top.entries.iter().map(|e| e.iou).collect();
    assert_eq!(ious, vec![0.9, 0.7, 0.4]);
}

#[test]
fn test_alignment_from_set_follows_stage_offset() {
    let mims_px_nm = 50.0;
    for mirrored in [false, true] {
        let reference = TransformChain::coarse(
            SimilarityTransform::new(2.0, 0.3, DVec2::new(400.0, 250.0)),
            mirrored,
            256,
            256,
        );
        let reference_stage = DVec2::new(100.0, 200.0);
        let stage = DVec2::new(104.0, 198.5);
        let candidate =
            alignment_from_set(&reference, reference_stage, stage, mims_px_nm, 200).unwrap();
        assert_eq!(candidate.source, EstimateSource::FromSet);
        assert_eq!(candidate.mirrored, mirrored);

        // A native pixel of the new image sees the same sample point as the
        // reference pixel offset by the stage delta.
        let delta = (stage - reference_stage) * 1000.0 / mims_px_nm;
        let placed = candidate.chain(200, 180);
        for p in [DVec2::ZERO, DVec2::new(37.0, 120.0), DVec2::new(199.0, 5.0)] {
            let expected = reference.forward(p + delta);
            assert!(placed.forward(p).distance(expected) < 1e-6, "{mirrored} {p:?}");
        }
    }
}
