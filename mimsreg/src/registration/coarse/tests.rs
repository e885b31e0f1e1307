use super::*;
use crate::registration::transform::TransformChain;
use crate::testing::{map_points, scattered_points};

fn chain(mirrored: bool) -> TransformChain {
    TransformChain::coarse(
        SimilarityTransform::new(2.5, 0.35, DVec2::new(700.0, 420.0)),
        mirrored,
        256,
        256,
    )
}

#[test]
fn test_estimate_similarity_recovers_parameters() {
    let truth = SimilarityTransform::new(1.8, -0.7, DVec2::new(12.0, 99.0));
    let src = scattered_points(12, 256.0, 256.0, 3);
    let tgt: Vec<_> = src.iter().map(|&p| truth.apply(p)).collect();
    let est = estimate_similarity(&src, &tgt).unwrap();
    assert!((est.scale - truth.scale).abs() < 1e-9);
    assert!((est.rotation - truth.rotation).abs() < 1e-9);
    assert!((est.translation - truth.translation).length() < 1e-6);
}

#[test]
fn test_estimate_similarity_rejects_coincident_points() {
    let src = vec![DVec2::splat(5.0); 4];
    let tgt = scattered_points(4, 10.0, 10.0, 1);
    assert!(estimate_similarity(&src, &tgt).is_none());
}

#[test]
fn test_unmirrored_data_keeps_no_mirror() {
    let truth = chain(false);
    let native = scattered_points(8, 256.0, 256.0, 11);
    let em = map_points(&native, |p| truth.forward(p));
    let fit = solve_coarse(
        &LandmarkSet::from_points(native, em),
        256,
        &CoarseConfig::default(),
    )
    .unwrap();
    assert!(!fit.mirrored);
    assert!(fit.sse <= fit.rejected_sse);
    assert!(fit.sse < 1e-12);
    assert!((fit.similarity.scale - 2.5).abs() < 1e-9);
}

#[test]
fn test_mirrored_data_selects_mirror() {
    let truth = chain(true);
    let native = scattered_points(8, 256.0, 256.0, 5);
    let em = map_points(&native, |p| truth.forward(p));
    let fit = solve_coarse(
        &LandmarkSet::from_points(native.clone(), em),
        256,
        &CoarseConfig::default(),
    )
    .unwrap();
    assert!(fit.mirrored);
    assert!(fit.sse < fit.rejected_sse);

    let recovered = TransformChain::coarse(fit.similarity, true, 256, 256);
    for p in native {
        assert!((recovered.forward(p) - truth.forward(p)).length() < 1e-6);
    }
}

#[test]
fn test_tie_resolves_to_no_mirror() {
    // Points on the mirror axis are unchanged by mirroring: identical residuals.
    let native = vec![
        DVec2::new(128.0, 10.0),
        DVec2::new(128.0, 50.0),
        DVec2::new(128.0, 200.0),
    ];
    let em = vec![
        DVec2::new(300.0, 20.0),
        DVec2::new(301.0, 100.0),
        DVec2::new(299.0, 400.0),
    ];
    let fit = solve_coarse(
        &LandmarkSet::from_points(native, em),
        256,
        &CoarseConfig::default(),
    )
    .unwrap();
    assert!(!fit.mirrored);
    assert_eq!(fit.sse, fit.rejected_sse);
}

#[test]
fn test_mirror_tie_is_relative() {
    // Large residual sums a fraction of a pixel apart are a tie.
    assert!(!mirror_wins(1.0e6, 1.0e6 - 0.5, 1e-6));
    assert!(mirror_wins(1.0e6, 1.0e6 - 2.0, 1e-6));
    assert!(!mirror_wins(0.0, 0.0, 1e-6));
    assert!(mirror_wins(50.0, 1e-12, 1e-6));
    assert!(!mirror_wins(1e-12, 50.0, 1e-6));
}

#[test]
fn test_two_landmarks_are_insufficient() {
    let set = LandmarkSet::from_points(
        vec![DVec2::ZERO, DVec2::ONE],
        vec![DVec2::ZERO, DVec2::ONE],
    );
    let err = solve_coarse(&set, 10, &CoarseConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::InsufficientLandmarks {
            found: 2,
            required: 3
        }
    ));
}

#[test]
fn test_coincident_landmarks_are_degenerate() {
    let set = LandmarkSet::from_points(vec![DVec2::splat(4.0); 3], scattered_points(3, 50.0, 50.0, 2));
    let err = solve_coarse(&set, 10, &CoarseConfig::default()).unwrap_err();
    assert!(matches!(err, RegistrationError::DegenerateTransform(_)));
}

#[test]
fn test_polygon_centroids_count_as_landmarks() {
    let truth = chain(false);
    let polys = crate::testing::blob_polygons(3, 256.0, 256.0, 9);
    let em: Vec<_> = polys.iter().map(|p| p.map(|v| truth.forward(v))).collect();
    let fit = solve_coarse(
        &LandmarkSet::from_polygons(polys, em),
        256,
        &CoarseConfig::default(),
    )
    .unwrap();
    assert!(!fit.mirrored);
    assert!((fit.similarity.rotation - 0.35).abs() < 1e-9);
}
