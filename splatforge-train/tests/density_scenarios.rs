mod common;

use common::{advance, engine_with, feedback, line_of_points, test_config};
use glam::Vec3;
use splatforge_train::config::SplitOpacity;
use splatforge_train::density::{DensityPhase, FrameFeedback};
use splatforge_train::store::{Attribute, EditPlan, sigmoid};
use splatforge_train::{EngineError, PointBatch, PointRow, TrainingEngine};

fn active_engine(points: usize) -> TrainingEngine {
    let mut engine = engine_with(test_config(), line_of_points(points, 1));
    advance(&mut engine, 11);
    assert_eq!(engine.phase(), DensityPhase::Active);
    engine
}

#[test]
fn test_small_high_gradient_points_are_cloned() {
    let mut engine = active_engine(1000);
    engine.observe(&feedback((0..600).collect(), 0.05)).unwrap();
    engine.observe(&feedback((600..650).collect(), 0.35)).unwrap();

    let event = engine.densify().unwrap();
    assert_eq!(event.cloned, 50);
    assert_eq!(event.split, 0);
    assert_eq!(event.pruned, 0);
    assert_eq!(event.points_after, 1050);
    assert_eq!(engine.len(), 1050);
    assert_eq!(engine.optimizer().len(), 1050);
    assert_eq!(engine.stats().len(), 1050);
    assert_eq!(engine.validate().unwrap(), 1050);
    assert_eq!(event.remap.appended(), 1000..1050);
}

#[test]
fn test_low_opacity_points_are_pruned() {
    let rows: Vec<PointRow> = (0..1050)
        .map(|i| {
            let opacity = if i % 50 == 7 && i < 1000 { 0.001 } else { 0.5 };
            PointRow::new(Vec3::new(i as f32 * 0.01, 0.0, 0.0), 0.01, opacity, 1)
        })
        .collect();
    let mut engine = engine_with(test_config(), PointBatch::from_rows(1, &rows).unwrap());
    advance(&mut engine, 11);

    let event = engine.prune().unwrap();
    assert_eq!(event.pruned, 20);
    assert_eq!(engine.len(), 1030);
    assert_eq!(engine.optimizer().len(), 1030);
    assert_eq!(engine.stats().len(), 1030);
    assert_eq!(event.remap.new_index(7), None);
    assert_eq!(event.remap.new_index(8), Some(7));
    assert!((0..engine.len()).all(|i| engine.store().opacity(i) >= 0.005));
}

#[test]
fn test_growth_ceiling_rejects_lowest_gradient_clones() {
    let config = test_config().with_growth_ceiling(1040);
    let mut engine = engine_with(config, line_of_points(1000, 1));
    advance(&mut engine, 11);
    let candidates: Vec<usize> = (600..650).collect();
    engine
        .observe(&FrameFeedback {
            grad_norms: candidates.iter().map(|&i| 0.3 + i as f32 * 1e-3).collect(),
            screen_radii: vec![1.0; candidates.len()],
            visible: candidates,
        })
        .unwrap();

    let event = engine.densify().unwrap();
    assert_eq!(event.cloned, 40);
    assert_eq!(event.rejected_clones, 10);
    assert_eq!(engine.len(), 1040);
    assert_eq!(engine.counters().rejected_clones, 10);

    // The ten weakest candidates (600..610) were the ones dropped.
    let first_clone = engine.store().row(1000).unwrap();
    assert_eq!(first_clone, engine.store().row(610).unwrap());
}

#[test]
fn test_densify_without_new_evidence_is_noop() {
    let mut engine = active_engine(100);
    engine.observe(&feedback(vec![3, 4], 0.9)).unwrap();
    let first = engine.densify().unwrap();
    assert_eq!(first.cloned, 2);
    let fingerprint = engine.fingerprint();
    let version = engine.event_version();

    let second = engine.densify().unwrap();
    assert!(second.is_noop());
    assert_eq!(engine.fingerprint(), fingerprint);
    assert_eq!(engine.event_version(), version);
    assert_eq!(engine.len(), 102);
}

#[test]
fn test_clones_are_bit_identical_with_fresh_moments() {
    let mut engine = active_engine(10);
    engine.observe(&feedback(vec![4], 0.5)).unwrap();
    let event = engine.densify().unwrap();
    let clone = event.remap.appended().start;

    assert_eq!(engine.store().row(4).unwrap(), engine.store().row(clone).unwrap());
    assert_eq!(engine.optimizer().first_moment(Attribute::Opacity)[clone], 0.0);
    assert_eq!(engine.optimizer().second_moment(Attribute::Opacity)[clone], 0.0);
    assert_eq!(engine.stats().observations(clone), 0);
}

fn engine_with_large_point(split_opacity: SplitOpacity) -> TrainingEngine {
    let mut config = test_config();
    config.densify.split_opacity = split_opacity;
    let rows = vec![
        PointRow::new(Vec3::ZERO, 0.01, 0.5, 1),
        PointRow::new(Vec3::new(1.0, 2.0, 3.0), 0.5, 0.6, 1),
        PointRow::new(Vec3::X, 0.01, 0.5, 1),
    ];
    let mut engine = engine_with(config, PointBatch::from_rows(1, &rows).unwrap());
    advance(&mut engine, 11);
    engine.observe(&feedback(vec![1], 0.5)).unwrap();
    engine
}

#[test]
fn test_split_replaces_parent_with_smaller_children() {
    let mut engine = engine_with_large_point(SplitOpacity::Copy);
    let parent = engine.store().row(1).unwrap();

    let event = engine.densify().unwrap();
    assert_eq!(event.split, 1);
    assert_eq!(event.cloned, 0);
    assert_eq!(engine.len(), 4);
    assert_eq!(event.remap.new_index(1), None);
    assert_eq!(event.remap.new_index(2), Some(1));

    let children = event.remap.appended();
    assert_eq!(children.len(), 2);
    for child in children {
        let expected_scale = 0.5 / 1.6;
        assert!((engine.store().max_scale(child) - expected_scale).abs() < 1e-5);
        assert_eq!(engine.store().opacity_logit(child), parent.opacity_logit);
        assert_eq!(engine.store().sh(child), parent.sh.as_slice());
        // Samples are drawn within a few parent sigmas of the parent centre.
        assert!(engine.store().position(child).distance(parent.position) < 0.5 * 6.0);
    }
    assert!(!engine.store().row(1).unwrap().position.abs_diff_eq(parent.position, 1e-6));
}

#[test]
fn test_conserving_split_preserves_composite_alpha() {
    let mut engine = engine_with_large_point(SplitOpacity::Conserve);
    let event = engine.densify().unwrap();
    let transmittance: f32 = event
        .remap
        .appended()
        .map(|child| 1.0 - sigmoid(engine.store().opacity_logit(child)))
        .product();
    assert!((1.0 - transmittance - 0.6).abs() < 1e-4);
}

#[test]
fn test_splits_are_deterministic_for_a_seed() {
    let mut a = engine_with_large_point(SplitOpacity::Copy);
    let mut b = engine_with_large_point(SplitOpacity::Copy);
    a.densify().unwrap();
    b.densify().unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn test_edits_outside_active_phase_leave_engine_untouched() {
    let mut engine = engine_with(test_config(), line_of_points(20, 1));
    let before = engine.fingerprint();

    let plan = EditPlan::removal_only(20, &[3], 1).unwrap();
    assert!(matches!(
        engine.apply_edit(&plan),
        Err(EngineError::InvalidTrainingPhase {
            phase: DensityPhase::Warmup,
            ..
        })
    ));
    assert!(engine.prune().is_err());

    advance(&mut engine, 1000);
    assert_eq!(engine.phase(), DensityPhase::Frozen);
    assert!(matches!(
        engine.densify(),
        Err(EngineError::InvalidTrainingPhase {
            phase: DensityPhase::Frozen,
            ..
        })
    ));
    assert_eq!(engine.fingerprint(), before);
    assert_eq!(engine.len(), 20);
    assert_eq!(engine.counters().rejected_edits, 3);
}

#[test]
fn test_mismatched_edit_plan_is_rejected_before_any_change() {
    let mut engine = active_engine(10);
    let before = engine.fingerprint();
    let plan = EditPlan::removal_only(12, &[0], 1).unwrap();
    assert!(matches!(
        engine.apply_edit(&plan),
        Err(EngineError::ShapeMismatch { .. })
    ));
    assert_eq!(engine.fingerprint(), before);
    assert_eq!(engine.optimizer().len(), 10);
}
