mod common;

use common::{MockRasterizer, advance, engine_with, line_of_points, ring_of_views, test_config};
use splatforge_train::coordinator::ReplicationRejected;
use splatforge_train::driver::{IdentityConditioning, compute_view_gradients};
use splatforge_train::{
    DensityPhase, DeviceId, EngineError, PhotometricLoss, RunDirectory, TrainError,
    TrainingEngine, enable_replication,
};
use tempfile::TempDir;

const DEVICES: [DeviceId; 2] = [DeviceId(0), DeviceId(1)];

fn settled_engine() -> TrainingEngine {
    let mut engine = engine_with(test_config(), line_of_points(64, 1));
    advance(&mut engine, 1000);
    assert_eq!(engine.phase(), DensityPhase::Frozen);
    engine
}

#[test]
fn test_replication_is_refused_while_densification_is_active() {
    let mut engine = engine_with(test_config(), line_of_points(64, 1));
    advance(&mut engine, 11);
    let fingerprint = engine.fingerprint();

    let ReplicationRejected { engine, error } = enable_replication(engine, &DEVICES).unwrap_err();
    assert!(matches!(
        error,
        EngineError::InvalidTrainingPhase {
            phase: DensityPhase::Active,
            ..
        }
    ));
    assert_eq!(engine.fingerprint(), fingerprint);
    assert_eq!(engine.len(), 64);
    assert_eq!(engine.phase(), DensityPhase::Active);
    assert!(!engine.schedule().is_frozen());
}

#[test]
fn test_replication_needs_a_device() {
    let rejected = enable_replication(settled_engine(), &[]).unwrap_err();
    assert_eq!(rejected.engine.len(), 64);
}

#[test]
fn test_replicas_start_identical() {
    let group = enable_replication(settled_engine(), &DEVICES).unwrap();
    assert_eq!(group.devices(), DEVICES.to_vec());
    assert_eq!(group.replicas().len(), 2);
    group.verify_consistency().unwrap();
    assert_eq!(group.iteration(), 1000);
}

#[test]
fn test_replicas_stay_consistent_across_steps() {
    let mut group = enable_replication(settled_engine(), &DEVICES).unwrap();
    let views = ring_of_views(4);
    let rasterizer = MockRasterizer::new(0.5);
    let loss = PhotometricLoss::new();
    let before = group.primary().fingerprint();

    for _ in 0..5 {
        let report = group
            .step(&views, &[0, 1, 2, 3], &rasterizer, &loss, &IdentityConditioning)
            .unwrap();
        assert_eq!(report.views, 4);
        group.verify_consistency().unwrap();
    }
    assert_eq!(group.iteration(), 1005);
    assert_ne!(group.primary().fingerprint(), before);
    assert_eq!(group.primary().len(), 64);
}

#[test]
fn test_replicated_step_matches_one_engine_with_reduced_gradients() {
    let engine = settled_engine();
    let mut reference = engine.clone();
    let mut group = enable_replication(engine, &DEVICES).unwrap();
    let views = ring_of_views(4);
    let rasterizer = MockRasterizer::new(0.5);
    let loss = PhotometricLoss::new();

    group
        .step(&views, &[0, 1, 2, 3], &rasterizer, &loss, &IdentityConditioning)
        .unwrap();

    // Device 0 renders views 0 and 2, device 1 renders 1 and 3.
    let gradients = |index: usize| {
        compute_view_gradients(&reference, &views[index], &rasterizer, &loss, &IdentityConditioning)
            .unwrap()
            .gradients
    };
    let mut first = gradients(0);
    first.accumulate(&gradients(2)).unwrap();
    let mut second = gradients(1);
    second.accumulate(&gradients(3)).unwrap();
    first.accumulate(&second).unwrap();
    first.scale(1.0 / 4.0);
    reference.apply_gradients(&first).unwrap();
    reference.end_iteration().unwrap();

    assert_eq!(group.primary().fingerprint(), reference.fingerprint());
}

#[test]
fn test_replicated_step_rejects_unknown_view() {
    let mut group = enable_replication(settled_engine(), &DEVICES).unwrap();
    let views = ring_of_views(2);
    let result = group.step(
        &views,
        &[0, 5],
        &MockRasterizer::new(0.5),
        &PhotometricLoss::new(),
        &IdentityConditioning,
    );
    assert!(matches!(
        result,
        Err(TrainError::ViewOutOfRange { index: 5, len: 2 })
    ));
    assert_eq!(group.iteration(), 1000);
}

#[test]
fn test_densify_requests_are_refused_and_counted() {
    let mut group = enable_replication(settled_engine(), &DEVICES).unwrap();
    let fingerprint = group.primary().fingerprint();
    assert!(matches!(
        group.try_densify(),
        Err(EngineError::InvalidTrainingPhase {
            phase: DensityPhase::Frozen,
            ..
        })
    ));
    assert!(group.try_densify().is_err());
    assert_eq!(group.rejected_edits(), 2);
    assert_eq!(group.primary().fingerprint(), fingerprint);
}

#[test]
fn test_warmup_replication_freezes_structure() {
    let engine = engine_with(test_config(), line_of_points(16, 1));
    assert_eq!(engine.phase(), DensityPhase::Warmup);
    let mut group = enable_replication(engine, &DEVICES).unwrap();
    assert_eq!(group.primary().phase(), DensityPhase::Frozen);

    // Well past densify_from with strong gradients: still no structural change.
    let views = ring_of_views(2);
    let rasterizer = MockRasterizer::new(5.0);
    let loss = PhotometricLoss::new();
    for _ in 0..25 {
        group
            .step(&views, &[0, 1], &rasterizer, &loss, &IdentityConditioning)
            .unwrap();
    }
    assert_eq!(group.iteration(), 25);
    assert_eq!(group.primary().len(), 16);
    group.verify_consistency().unwrap();

    let mut engine = group.into_primary();
    assert!(engine.reorder(&(0..16).rev().collect::<Vec<_>>()).is_err());
}

#[test]
fn test_replication_freeze_survives_checkpoint_resume() {
    let dir = TempDir::new().unwrap();
    let run = RunDirectory::new(dir.path());
    let engine = engine_with(test_config(), line_of_points(16, 1));
    let group = enable_replication(engine, &DEVICES).unwrap();
    let path = run.save(&group.into_primary().snapshot()).unwrap();

    let snapshot = RunDirectory::load(&path).unwrap();
    assert!(snapshot.schedule.is_frozen());
    let mut engine = TrainingEngine::resume(snapshot).unwrap();
    assert!(engine.schedule().is_frozen());

    // Inside the densification window an unfrozen engine would be Active.
    advance(&mut engine, 20);
    assert_eq!(engine.phase(), DensityPhase::Frozen);
    assert!(matches!(
        engine.densify(),
        Err(EngineError::InvalidTrainingPhase {
            phase: DensityPhase::Frozen,
            ..
        })
    ));
    assert_eq!(engine.len(), 16);
    assert_eq!(engine.counters().rejected_edits, 1);
}
