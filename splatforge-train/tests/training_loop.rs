mod common;

use common::{MockRasterizer, SCENE_EXTENT, engine_with, line_of_points, ring_of_views, test_config};
use splatforge_train::driver::Conditioning;
use splatforge_train::store::IndexRemap;
use splatforge_train::{
    DensityPhase, PhotometricLoss, Reorient, RunDirectory, RunReader, TrainConfig, TrainError,
    Trainer, TrainingEngine,
};
use tempfile::TempDir;

fn config() -> TrainConfig {
    let mut config = test_config().with_growth_ceiling(100);
    config.checkpoint_interval = 10;
    config
}

/// Records every remap it is notified of.
#[derive(Debug, Default)]
struct RemapLog {
    lengths: Vec<(usize, usize)>,
}

impl Conditioning for RemapLog {
    fn on_points_remapped(&mut self, remap: &IndexRemap) {
        self.lengths.push((remap.old_len(), remap.new_len()));
    }
}

#[test]
fn test_trainer_requires_views() {
    let engine = engine_with(config(), line_of_points(4, 1));
    let result = Trainer::new(engine, MockRasterizer::new(1.0), PhotometricLoss::new(), Vec::new());
    assert!(matches!(result, Err(TrainError::NoViews)));
}

#[test]
fn test_views_are_visited_once_per_epoch() {
    let engine = engine_with(config(), line_of_points(4, 1));
    let mut trainer =
        Trainer::new(engine, MockRasterizer::new(1.0), PhotometricLoss::new(), ring_of_views(5)).unwrap();
    let mut epoch: Vec<usize> = (0..5).map(|_| trainer.next_view()).collect();
    epoch.sort_unstable();
    assert_eq!(epoch, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_run_densifies_up_to_the_ceiling_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let run = RunDirectory::new(dir.path());
    let engine = engine_with(config(), line_of_points(20, 1));
    let mut trainer = Trainer::new(engine, MockRasterizer::new(1.0), PhotometricLoss::new(), ring_of_views(4))
        .unwrap()
        .with_conditioning(RemapLog::default())
        .with_run_directory(run.clone());

    let summary = trainer.run(40).unwrap();
    assert_eq!(summary.iterations, 40);
    // 20 -> 40 at iteration 20, -> 80 at 30, capped at 100 at 40.
    assert_eq!(summary.points, 100);
    assert_eq!(summary.counters.points_cloned, 80);
    assert_eq!(summary.counters.rejected_clones, 60);
    assert_eq!(summary.counters.densify_passes, 3);
    assert_eq!(
        trainer.conditioning().lengths,
        vec![(20, 40), (40, 80), (80, 100)]
    );

    assert_eq!(summary.checkpoints.len(), 4);
    assert_eq!(summary.checkpoints[3], run.checkpoint_path(40));
    assert_eq!(run.latest_checkpoint().unwrap(), run.checkpoint_path(40));
    trainer.engine().validate().unwrap();
}

#[test]
fn test_checkpoint_resumes_the_same_model() {
    let dir = TempDir::new().unwrap();
    let run = RunDirectory::new(dir.path());
    let engine = engine_with(config(), line_of_points(20, 1));
    let mut trainer = Trainer::new(engine, MockRasterizer::new(1.0), PhotometricLoss::new(), ring_of_views(4))
        .unwrap()
        .with_run_directory(run.clone());
    trainer.run(25).unwrap();
    let engine = trainer.into_engine();

    // Interval checkpoints at 10 and 20, plus one at the end.
    assert_eq!(run.checkpoints().unwrap().len(), 3);
    let snapshot = RunDirectory::load(run.latest_checkpoint().unwrap()).unwrap();
    assert_eq!(snapshot, engine.snapshot());

    let resumed = TrainingEngine::resume(snapshot).unwrap();
    assert_eq!(resumed.iteration(), 25);
    assert_eq!(resumed.phase(), DensityPhase::Active);
    assert_eq!(resumed.fingerprint(), engine.fingerprint());
    assert_eq!(resumed.optimizer(), engine.optimizer());
    assert_eq!(resumed.counters(), engine.counters());
    assert!(!resumed.stats().has_evidence());
    assert_eq!(resumed.scene_extent(), SCENE_EXTENT);
}

#[test]
fn test_reader_opens_trained_run() {
    let dir = TempDir::new().unwrap();
    let run = RunDirectory::new(dir.path());
    let views = ring_of_views(4);
    let cameras: Vec<_> = views
        .iter()
        .enumerate()
        .map(|(i, view)| view.to_record(i as u32, format!("{:04}.png", i)))
        .collect();
    run.write_cameras(&cameras).unwrap();

    let engine = engine_with(config(), line_of_points(20, 1));
    let mut trainer = Trainer::new(engine, MockRasterizer::new(1.0), PhotometricLoss::new(), views)
        .unwrap()
        .with_run_directory(run.clone());
    trainer.run(20).unwrap();

    let reader = RunReader::open(dir.path(), Reorient::Enable).unwrap();
    assert_eq!(reader.iteration(), 20);
    assert_eq!(reader.points().len(), trainer.engine().len());
    assert_eq!(reader.records(1.0).len(), 40);
    assert_eq!(reader.counters().densify_passes, 1);
}
