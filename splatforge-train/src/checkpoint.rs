//! Engine snapshots and training run directories.
//!
//! A run directory looks like:
//!
//! ```text
//! <run>/cameras.json
//! <run>/checkpoints/step=7000.ckpt
//! <run>/checkpoints/step=30000.ckpt
//! ```
//!
//! Checkpoints are JSON-encoded [`EngineSnapshot`]s. Viewers open a run with
//! [`RunReader`], which never needs the rest of the engine.

use crate::config::TrainConfig;
use crate::density::{DensityPhase, GradientAccumulator, PhaseSchedule};
use crate::engine::EngineCounters;
use crate::error::CheckpointError;
use crate::optim::OptimizerState;
use crate::store::{PointStore, StoreSnapshot};
use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};
use splatforge_data::{CameraRecord, SplatRecord, load_cameras, reorient_transform};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

const CHECKPOINT_DIR: &str = "checkpoints";
const CHECKPOINT_EXTENSION: &str = "ckpt";
const CAMERAS_FILE: &str = "cameras.json";

/// Everything needed to continue training exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub format_version: u32,
    pub config: TrainConfig,
    pub iteration: u64,
    pub store: StoreSnapshot,
    pub optimizer: OptimizerState,
    pub stats: GradientAccumulator,
    pub schedule: PhaseSchedule,
    pub active_sh_degree: u32,
    pub scene_extent: f32,
    pub event_version: u64,
    pub counters: EngineCounters,
}

impl EngineSnapshot {
    pub fn phase(&self) -> DensityPhase {
        self.schedule.phase_at(self.iteration)
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    fn check_version(&self) -> Result<(), CheckpointError> {
        if self.format_version != SNAPSHOT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(self.format_version));
        }
        Ok(())
    }
}

/// Iteration encoded in a checkpoint file name: the integer after the last
/// `=` and before the extension (`step=7000.ckpt` -> 7000).
pub fn checkpoint_iteration(path: &Path) -> Option<u64> {
    if path.extension()? != CHECKPOINT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (_, number) = stem.rsplit_once('=')?;
    number.parse().ok()
}

/// A training run on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR)
    }

    pub fn checkpoint_path(&self, iteration: u64) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("step={}.{}", iteration, CHECKPOINT_EXTENSION))
    }

    pub fn cameras_path(&self) -> PathBuf {
        self.root.join(CAMERAS_FILE)
    }

    /// Write a checkpoint; the file appears atomically under its final name.
    #[tracing::instrument(skip_all, fields(iteration = snapshot.iteration))]
    pub fn save(&self, snapshot: &EngineSnapshot) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(self.checkpoints_dir())?;
        let path = self.checkpoint_path(snapshot.iteration);
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, snapshot)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        info!("Saved checkpoint {}", path.display());
        Ok(path)
    }

    pub fn write_cameras(&self, cameras: &[CameraRecord]) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.root)?;
        let mut writer = BufWriter::new(File::create(self.cameras_path())?);
        serde_json::to_writer_pretty(&mut writer, cameras)?;
        writer.flush()?;
        Ok(())
    }

    /// All checkpoints, sorted by iteration.
    pub fn checkpoints(&self) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let dir = self.checkpoints_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(iteration) = checkpoint_iteration(&path) {
                found.push((iteration, path));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Checkpoint with the highest iteration.
    pub fn latest_checkpoint(&self) -> Result<PathBuf, CheckpointError> {
        self.checkpoints()?
            .pop()
            .map(|(_, path)| path)
            .ok_or_else(|| CheckpointError::NoCheckpoint(self.root.display().to_string()))
    }

    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<EngineSnapshot, CheckpointError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let snapshot: EngineSnapshot = serde_json::from_reader(reader)?;
        snapshot.check_version()?;
        debug!(
            "Loaded checkpoint at iteration {} ({} points)",
            snapshot.iteration,
            snapshot.store.columns.rows()
        );
        Ok(snapshot)
    }

    /// Resolve a model path to a checkpoint file and its run directory.
    ///
    /// A `.ckpt` file is used as is and its run is two levels up; a directory
    /// resolves to its latest checkpoint.
    pub fn resolve(model_path: impl AsRef<Path>) -> Result<(RunDirectory, PathBuf), CheckpointError> {
        let model_path = model_path.as_ref();
        if model_path.is_file() {
            if model_path.extension().is_none_or(|ext| ext != CHECKPOINT_EXTENSION) {
                return Err(CheckpointError::NoCheckpoint(model_path.display().to_string()));
            }
            let root = model_path
                .parent()
                .and_then(Path::parent)
                .unwrap_or_else(|| Path::new("."));
            return Ok((RunDirectory::new(root), model_path.to_path_buf()));
        }
        let run = RunDirectory::new(model_path);
        let checkpoint = run.latest_checkpoint()?;
        Ok((run, checkpoint))
    }
}

/// Whether to rotate the scene so the cameras' up direction becomes +Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reorient {
    /// Reorient when `cameras.json` is present.
    #[default]
    Auto,
    /// Reorient; fail without `cameras.json`.
    Enable,
    Disable,
}

/// Read-only view of a trained run for viewers and exporters.
#[derive(Debug, Clone)]
pub struct RunReader {
    run: RunDirectory,
    checkpoint: PathBuf,
    iteration: u64,
    phase: DensityPhase,
    active_sh_degree: u32,
    counters: EngineCounters,
    store: PointStore,
    orientation: Quat,
}

impl RunReader {
    pub fn open(model_path: impl AsRef<Path>, reorient: Reorient) -> Result<Self, CheckpointError> {
        let (run, checkpoint) = RunDirectory::resolve(model_path)?;
        let snapshot = RunDirectory::load(&checkpoint)?;
        let orientation = Self::orientation_for(&run, reorient)?;
        let phase = snapshot.phase();
        info!(
            "Opened {} (iteration {})",
            checkpoint.display(),
            snapshot.iteration
        );
        Ok(Self {
            run,
            checkpoint,
            iteration: snapshot.iteration,
            phase,
            active_sh_degree: snapshot.active_sh_degree,
            counters: snapshot.counters,
            store: PointStore::restore(snapshot.store)?,
            orientation,
        })
    }

    fn orientation_for(run: &RunDirectory, reorient: Reorient) -> Result<Quat, CheckpointError> {
        let cameras_path = run.cameras_path();
        let present = cameras_path.is_file();
        match (reorient, present) {
            (Reorient::Disable, _) => Ok(Quat::IDENTITY),
            (Reorient::Auto, false) => {
                debug!("No {} found; keeping scene orientation", CAMERAS_FILE);
                Ok(Quat::IDENTITY)
            }
            (Reorient::Enable, false) => Err(CheckpointError::MissingCameras(
                cameras_path.display().to_string(),
            )),
            (_, true) => {
                let cameras = load_cameras(&cameras_path)?;
                if cameras.is_empty() {
                    warn!("{} lists no cameras; keeping scene orientation", CAMERAS_FILE);
                    return Ok(Quat::IDENTITY);
                }
                let transform = reorient_transform(&cameras)?;
                Ok(Quat::from_mat4(&transform))
            }
        }
    }

    pub fn run(&self) -> &RunDirectory {
        &self.run
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn phase(&self) -> DensityPhase {
        self.phase
    }

    pub fn active_sh_degree(&self) -> u32 {
        self.active_sh_degree
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn points(&self) -> &PointStore {
        &self.store
    }

    /// Rotation applied to exported records.
    pub fn orientation(&self) -> Mat4 {
        Mat4::from_quat(self.orientation)
    }

    /// Exported rows in the reoriented frame.
    pub fn records(&self, scaling_modifier: f32) -> Vec<SplatRecord> {
        let mut records = self.store.records(scaling_modifier);
        if self.orientation != Quat::IDENTITY {
            for record in &mut records {
                let position = self.orientation * Vec3::from_array(record.position);
                record.position = position.to_array();
                let rotation = (self.orientation * Quat::from_array(record.rotation)).normalize();
                record.rotation = rotation.to_array();
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrainingEngine;
    use crate::store::{PointBatch, PointRow};
    use tempfile::TempDir;

    fn engine() -> TrainingEngine {
        let rows = vec![
            PointRow::new(Vec3::new(0.0, -1.0, 0.0), 0.1, 0.5, 0),
            PointRow::new(Vec3::new(1.0, 0.0, 0.0), 0.2, 0.8, 0),
        ];
        let config = TrainConfig::default().with_max_sh_degree(0);
        TrainingEngine::new(config, PointBatch::from_rows(0, &rows).unwrap(), 2.0).unwrap()
    }

    #[test]
    fn test_checkpoint_iteration_parsing() {
        assert_eq!(checkpoint_iteration(Path::new("a/step=7000.ckpt")), Some(7000));
        assert_eq!(checkpoint_iteration(Path::new("epoch=3-step=12.ckpt")), Some(12));
        assert_eq!(checkpoint_iteration(Path::new("step=7000.json")), None);
        assert_eq!(checkpoint_iteration(Path::new("last.ckpt")), None);
    }

    #[test]
    fn test_latest_checkpoint_picks_highest_iteration() {
        let dir = TempDir::new().unwrap();
        let run = RunDirectory::new(dir.path());
        let mut engine = engine();
        for _ in 0..3 {
            engine.end_iteration().unwrap();
            run.save(&engine.snapshot()).unwrap();
        }
        fs::write(run.checkpoints_dir().join("notes.txt"), "ignored").unwrap();
        assert_eq!(run.latest_checkpoint().unwrap(), run.checkpoint_path(3));
        assert_eq!(run.checkpoints().unwrap().len(), 3);
    }

    #[test]
    fn test_empty_run_has_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            RunDirectory::new(dir.path()).latest_checkpoint(),
            Err(CheckpointError::NoCheckpoint(_))
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let run = RunDirectory::new(dir.path());
        let snapshot = engine().snapshot();
        let path = run.save(&snapshot).unwrap();
        assert_eq!(RunDirectory::load(&path).unwrap(), snapshot);
    }

    #[test]
    fn test_rejects_unknown_format_version() {
        let mut snapshot = engine().snapshot();
        snapshot.format_version = 99;
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(matches!(
            EngineSnapshot::from_json(&json),
            Err(CheckpointError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_reader_resolves_file_and_directory() {
        let dir = TempDir::new().unwrap();
        let run = RunDirectory::new(dir.path());
        let path = run.save(&engine().snapshot()).unwrap();

        let from_dir = RunReader::open(dir.path(), Reorient::Auto).unwrap();
        let from_file = RunReader::open(&path, Reorient::Auto).unwrap();
        assert_eq!(from_dir.checkpoint(), from_file.checkpoint());
        assert_eq!(from_file.run().root(), dir.path());
        assert_eq!(from_dir.points().len(), 2);
        assert_eq!(from_dir.orientation(), Mat4::IDENTITY);
    }

    #[test]
    fn test_enable_reorient_requires_cameras() {
        let dir = TempDir::new().unwrap();
        RunDirectory::new(dir.path()).save(&engine().snapshot()).unwrap();
        assert!(matches!(
            RunReader::open(dir.path(), Reorient::Enable),
            Err(CheckpointError::MissingCameras(_))
        ));
    }

    #[test]
    fn test_reorient_maps_camera_up_to_z() {
        let dir = TempDir::new().unwrap();
        let run = RunDirectory::new(dir.path());
        run.save(&engine().snapshot()).unwrap();
        run.write_cameras(&[CameraRecord {
            id: 0,
            img_name: "0000.png".to_string(),
            width: 64,
            height: 48,
            position: [0.0; 3],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            fx: 50.0,
            fy: 50.0,
        }])
        .unwrap();

        let reader = RunReader::open(dir.path(), Reorient::Auto).unwrap();
        let records = reader.records(1.0);
        let first = Vec3::from_array(records[0].position);
        assert!((first - Vec3::Z).length() < 1e-5);

        let plain = RunReader::open(dir.path(), Reorient::Disable).unwrap();
        assert_eq!(plain.records(1.0)[0].position, [0.0, -1.0, 0.0]);
    }
}
