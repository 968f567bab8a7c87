//! Splatforge Training Crate
//!
//! Adaptive density control for Gaussian splatting optimization. The engine
//! owns the Gaussian point store, the per-point optimizer state and the
//! gradient statistics, and keeps all three index-aligned through every
//! clone, split, prune and reorder.
//!
//! ## Modules
//!
//! - [`store`]: Structure-of-arrays point store and the edit transaction
//! - [`optim`]: Adam moments, gradients and learning-rate schedules
//! - [`density`]: Gradient accumulator, phase schedule and clone/split/prune policy
//! - [`engine`]: The training engine tying store, optimizer and statistics together
//! - [`coordinator`]: Multi-device replication with frozen structure
//! - [`driver`]: Rasterizer/loss/conditioning contracts and the training loop
//! - [`checkpoint`]: Snapshots, run directories and read-only run access
//! - [`ingest`]: Training views and initial Gaussians from seed points

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod density;
pub mod driver;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod optim;
pub mod store;

pub use checkpoint::{EngineSnapshot, Reorient, RunDirectory, RunReader};
pub use config::TrainConfig;
pub use coordinator::{DeviceId, ReplicaGroup, enable_replication};
pub use density::{DensificationEvent, DensityPhase, FrameFeedback, GradientAccumulator};
pub use driver::{PhotometricLoss, Trainer};
pub use engine::{EngineCounters, TrainingEngine};
pub use error::{CheckpointError, ConfigError, EngineError, RenderError, TrainError};
pub use store::{PointBatch, PointRow, PointStore};
