//! Error taxonomy for the training engine.

use crate::density::DensityPhase;
use thiserror::Error;

/// Failure reported by an external rasterizer or conditioning module.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RenderError(pub String);

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors raised by the point store, the optimizer and density control.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Index-aligned arrays disagree in length or stride.
    #[error("Shape mismatch in {attribute}: expected {expected}, found {found}")]
    ShapeMismatch {
        attribute: String,
        expected: usize,
        found: usize,
    },

    #[error("Index {index} out of bounds for {len} points")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Permutation is not a bijection of 0..{len}: {reason}")]
    InvalidPermutation { len: usize, reason: String },

    /// A structural edit was attempted outside the active densification window.
    #[error("Structural edit rejected at iteration {iteration} during {phase:?} phase: {reason}")]
    InvalidTrainingPhase {
        iteration: u64,
        phase: DensityPhase,
        reason: &'static str,
    },

    #[error("Non-finite {field} for point {index}")]
    NonFiniteFeedback { field: &'static str, index: usize },

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// A snapshot could not be encoded or decoded for broadcast.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Replicas that should hold identical parameters do not.
    #[error("Replica on {device} diverged: fingerprint {found:#018x}, expected {expected:#018x}")]
    ReplicaDivergence {
        device: String,
        expected: u64,
        found: u64,
    },
}

impl From<ConfigError> for EngineError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Invalid { field, reason } => Self::InvalidConfig { field, reason },
            other => Self::InvalidConfig {
                field: "config",
                reason: other.to_string(),
            },
        }
    }
}

impl EngineError {
    pub(crate) fn shape(attribute: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::ShapeMismatch {
            attribute: attribute.into(),
            expected,
            found,
        }
    }

    /// Fatal errors are invariant violations; training must stop.
    ///
    /// Phase rejections are policy-level and leave all state untouched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidTrainingPhase { .. })
    }
}

/// Errors raised while reading or validating a [`crate::TrainConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors raised while saving, locating or loading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No checkpoint found under {0}")]
    NoCheckpoint(String),

    #[error("Camera metadata required but not found: {0}")]
    MissingCameras(String),

    #[error("Unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),

    #[error("Data error: {0}")]
    Data(#[from] splatforge_data::DataError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Errors surfaced by the optimization driver.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("View source is empty")]
    NoViews,

    #[error("View {index} out of range for {len} views")]
    ViewOutOfRange { index: usize, len: usize },
}
