//! Per-point optimizer state and learning-rate schedules.

pub mod adam;
pub mod gradients;
pub mod schedule;

pub use adam::OptimizerState;
pub use gradients::PointGradients;
pub use schedule::{AttributeRates, ExponentialDecay, WeightSchedule};
