//! Training inputs: posed views and initial Gaussians from seed points.

pub mod camera;
pub mod initializer;

pub use camera::TrainingView;
pub use initializer::{GaussianInitializer, ScaleStrategy};
