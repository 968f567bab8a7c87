//! Adaptive density control: gradient statistics, phase schedule and the
//! clone / split / prune policy.

pub mod accumulator;
pub mod event;
pub mod phase;
pub mod policy;

pub use accumulator::{FrameFeedback, GradientAccumulator};
pub use event::{DensificationEvent, DensityOutcome};
pub use phase::{DensityPhase, PhaseSchedule};
pub use policy::{DensifyProposal, DensityController};
