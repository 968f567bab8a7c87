//! Training phases and the iteration schedule for structural edits.

use crate::config::ScheduleConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DensityPhase {
    /// Before `densify_from`: statistics accumulate, no edits.
    Warmup,
    /// Structural edits allowed.
    Active,
    /// No structural edits for the rest of training.
    Frozen,
}

impl fmt::Display for DensityPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DensityPhase::Warmup => f.write_str("warmup"),
            DensityPhase::Active => f.write_str("active"),
            DensityPhase::Frozen => f.write_str("frozen"),
        }
    }
}

/// Maps an iteration to its phase and decides when density control runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSchedule {
    config: ScheduleConfig,
    /// Set once freezing is forced; never cleared.
    frozen: bool,
}

impl PhaseSchedule {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            frozen: false,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn phase_at(&self, iteration: u64) -> DensityPhase {
        if self.frozen || iteration >= self.config.densify_until {
            DensityPhase::Frozen
        } else if iteration < self.config.densify_from {
            DensityPhase::Warmup
        } else {
            DensityPhase::Active
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freeze structure permanently.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// A densify pass is scheduled after `iteration` completes.
    pub fn should_densify(&self, iteration: u64) -> bool {
        self.phase_at(iteration) == DensityPhase::Active
            && iteration > self.config.densify_from
            && iteration % self.config.densify_interval.max(1) == 0
    }

    /// An opacity reset is scheduled after `iteration` completes.
    pub fn should_reset_opacity(&self, iteration: u64) -> bool {
        !self.frozen
            && iteration > 0
            && iteration < self.config.densify_until
            && iteration % self.config.opacity_reset_interval.max(1) == 0
    }

    /// Size-based pruning only starts once the first opacity reset is behind us.
    pub fn size_pruning_enabled(&self, iteration: u64) -> bool {
        iteration > self.config.opacity_reset_interval
    }
}
