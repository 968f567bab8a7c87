//! Records of structural edits.

use crate::store::IndexRemap;
use serde::{Deserialize, Serialize};

/// One applied structural edit.
///
/// `version` increases by one per applied event, so holders of point
/// indices can tell whether their indices are still current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensificationEvent {
    pub iteration: u64,
    pub version: u64,
    /// Points duplicated in place.
    pub cloned: usize,
    /// Parents replaced by sampled children.
    pub split: usize,
    pub pruned: usize,
    pub rejected_clones: usize,
    pub rejected_splits: usize,
    pub points_before: usize,
    pub points_after: usize,
    pub remap: IndexRemap,
}

impl DensificationEvent {
    pub fn is_noop(&self) -> bool {
        self.points_before == self.points_after && self.remap.removed() == 0
    }

    pub fn rejected(&self) -> usize {
        self.rejected_clones + self.rejected_splits
    }
}

/// What ran at the end of an iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DensityOutcome {
    pub event: Option<DensificationEvent>,
    pub opacity_reset: bool,
    /// Active SH degree after the iteration, if it changed.
    pub sh_degree_raised: Option<u32>,
}
