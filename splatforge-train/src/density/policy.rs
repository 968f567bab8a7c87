//! Clone / split / prune selection.
//!
//! The controller only proposes. `TrainingEngine` turns a proposal into an
//! [`EditPlan`] and applies it to every index-aligned array at once.

use crate::config::{DensifyConfig, PruneConfig, SplitOpacity};
use crate::density::accumulator::GradientAccumulator;
use crate::error::EngineError;
use crate::store::{EditPlan, PointBatch, PointStore, inverse_sigmoid};
use glam::Vec3;
use ordered_float::OrderedFloat;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

/// Inputs of one density pass that are not part of the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassContext {
    pub iteration: u64,
    pub scene_extent: f32,
    /// Screen-space and world-space size pruning are active.
    pub size_pruning: bool,
}

/// Indices selected by one density pass, all in pre-edit numbering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DensifyProposal {
    pub clone: Vec<usize>,
    pub split: Vec<usize>,
    pub prune: Vec<usize>,
    pub rejected_clones: usize,
    pub rejected_splits: usize,
}

impl DensifyProposal {
    pub fn is_empty(&self) -> bool {
        self.clone.is_empty() && self.split.is_empty() && self.prune.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DensityController {
    densify: DensifyConfig,
    prune: PruneConfig,
    growth_ceiling: Option<usize>,
}

impl DensityController {
    pub fn new(densify: DensifyConfig, prune: PruneConfig, growth_ceiling: Option<usize>) -> Self {
        Self {
            densify,
            prune,
            growth_ceiling,
        }
    }

    /// World-space scale separating clone (at or below) from split (above).
    pub fn size_threshold(&self, scene_extent: f32) -> f32 {
        self.densify.percent_dense * scene_extent
    }

    /// Select clones, splits and prunes for the current statistics.
    pub fn plan(
        &self,
        store: &PointStore,
        stats: &GradientAccumulator,
        context: PassContext,
    ) -> DensifyProposal {
        let size_threshold = self.size_threshold(context.scene_extent);
        let mut clone_candidates = Vec::new();
        let mut split_candidates = Vec::new();

        for index in 0..store.len() {
            if stats.observations(index) == 0 {
                continue;
            }
            let mean = stats.mean_since_reset(index);
            if !(mean >= self.densify.grad_threshold) {
                continue;
            }
            if store.max_scale(index) > size_threshold {
                split_candidates.push((index, mean));
            } else {
                clone_candidates.push((index, mean));
            }
        }

        let mut budget = self
            .growth_ceiling
            .map(|ceiling| ceiling.saturating_sub(store.len()));
        let split_cost = self.densify.split_count.saturating_sub(1);
        let (split, rejected_splits) = admit(split_candidates, split_cost, &mut budget);
        let (clone, rejected_clones) = admit(clone_candidates, 1, &mut budget);
        if rejected_clones + rejected_splits > 0 {
            debug!(
                "Growth ceiling {:?} rejected {} clones and {} splits",
                self.growth_ceiling, rejected_clones, rejected_splits
            );
        }

        let mut touched = vec![false; store.len()];
        for &index in clone.iter().chain(&split) {
            touched[index] = true;
        }
        let prune = self.prune_candidates(store, stats, context, &touched);

        DensifyProposal {
            clone,
            split,
            prune,
            rejected_clones,
            rejected_splits,
        }
    }

    /// Points to remove, skipping any index marked in `exclude`.
    pub fn prune_candidates(
        &self,
        store: &PointStore,
        stats: &GradientAccumulator,
        context: PassContext,
        exclude: &[bool],
    ) -> Vec<usize> {
        let world_limit = self.prune.world_size_fraction * context.scene_extent;
        (0..store.len())
            .filter(|&index| !exclude.get(index).copied().unwrap_or(false))
            .filter(|&index| {
                if store.opacity(index) < self.prune.min_opacity {
                    return true;
                }
                if self.prune.prune_unobserved && stats.observations(index) == 0 {
                    return true;
                }
                if context.size_pruning {
                    if self.prune.max_screen_size > 0.0
                        && stats.max_screen_radius(index) > self.prune.max_screen_size
                    {
                        return true;
                    }
                    if store.max_scale(index) > world_limit {
                        return true;
                    }
                }
                false
            })
            .collect()
    }

    /// Turn a proposal into an edit: clones are appended first, then split
    /// children; split parents and pruned points are removed.
    pub fn build_edit<R: Rng>(
        &self,
        store: &PointStore,
        proposal: &DensifyProposal,
        rng: &mut R,
    ) -> Result<EditPlan, EngineError> {
        let children = self.densify.split_count;
        let mut appended = PointBatch::with_capacity(
            store.max_sh_degree(),
            proposal.clone.len() + proposal.split.len() * children,
        );

        for &index in &proposal.clone {
            appended.push(&store.row(index)?)?;
        }

        for &index in &proposal.split {
            let parent = store.row(index)?;
            let scale = parent.scale();
            let rotation = parent.rotation.normalize();
            let log_scale = parent.log_scale - Vec3::splat(self.densify.scale_divisor.ln());
            let opacity_logit = match self.densify.split_opacity {
                SplitOpacity::Copy => parent.opacity_logit,
                SplitOpacity::Conserve => {
                    let alpha = parent.opacity();
                    inverse_sigmoid(1.0 - (1.0 - alpha).powf(1.0 / children as f32))
                }
            };
            for _ in 0..children {
                let sample = Vec3::new(
                    rng.sample(StandardNormal),
                    rng.sample(StandardNormal),
                    rng.sample(StandardNormal),
                ) * scale;
                let mut child = parent.clone();
                child.position = parent.position + rotation * sample;
                child.log_scale = log_scale;
                child.opacity_logit = opacity_logit;
                appended.push(&child)?;
            }
        }

        let removed: Vec<usize> = proposal
            .split
            .iter()
            .chain(&proposal.prune)
            .copied()
            .collect();
        EditPlan::new(store.len(), &removed, appended)
    }
}

/// Admit candidates by descending gradient (ties by index) while the budget
/// allows; returns the admitted indices in ascending order and the number
/// rejected.
fn admit(
    mut candidates: Vec<(usize, f32)>,
    cost: usize,
    budget: &mut Option<usize>,
) -> (Vec<usize>, usize) {
    candidates.sort_by(|a, b| {
        OrderedFloat(b.1)
            .cmp(&OrderedFloat(a.1))
            .then(a.0.cmp(&b.0))
    });
    let mut admitted = Vec::with_capacity(candidates.len());
    let mut rejected = 0;
    for (index, _) in candidates {
        match budget {
            Some(remaining) if *remaining < cost => rejected += 1,
            Some(remaining) => {
                *remaining -= cost;
                admitted.push(index);
            }
            None => admitted.push(index),
        }
    }
    admitted.sort_unstable();
    (admitted, rejected)
}
