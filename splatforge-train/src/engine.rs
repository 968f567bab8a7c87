//! The training engine: sole owner of the point store, the optimizer state
//! and the gradient statistics.
//!
//! Iteration number and phase live here and are passed explicitly to the
//! policy, so several engines (runs or replicas) can coexist in one process.

use crate::checkpoint::{EngineSnapshot, SNAPSHOT_VERSION};
use crate::config::TrainConfig;
use crate::density::policy::PassContext;
use crate::density::{
    DensificationEvent, DensityController, DensityOutcome, DensityPhase, FrameFeedback,
    GradientAccumulator, PhaseSchedule,
};
use crate::error::EngineError;
use crate::optim::{AttributeRates, OptimizerState, PointGradients};
use crate::store::{
    Attribute, EditPlan, IndexAligned, IndexRemap, PointBatch, PointStore, SceneView,
    inverse_sigmoid, sh_stride_for_degree, validate_permutation,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Running totals of structural activity, including recoverable rejections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub densify_passes: u64,
    pub points_cloned: u64,
    pub points_split: u64,
    pub points_pruned: u64,
    /// Clones dropped by the growth ceiling.
    pub rejected_clones: u64,
    /// Splits dropped by the growth ceiling.
    pub rejected_splits: u64,
    /// Structural edits refused because of the training phase.
    pub rejected_edits: u64,
    pub opacity_resets: u64,
}

#[derive(Debug, Clone)]
pub struct TrainingEngine {
    config: TrainConfig,
    store: PointStore,
    optimizer: OptimizerState,
    stats: GradientAccumulator,
    schedule: PhaseSchedule,
    controller: DensityController,
    /// Completed iterations.
    iteration: u64,
    active_sh_degree: u32,
    scene_extent: f32,
    event_version: u64,
    counters: EngineCounters,
}

impl TrainingEngine {
    /// Build an engine around the initial points.
    ///
    /// Buffers are reserved up to the growth ceiling when one is configured.
    pub fn new(config: TrainConfig, initial: PointBatch, scene_extent: f32) -> Result<Self, EngineError> {
        config.validate()?;
        let expected = sh_stride_for_degree(config.sh.max_degree);
        if initial.sh_stride() != expected {
            return Err(EngineError::shape("sh stride", expected, initial.sh_stride()));
        }
        let points = initial.validate()?;
        let capacity = config.growth_ceiling.unwrap_or(points).max(points);

        let mut store = PointStore::with_capacity(config.sh.max_degree, capacity);
        store.append(initial)?;
        let mut optimizer = OptimizerState::new(expected, points);
        optimizer.reserve(capacity - points);
        let mut stats = GradientAccumulator::new(points);
        stats.reserve(capacity - points);

        info!(
            "Training engine ready: {} points, capacity {}, scene extent {:.3}",
            points, capacity, scene_extent
        );
        Ok(Self {
            controller: Self::controller_for(&config),
            schedule: PhaseSchedule::new(config.schedule.clone()),
            config,
            store,
            optimizer,
            stats,
            iteration: 0,
            active_sh_degree: 0,
            scene_extent,
            event_version: 0,
            counters: EngineCounters::default(),
        })
    }

    fn controller_for(config: &TrainConfig) -> DensityController {
        DensityController::new(
            config.densify.clone(),
            config.prune.clone(),
            config.growth_ceiling,
        )
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn store(&self) -> &PointStore {
        &self.store
    }

    pub fn optimizer(&self) -> &OptimizerState {
        &self.optimizer
    }

    pub fn stats(&self) -> &GradientAccumulator {
        &self.stats
    }

    pub fn schedule(&self) -> &PhaseSchedule {
        &self.schedule
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn phase(&self) -> DensityPhase {
        self.schedule.phase_at(self.iteration)
    }

    pub fn active_sh_degree(&self) -> u32 {
        self.active_sh_degree
    }

    pub fn scene_extent(&self) -> f32 {
        self.scene_extent
    }

    pub fn event_version(&self) -> u64 {
        self.event_version
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Read-only attributes for the renderer, at the active SH degree.
    pub fn view(&self) -> SceneView<'_> {
        self.store.view(self.active_sh_degree)
    }

    /// Checks the central invariant: store, optimizer and statistics agree in length.
    pub fn validate(&self) -> Result<usize, EngineError> {
        let points = self.store.validate()?;
        let moments = self.optimizer.validate()?;
        if self.optimizer.sh_stride() != self.store.sh_stride() {
            return Err(EngineError::shape(
                "optimizer sh stride",
                self.store.sh_stride(),
                self.optimizer.sh_stride(),
            ));
        }
        if moments != points {
            return Err(EngineError::shape("optimizer state", points, moments));
        }
        let stats = self.stats.validate()?;
        if stats != points {
            return Err(EngineError::shape("gradient statistics", points, stats));
        }
        Ok(points)
    }

    /// Record the densification signal of one rendered view.
    pub fn observe(&mut self, feedback: &FrameFeedback) -> Result<(), EngineError> {
        self.stats.observe_frame(feedback)
    }

    /// One Adam step with the learning rates of the current iteration.
    pub fn apply_gradients(&mut self, gradients: &PointGradients) -> Result<(), EngineError> {
        let rates = AttributeRates::at(
            &self.config.learning_rates,
            self.iteration,
            self.scene_extent,
        );
        self.optimizer.step(
            self.store.columns_mut(),
            gradients,
            &rates,
            &self.config.adam,
        )
    }

    /// Close the current iteration and run whatever density control is due.
    pub fn end_iteration(&mut self) -> Result<DensityOutcome, EngineError> {
        self.iteration += 1;
        let mut outcome = DensityOutcome::default();

        let degree = (self.iteration / self.config.sh.degree_interval.max(1))
            .min(self.config.sh.max_degree as u64) as u32;
        if degree > self.active_sh_degree {
            debug!("Active SH degree raised to {}", degree);
            self.active_sh_degree = degree;
            outcome.sh_degree_raised = Some(degree);
        }

        if self.schedule.should_densify(self.iteration) {
            outcome.event = Some(self.densify()?);
        }
        if self.config.opacity_reset.enabled && self.schedule.should_reset_opacity(self.iteration) {
            self.reset_opacity();
            outcome.opacity_reset = true;
        }
        Ok(outcome)
    }

    fn check_phase(&mut self, reason: &'static str) -> Result<(), EngineError> {
        let phase = self.phase();
        if phase == DensityPhase::Active {
            return Ok(());
        }
        self.counters.rejected_edits += 1;
        warn!(
            "Rejected structural edit at iteration {} ({} phase): {}",
            self.iteration, phase, reason
        );
        Err(EngineError::InvalidTrainingPhase {
            iteration: self.iteration,
            phase,
            reason,
        })
    }

    fn pass_context(&self) -> PassContext {
        PassContext {
            iteration: self.iteration,
            scene_extent: self.scene_extent,
            size_pruning: self.schedule.size_pruning_enabled(self.iteration),
        }
    }

    fn pass_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.config.seed ^ self.iteration.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Clone, split and prune from the statistics gathered since the last
    /// pass, then reset the statistics.
    ///
    /// Without any observation since the last reset this is a no-op.
    #[tracing::instrument(skip_all, fields(iteration = self.iteration))]
    pub fn densify(&mut self) -> Result<DensificationEvent, EngineError> {
        self.check_phase("densification is only allowed in the active phase")?;
        self.validate()?;
        let points_before = self.store.len();

        if !self.stats.has_evidence() {
            debug!("No gradient evidence since last reset; skipping densification");
            return Ok(self.noop_event());
        }

        let proposal = self.controller.plan(&self.store, &self.stats, self.pass_context());
        let plan = self
            .controller
            .build_edit(&self.store, &proposal, &mut self.pass_rng())?;
        let remap = self.commit(&plan)?;
        self.stats.reset();

        self.counters.densify_passes += 1;
        self.counters.points_cloned += proposal.clone.len() as u64;
        self.counters.points_split += proposal.split.len() as u64;
        self.counters.points_pruned += proposal.prune.len() as u64;
        self.counters.rejected_clones += proposal.rejected_clones as u64;
        self.counters.rejected_splits += proposal.rejected_splits as u64;

        let event = DensificationEvent {
            iteration: self.iteration,
            version: self.event_version,
            cloned: proposal.clone.len(),
            split: proposal.split.len(),
            pruned: proposal.prune.len(),
            rejected_clones: proposal.rejected_clones,
            rejected_splits: proposal.rejected_splits,
            points_before,
            points_after: self.store.len(),
            remap,
        };
        if event.rejected() > 0 {
            warn!(
                "Growth ceiling reached: {} clones and {} splits rejected",
                event.rejected_clones, event.rejected_splits
            );
        }
        info!(
            "Densified: +{} cloned, {} split, -{} pruned ({} -> {} points)",
            event.cloned, event.split, event.pruned, event.points_before, event.points_after
        );
        Ok(event)
    }

    /// Remove low-opacity (and, once enabled, oversized) points without
    /// densifying. Statistics of survivors are kept.
    #[tracing::instrument(skip_all, fields(iteration = self.iteration))]
    pub fn prune(&mut self) -> Result<DensificationEvent, EngineError> {
        self.check_phase("pruning is only allowed in the active phase")?;
        self.validate()?;
        let points_before = self.store.len();
        let prune = self
            .controller
            .prune_candidates(&self.store, &self.stats, self.pass_context(), &[]);
        if prune.is_empty() {
            return Ok(self.noop_event());
        }
        let plan = EditPlan::removal_only(points_before, &prune, self.store.max_sh_degree())?;
        let remap = self.commit(&plan)?;
        self.counters.points_pruned += prune.len() as u64;
        info!("Pruned {} points ({} remain)", prune.len(), self.store.len());
        Ok(DensificationEvent {
            iteration: self.iteration,
            version: self.event_version,
            cloned: 0,
            split: 0,
            pruned: prune.len(),
            rejected_clones: 0,
            rejected_splits: 0,
            points_before,
            points_after: self.store.len(),
            remap,
        })
    }

    fn noop_event(&self) -> DensificationEvent {
        DensificationEvent {
            iteration: self.iteration,
            version: self.event_version,
            cloned: 0,
            split: 0,
            pruned: 0,
            rejected_clones: 0,
            rejected_splits: 0,
            points_before: self.store.len(),
            points_after: self.store.len(),
            remap: IndexRemap::identity(self.store.len()),
        }
    }

    /// Apply an externally built edit to every index-aligned array.
    pub fn apply_edit(&mut self, plan: &EditPlan) -> Result<IndexRemap, EngineError> {
        self.check_phase("structural edits are only allowed in the active phase")?;
        self.validate()?;
        self.commit(plan)
    }

    /// The single transaction behind every structural edit. Everything that
    /// can fail is checked before the first array is touched.
    fn commit(&mut self, plan: &EditPlan) -> Result<IndexRemap, EngineError> {
        let len = self.store.len();
        if plan.source_len() != len {
            return Err(EngineError::shape("edit plan", len, plan.source_len()));
        }
        if plan.appended().sh_stride() != self.store.sh_stride() {
            return Err(EngineError::shape(
                "sh stride",
                self.store.sh_stride(),
                plan.appended().sh_stride(),
            ));
        }
        let remap = plan.remap();

        self.store.apply_edit(plan)?;
        self.optimizer.apply_edit(plan)?;
        self.stats.apply_edit(plan)?;

        let after = self.validate()?;
        if after != plan.result_len() {
            return Err(EngineError::shape("edited point count", plan.result_len(), after));
        }
        self.event_version += 1;
        Ok(remap)
    }

    /// Permute every index-aligned array. Refused once replication has frozen
    /// the structure, since replicas would no longer agree on indices.
    pub fn reorder(&mut self, permutation: &[usize]) -> Result<(), EngineError> {
        if self.schedule.is_frozen() {
            self.counters.rejected_edits += 1;
            return Err(EngineError::InvalidTrainingPhase {
                iteration: self.iteration,
                phase: DensityPhase::Frozen,
                reason: "reordering is not allowed once replication has frozen the structure",
            });
        }
        validate_permutation(permutation, self.store.len())?;
        self.validate()?;
        self.store.apply_permutation(permutation);
        self.optimizer.apply_permutation(permutation);
        self.stats.apply_permutation(permutation);
        self.event_version += 1;
        Ok(())
    }

    /// Lower every opacity above the reset target to it and clear the
    /// opacity group's Adam moments. Returns how many points were lowered.
    pub fn reset_opacity(&mut self) -> usize {
        let target = inverse_sigmoid(self.config.opacity_reset.target);
        let mut lowered = 0;
        for index in 0..self.store.len() {
            if self.store.opacity_logit(index) > target {
                self.store.set_opacity_logit(index, target);
                lowered += 1;
            }
        }
        self.optimizer.reset_group(Attribute::Opacity);
        self.counters.opacity_resets += 1;
        info!(
            "Opacity reset at iteration {}: {} of {} points lowered",
            self.iteration,
            lowered,
            self.store.len()
        );
        lowered
    }

    /// Disable structural edits for the rest of training.
    pub(crate) fn freeze(&mut self) {
        self.schedule.freeze();
    }

    pub fn fingerprint(&self) -> u64 {
        self.store.fingerprint()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            format_version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            iteration: self.iteration,
            store: self.store.snapshot(),
            optimizer: self.optimizer.clone(),
            stats: self.stats.clone(),
            schedule: self.schedule.clone(),
            active_sh_degree: self.active_sh_degree,
            scene_extent: self.scene_extent,
            event_version: self.event_version,
            counters: self.counters.clone(),
        }
    }

    /// Rebuild an engine exactly as it was snapshotted.
    pub fn restore(snapshot: EngineSnapshot) -> Result<Self, EngineError> {
        snapshot.config.validate()?;
        let store = PointStore::restore(snapshot.store)?;
        let engine = Self {
            controller: Self::controller_for(&snapshot.config),
            config: snapshot.config,
            store,
            optimizer: snapshot.optimizer,
            stats: snapshot.stats,
            schedule: snapshot.schedule,
            iteration: snapshot.iteration,
            active_sh_degree: snapshot.active_sh_degree,
            scene_extent: snapshot.scene_extent,
            event_version: snapshot.event_version,
            counters: snapshot.counters,
        };
        engine.validate()?;
        Ok(engine)
    }

    /// Restore for continued training: like [`Self::restore`] but with
    /// gradient statistics zeroed.
    pub fn resume(snapshot: EngineSnapshot) -> Result<Self, EngineError> {
        let mut engine = Self::restore(snapshot)?;
        engine.stats.reset();
        info!(
            "Resumed at iteration {} ({} phase, {} points)",
            engine.iteration,
            engine.phase(),
            engine.store.len()
        );
        Ok(engine)
    }
}
