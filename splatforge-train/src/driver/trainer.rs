//! Single-device optimization loop.

use crate::checkpoint::RunDirectory;
use crate::density::DensityOutcome;
use crate::driver::{
    Conditioning, IdentityConditioning, LossFunction, Rasterizer, ViewSource,
    compute_view_gradients,
};
use crate::engine::{EngineCounters, TrainingEngine};
use crate::error::TrainError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use tracing::{info, warn};

/// What happened during one iteration.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Iteration number after the step completed.
    pub iteration: u64,
    pub view_index: usize,
    pub loss: f32,
    pub visible: usize,
    pub points: usize,
    pub outcome: DensityOutcome,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub iterations: u64,
    pub points: usize,
    /// Mean loss over the last logging window.
    pub recent_loss: f32,
    pub checkpoints: Vec<PathBuf>,
    pub counters: EngineCounters,
}

/// Iterations between progress log lines.
const LOG_INTERVAL: u64 = 100;

/// Drives one engine: render, loss, backward, optimizer step, density control.
pub struct Trainer<R, L, V, C = IdentityConditioning> {
    engine: TrainingEngine,
    rasterizer: R,
    loss: L,
    views: V,
    conditioning: C,
    run: Option<RunDirectory>,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl<R, L, V> Trainer<R, L, V>
where
    R: Rasterizer,
    L: LossFunction,
    V: ViewSource,
{
    pub fn new(engine: TrainingEngine, rasterizer: R, loss: L, views: V) -> Result<Self, TrainError> {
        if views.is_empty() {
            return Err(TrainError::NoViews);
        }
        let rng = StdRng::seed_from_u64(engine.config().seed);
        Ok(Self {
            engine,
            rasterizer,
            loss,
            views,
            conditioning: IdentityConditioning,
            run: None,
            rng,
            order: Vec::new(),
            cursor: 0,
        })
    }
}

impl<R, L, V, C> Trainer<R, L, V, C>
where
    R: Rasterizer,
    L: LossFunction,
    V: ViewSource,
    C: Conditioning,
{
    pub fn with_conditioning<C2: Conditioning>(self, conditioning: C2) -> Trainer<R, L, V, C2> {
        Trainer {
            engine: self.engine,
            rasterizer: self.rasterizer,
            loss: self.loss,
            views: self.views,
            conditioning,
            run: self.run,
            rng: self.rng,
            order: self.order,
            cursor: self.cursor,
        }
    }

    /// Save checkpoints into `run`.
    pub fn with_run_directory(mut self, run: RunDirectory) -> Self {
        self.run = Some(run);
        self
    }

    pub fn engine(&self) -> &TrainingEngine {
        &self.engine
    }

    pub fn conditioning(&self) -> &C {
        &self.conditioning
    }

    pub fn into_engine(self) -> TrainingEngine {
        self.engine
    }

    /// Next view index; views are visited in a fresh random order each epoch.
    pub fn next_view(&mut self) -> usize {
        if self.cursor >= self.order.len() {
            self.order = (0..self.views.len()).collect();
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        index
    }

    /// One iteration on view `view_index`.
    ///
    /// Gradient statistics are recorded before the optimizer step, and both
    /// before any density control scheduled for this iteration.
    pub fn step(&mut self, view_index: usize) -> Result<StepReport, TrainError> {
        let view = self.views.view(view_index).ok_or(TrainError::ViewOutOfRange {
            index: view_index,
            len: self.views.len(),
        })?;
        let result = compute_view_gradients(
            &self.engine,
            view,
            &self.rasterizer,
            &self.loss,
            &self.conditioning,
        )?;

        self.engine.observe(&result.feedback)?;
        self.engine.apply_gradients(&result.gradients)?;
        let outcome = self.engine.end_iteration()?;
        if let Some(event) = &outcome.event {
            if !event.is_noop() {
                self.conditioning.on_points_remapped(&event.remap);
            }
        }

        Ok(StepReport {
            iteration: self.engine.iteration(),
            view_index,
            loss: result.loss,
            visible: result.feedback.len(),
            points: self.engine.len(),
            outcome,
        })
    }

    /// Run `iterations` more iterations, checkpointing on the configured
    /// interval and once at the end.
    pub fn run(&mut self, iterations: u64) -> Result<RunSummary, TrainError> {
        let interval = self.engine.config().checkpoint_interval;
        let mut checkpoints = Vec::new();
        let mut window_loss = 0.0f64;
        let mut window_len = 0u64;
        let mut recent_loss = 0.0f32;

        for _ in 0..iterations {
            let view_index = self.next_view();
            let report = match self.step(view_index) {
                Ok(report) => report,
                Err(TrainError::Engine(error)) if !error.is_fatal() => {
                    warn!("Continuing after recoverable error: {}", error);
                    continue;
                }
                Err(error) => return Err(error),
            };

            window_loss += report.loss as f64;
            window_len += 1;
            if report.iteration % LOG_INTERVAL == 0 {
                recent_loss = (window_loss / window_len as f64) as f32;
                info!(
                    "Iteration {}: loss {:.5}, {} points, {} phase",
                    report.iteration,
                    recent_loss,
                    report.points,
                    self.engine.phase()
                );
                window_loss = 0.0;
                window_len = 0;
            }

            if interval > 0 && report.iteration % interval == 0 {
                if let Some(path) = self.save_checkpoint()? {
                    checkpoints.push(path);
                }
            }
        }

        if window_len > 0 {
            recent_loss = (window_loss / window_len as f64) as f32;
        }
        let already_saved = interval > 0 && self.engine.iteration() % interval == 0;
        if !already_saved {
            if let Some(path) = self.save_checkpoint()? {
                checkpoints.push(path);
            }
        }

        Ok(RunSummary {
            iterations: self.engine.iteration(),
            points: self.engine.len(),
            recent_loss,
            checkpoints,
            counters: self.engine.counters().clone(),
        })
    }

    fn save_checkpoint(&self) -> Result<Option<PathBuf>, TrainError> {
        match &self.run {
            Some(run) => Ok(Some(run.save(&self.engine.snapshot())?)),
            None => Ok(None),
        }
    }
}
