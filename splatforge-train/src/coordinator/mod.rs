//! Multi-device data-parallel training.
//!
//! Replication is only admitted once structure is settled: every replica is
//! built from one serialized snapshot and the policy is frozen, so replicas
//! can never disagree on point count or order. Each step shards views across
//! replicas, runs forward/backward in parallel, reduces gradients in replica
//! order and applies the same reduced gradients everywhere.

use crate::density::DensityPhase;
use crate::driver::{Conditioning, LossFunction, Rasterizer, ViewSource, compute_view_gradients};
use crate::engine::TrainingEngine;
use crate::error::{EngineError, TrainError};
use crate::optim::PointGradients;
use rayon::prelude::*;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identifier of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// One full copy of the engine bound to a device.
#[derive(Debug, Clone)]
pub struct DeviceReplica {
    pub device: DeviceId,
    pub engine: TrainingEngine,
}

/// Replication was refused; the engine is handed back untouched.
#[derive(Debug, Error)]
#[error("Replication rejected: {error}")]
pub struct ReplicationRejected {
    pub engine: Box<TrainingEngine>,
    #[source]
    pub error: EngineError,
}

/// Outcome of one data-parallel step.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStepReport {
    pub iteration: u64,
    pub views: usize,
    /// Mean loss over all views of the step.
    pub loss: f32,
}

/// Replicate `engine` onto `devices`.
///
/// Fails with `InvalidTrainingPhase` while densification is active. During
/// warmup replication is allowed but freezes the structure for the rest of
/// training.
pub fn enable_replication(
    mut engine: TrainingEngine,
    devices: &[DeviceId],
) -> Result<ReplicaGroup, ReplicationRejected> {
    let phase = engine.phase();
    let reject = |engine: TrainingEngine, reason: &'static str| ReplicationRejected {
        error: EngineError::InvalidTrainingPhase {
            iteration: engine.iteration(),
            phase,
            reason,
        },
        engine: Box::new(engine),
    };

    if devices.is_empty() {
        return Err(reject(engine, "replication needs at least one device"));
    }
    if phase == DensityPhase::Active {
        warn!(
            "Refusing replication at iteration {}: densification is active",
            engine.iteration()
        );
        return Err(reject(
            engine,
            "replication is not allowed while densification is active",
        ));
    }
    if phase == DensityPhase::Warmup {
        warn!(
            "Replicating during warmup at iteration {}; densification is disabled for the rest of training",
            engine.iteration()
        );
    }

    engine.freeze();
    let snapshot = engine.snapshot();
    let payload = match serde_json::to_string(&snapshot) {
        Ok(payload) => payload,
        Err(error) => {
            return Err(ReplicationRejected {
                error: EngineError::Snapshot(error.to_string()),
                engine: Box::new(engine),
            });
        }
    };

    let mut replicas = Vec::with_capacity(devices.len());
    for &device in devices {
        let restored = serde_json::from_str(&payload)
            .map_err(|error| EngineError::Snapshot(error.to_string()))
            .and_then(TrainingEngine::restore);
        match restored {
            Ok(replica) => replicas.push(DeviceReplica {
                device,
                engine: replica,
            }),
            Err(error) => {
                return Err(ReplicationRejected {
                    engine: Box::new(engine),
                    error,
                });
            }
        }
    }

    info!(
        "Replicated {} points onto {} devices ({} bytes broadcast)",
        engine.len(),
        replicas.len(),
        payload.len()
    );
    Ok(ReplicaGroup {
        replicas,
        rejected_edits: 0,
    })
}

/// Engines replicated across devices; replica 0 is authoritative.
#[derive(Debug, Clone)]
pub struct ReplicaGroup {
    replicas: Vec<DeviceReplica>,
    rejected_edits: u64,
}

impl ReplicaGroup {
    pub fn replicas(&self) -> &[DeviceReplica] {
        &self.replicas
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.replicas.iter().map(|r| r.device).collect()
    }

    pub fn primary(&self) -> &TrainingEngine {
        &self.replicas[0].engine
    }

    pub fn iteration(&self) -> u64 {
        self.primary().iteration()
    }

    /// Structural edits refused since replication.
    pub fn rejected_edits(&self) -> u64 {
        self.rejected_edits
    }

    /// Replicas never densify. The call is refused and counted.
    pub fn try_densify(&mut self) -> Result<(), EngineError> {
        self.rejected_edits += 1;
        warn!(
            "Densification refused at iteration {}: training is replicated",
            self.iteration()
        );
        Err(EngineError::InvalidTrainingPhase {
            iteration: self.iteration(),
            phase: DensityPhase::Frozen,
            reason: "structural edits are disabled while replicated",
        })
    }

    /// One data-parallel iteration over `view_indices`.
    ///
    /// Views are dealt round-robin to replicas. Gradients are summed in
    /// replica order after all replicas finish and divided by the number of
    /// views, so every replica applies bit-identical updates.
    pub fn step<R, L, C, V>(
        &mut self,
        views: &V,
        view_indices: &[usize],
        rasterizer: &R,
        loss: &L,
        conditioning: &C,
    ) -> Result<GroupStepReport, TrainError>
    where
        R: Rasterizer,
        L: LossFunction,
        C: Conditioning,
        V: ViewSource + ?Sized,
    {
        if view_indices.is_empty() {
            return Err(TrainError::NoViews);
        }
        for &index in view_indices {
            if views.view(index).is_none() {
                return Err(TrainError::ViewOutOfRange {
                    index,
                    len: views.len(),
                });
            }
        }

        let count = self.replicas.len();
        let shards: Vec<Vec<usize>> = (0..count)
            .map(|r| view_indices.iter().copied().skip(r).step_by(count).collect())
            .collect();

        // Barrier: every replica finishes backward before any optimizer step.
        let partials: Vec<_> = self
            .replicas
            .par_iter()
            .zip(shards.par_iter())
            .map(|(replica, shard)| -> Result<(f32, Option<PointGradients>), EngineError> {
                let mut loss_sum = 0.0f32;
                let mut sum: Option<PointGradients> = None;
                for &index in shard {
                    let Some(view) = views.view(index) else {
                        continue;
                    };
                    let result =
                        compute_view_gradients(&replica.engine, view, rasterizer, loss, conditioning)?;
                    loss_sum += result.loss;
                    match &mut sum {
                        Some(total) => total.accumulate(&result.gradients)?,
                        None => sum = Some(result.gradients),
                    }
                }
                Ok((loss_sum, sum))
            })
            .collect();

        let mut reduced: Option<PointGradients> = None;
        let mut loss_total = 0.0f32;
        for partial in partials {
            let (loss_sum, gradients) = partial?;
            loss_total += loss_sum;
            if let Some(gradients) = gradients {
                match &mut reduced {
                    Some(total) => total.accumulate(&gradients)?,
                    None => reduced = Some(gradients),
                }
            }
        }
        let Some(mut reduced) = reduced else {
            return Err(TrainError::NoViews);
        };
        let total_views = view_indices.len();
        reduced.scale(1.0 / total_views as f32);

        for replica in &mut self.replicas {
            replica.engine.apply_gradients(&reduced)?;
            replica.engine.end_iteration()?;
        }
        debug!(
            "Replicated step {} over {} views",
            self.iteration(),
            total_views
        );

        Ok(GroupStepReport {
            iteration: self.iteration(),
            views: total_views,
            loss: loss_total / total_views as f32,
        })
    }

    /// Check that every replica holds the same points as the primary.
    pub fn verify_consistency(&self) -> Result<(), EngineError> {
        let primary = self.primary();
        let expected = primary.fingerprint();
        for replica in &self.replicas[1..] {
            if replica.engine.len() != primary.len() {
                return Err(EngineError::shape(
                    format!("replica {} point count", replica.device),
                    primary.len(),
                    replica.engine.len(),
                ));
            }
            let found = replica.engine.fingerprint();
            if found != expected {
                return Err(EngineError::ReplicaDivergence {
                    device: replica.device.to_string(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Collapse back to the authoritative engine, e.g. for checkpointing.
    pub fn into_primary(self) -> TrainingEngine {
        let mut replicas = self.replicas;
        replicas.swap_remove(0).engine
    }
}
