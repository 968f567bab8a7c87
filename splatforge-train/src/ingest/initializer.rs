//! Gaussian initialization from seed point clouds

use crate::error::EngineError;
use crate::store::{PointBatch, PointRow};
use glam::{IVec3, Vec3};
use rayon::prelude::*;
use splatforge_data::{SeedPoint, rgb_to_sh_dc};
use std::collections::HashMap;
use tracing::debug;

/// How initial Gaussian extents are chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleStrategy {
    /// Root mean squared distance to the `k` nearest neighbours
    NearestNeighbors { k: usize },
    /// Same isotropic scale for every point
    Fixed(f32),
}

/// Builds the initial point batch from seed points
#[derive(Debug, Clone)]
pub struct GaussianInitializer {
    strategy: ScaleStrategy,
    max_sh_degree: u32,
    initial_opacity: f32,
    /// Used when a point has no neighbours (e.g. a single seed point)
    fallback_scale: f32,
}

impl GaussianInitializer {
    pub fn new(max_sh_degree: u32) -> Self {
        Self {
            strategy: ScaleStrategy::NearestNeighbors { k: 3 },
            max_sh_degree,
            initial_opacity: 0.1,
            fallback_scale: 0.01,
        }
    }

    pub fn with_strategy(mut self, strategy: ScaleStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_initial_opacity(mut self, opacity: f32) -> Self {
        self.initial_opacity = opacity;
        self
    }

    pub fn with_fallback_scale(mut self, scale: f32) -> Self {
        self.fallback_scale = scale;
        self
    }

    /// One Gaussian per seed point.
    pub fn from_seed_points(&self, points: &[SeedPoint]) -> Result<PointBatch, EngineError> {
        let scales = match self.strategy {
            ScaleStrategy::Fixed(scale) => vec![scale; points.len()],
            ScaleStrategy::NearestNeighbors { k } => self.neighbor_scales(points, k),
        };
        let mut batch = PointBatch::with_capacity(self.max_sh_degree, points.len());
        for (point, &scale) in points.iter().zip(&scales) {
            let row = PointRow::new(point.position, scale.max(1e-7), self.initial_opacity, self.max_sh_degree)
                .with_sh_dc(rgb_to_sh_dc(point.color));
            batch.push(&row)?;
        }
        debug!("Initialized {} Gaussians", batch.len());
        Ok(batch)
    }

    /// Per-point scale from a voxel-hash neighbour search.
    fn neighbor_scales(&self, points: &[SeedPoint], k: usize) -> Vec<f32> {
        if points.len() < 2 || k == 0 {
            return vec![self.fallback_scale; points.len()];
        }
        let grid = VoxelGrid::build(points);
        points
            .par_iter()
            .enumerate()
            .map(|(i, point)| {
                grid.mean_squared_knn(points, i, point.position, k)
                    .map(f32::sqrt)
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .unwrap_or(self.fallback_scale)
            })
            .collect()
    }
}

/// Uniform hash grid over the seed points.
struct VoxelGrid {
    cell: f32,
    cells: HashMap<IVec3, Vec<usize>>,
}

impl VoxelGrid {
    /// Rings searched beyond the point's own cell before giving up.
    const MAX_RINGS: i32 = 4;

    fn build(points: &[SeedPoint]) -> Self {
        let (min, max) = points.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(lo, hi), p| (lo.min(p.position), hi.max(p.position)),
        );
        let diagonal = (max - min).length().max(f32::EPSILON);
        // About one point per cell for a surface-like distribution.
        let cell = (diagonal / (points.len() as f32).sqrt()).max(f32::EPSILON);

        let mut cells: HashMap<IVec3, Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(Self::key(cell, p.position)).or_default().push(i);
        }
        Self { cell, cells }
    }

    fn key(cell: f32, position: Vec3) -> IVec3 {
        (position / cell).floor().as_ivec3()
    }

    /// Mean squared distance to the `k` nearest other points.
    fn mean_squared_knn(&self, points: &[SeedPoint], skip: usize, position: Vec3, k: usize) -> Option<f32> {
        let center = Self::key(self.cell, position);
        let mut nearest: Vec<f32> = Vec::with_capacity(k + 1);
        for ring in 0..=Self::MAX_RINGS {
            for x in -ring..=ring {
                for y in -ring..=ring {
                    for z in -ring..=ring {
                        if x.abs().max(y.abs()).max(z.abs()) != ring {
                            continue;
                        }
                        let Some(members) = self.cells.get(&(center + IVec3::new(x, y, z))) else {
                            continue;
                        };
                        for &j in members {
                            if j != skip {
                                nearest.push(points[j].position.distance_squared(position));
                            }
                        }
                    }
                }
            }
            // Anything beyond this ring is at least `ring * cell` away.
            nearest.sort_by(f32::total_cmp);
            let bound = (ring as f32 * self.cell).powi(2);
            if nearest.len() >= k && nearest[k - 1] <= bound {
                break;
            }
        }
        if nearest.is_empty() {
            return None;
        }
        let taken = nearest.len().min(k);
        Some(nearest[..taken].iter().sum::<f32>() / taken as f32)
    }
}
