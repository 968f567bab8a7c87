//! Training hyperparameters.
//!
//! Every threshold used by density control is configuration. Defaults follow
//! common Gaussian splatting practice; all sections use `#[serde(default)]`
//! so partial JSON files only override what they name.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Spherical-harmonics degree schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShConfig {
    pub max_degree: u32,
    /// Iterations between degree increments.
    pub degree_interval: u64,
}

impl Default for ShConfig {
    fn default() -> Self {
        Self {
            max_degree: 3,
            degree_interval: 1000,
        }
    }
}

/// Iteration windows for structural edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub densify_from: u64,
    pub densify_until: u64,
    pub densify_interval: u64,
    pub opacity_reset_interval: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            densify_from: 500,
            densify_until: 15_000,
            densify_interval: 100,
            opacity_reset_interval: 3000,
        }
    }
}

/// How split children inherit the parent's opacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitOpacity {
    /// Children copy the parent's opacity.
    Copy,
    /// Children get `1 - (1 - a)^(1/n)` so that `n` stacked children
    /// composite to the parent's alpha.
    Conserve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensifyConfig {
    /// Mean view-space positional gradient norm that marks a point as
    /// under-reconstructed.
    pub grad_threshold: f32,
    /// Size threshold as a fraction of the scene extent; separates clone
    /// (small) from split (large).
    pub percent_dense: f32,
    pub split_count: usize,
    /// Children scale = parent scale / `scale_divisor`.
    pub scale_divisor: f32,
    pub split_opacity: SplitOpacity,
}

impl Default for DensifyConfig {
    fn default() -> Self {
        Self {
            grad_threshold: 0.0002,
            percent_dense: 0.01,
            split_count: 2,
            scale_divisor: 1.6,
            split_opacity: SplitOpacity::Copy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    pub min_opacity: f32,
    /// Maximum projected radius in pixels; 0 disables the screen-space test.
    pub max_screen_size: f32,
    /// Maximum world-space scale as a fraction of the scene extent.
    pub world_size_fraction: f32,
    /// Remove points that received no observation since the last reset.
    pub prune_unobserved: bool,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            min_opacity: 0.005,
            max_screen_size: 20.0,
            world_size_fraction: 0.1,
            prune_unobserved: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpacityResetConfig {
    pub enabled: bool,
    /// Opacities above this value are lowered to it.
    pub target: f32,
}

impl Default for OpacityResetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: 0.01,
        }
    }
}

/// Per-attribute Adam learning rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRates {
    /// Position rates are multiplied by the scene extent.
    pub position_init: f32,
    pub position_final: f32,
    pub position_max_steps: u64,
    pub log_scale: f32,
    pub rotation: f32,
    pub opacity: f32,
    pub sh_dc: f32,
    pub sh_rest: f32,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            position_init: 0.000_16,
            position_final: 0.000_001_6,
            position_max_steps: 30_000,
            log_scale: 0.005,
            rotation: 0.001,
            opacity: 0.05,
            sh_dc: 0.0025,
            sh_rest: 0.0025 / 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthLossKind {
    L1,
    L2,
}

/// Decaying weight: `init * final_factor^(min(step / max_steps, 1))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightScheduleConfig {
    pub init: f32,
    pub final_factor: f32,
    pub max_steps: u64,
}

impl Default for WeightScheduleConfig {
    fn default() -> Self {
        Self {
            init: 1.0,
            final_factor: 0.01,
            max_steps: 30_000,
        }
    }
}

/// Inverse-depth regularization, applied when a view carries a disparity map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthRegularizationConfig {
    pub kind: DepthLossKind,
    pub weight: WeightScheduleConfig,
}

impl Default for DepthRegularizationConfig {
    fn default() -> Self {
        Self {
            kind: DepthLossKind::L1,
            weight: WeightScheduleConfig::default(),
        }
    }
}

/// Top-level training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub seed: u64,
    pub iterations: u64,
    /// Iterations between checkpoints; 0 disables checkpointing.
    pub checkpoint_interval: u64,
    /// Upper bound on the number of points; growth beyond it is rejected.
    pub growth_ceiling: Option<usize>,
    pub sh: ShConfig,
    pub schedule: ScheduleConfig,
    pub densify: DensifyConfig,
    pub prune: PruneConfig,
    pub opacity_reset: OpacityResetConfig,
    pub learning_rates: LearningRates,
    pub adam: AdamConfig,
    pub depth_regularization: DepthRegularizationConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            iterations: 30_000,
            checkpoint_interval: 7000,
            growth_ceiling: None,
            sh: ShConfig::default(),
            schedule: ScheduleConfig::default(),
            densify: DensifyConfig::default(),
            prune: PruneConfig::default(),
            opacity_reset: OpacityResetConfig::default(),
            learning_rates: LearningRates::default(),
            adam: AdamConfig::default(),
            depth_regularization: DepthRegularizationConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Read and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        debug!("Loaded training config from {}", path.display());
        Ok(config)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_growth_ceiling(mut self, ceiling: usize) -> Self {
        self.growth_ceiling = Some(ceiling);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_densify(mut self, densify: DensifyConfig) -> Self {
        self.densify = densify;
        self
    }

    pub fn with_prune(mut self, prune: PruneConfig) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_max_sh_degree(mut self, degree: u32) -> Self {
        self.sh.max_degree = degree;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.sh.max_degree > 4 {
            return Err(invalid("sh.max_degree", "at most degree 4 is supported"));
        }
        if self.sh.degree_interval == 0 {
            return Err(invalid("sh.degree_interval", "must be positive"));
        }
        if self.schedule.densify_interval == 0 {
            return Err(invalid("schedule.densify_interval", "must be positive"));
        }
        if self.schedule.opacity_reset_interval == 0 {
            return Err(invalid("schedule.opacity_reset_interval", "must be positive"));
        }
        if self.schedule.densify_from > self.schedule.densify_until {
            return Err(invalid(
                "schedule.densify_from",
                format!(
                    "{} is after densify_until {}",
                    self.schedule.densify_from, self.schedule.densify_until
                ),
            ));
        }
        if !(self.densify.grad_threshold >= 0.0) {
            return Err(invalid("densify.grad_threshold", "must be non-negative"));
        }
        if !(self.densify.percent_dense > 0.0) {
            return Err(invalid("densify.percent_dense", "must be positive"));
        }
        if self.densify.split_count < 2 {
            return Err(invalid("densify.split_count", "a split needs at least two children"));
        }
        if !(self.densify.scale_divisor > 0.0) {
            return Err(invalid("densify.scale_divisor", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.prune.min_opacity) {
            return Err(invalid("prune.min_opacity", "must lie in [0, 1)"));
        }
        if !(self.opacity_reset.target > 0.0 && self.opacity_reset.target < 1.0) {
            return Err(invalid("opacity_reset.target", "must lie in (0, 1)"));
        }
        if !(0.0..1.0).contains(&self.adam.beta1) || !(0.0..1.0).contains(&self.adam.beta2) {
            return Err(invalid("adam", "betas must lie in [0, 1)"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides_only_named_fields() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "growth_ceiling": 1040, "densify": {{ "grad_threshold": 0.2 }} }}"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = TrainConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.growth_ceiling, Some(1040));
        assert_eq!(config.densify.grad_threshold, 0.2);
        assert_eq!(config.densify.split_count, 2);
        assert_eq!(config.schedule, ScheduleConfig::default());
    }

    #[test]
    fn test_rejects_single_child_split() {
        let mut config = TrainConfig::default();
        config.densify.split_count = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "densify.split_count",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_inverted_schedule() {
        let config = TrainConfig::default().with_schedule(ScheduleConfig {
            densify_from: 100,
            densify_until: 10,
            ..ScheduleConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = TrainConfig::default().with_growth_ceiling(5000).with_seed(7);
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
