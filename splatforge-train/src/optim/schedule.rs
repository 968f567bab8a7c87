//! Learning-rate and loss-weight schedules.

use crate::config::{LearningRates, WeightScheduleConfig};
use crate::store::Attribute;

/// Log-linear interpolation from `init` to `final_value` over `max_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub init: f32,
    pub final_value: f32,
    pub max_steps: u64,
}

impl ExponentialDecay {
    pub fn new(init: f32, final_value: f32, max_steps: u64) -> Self {
        Self {
            init,
            final_value,
            max_steps,
        }
    }

    pub fn at(&self, step: u64) -> f32 {
        if self.init <= 0.0 || self.final_value <= 0.0 {
            return 0.0;
        }
        let t = if self.max_steps == 0 {
            1.0
        } else {
            (step as f64 / self.max_steps as f64).clamp(0.0, 1.0)
        };
        let log_lerp = (self.init as f64).ln() * (1.0 - t) + (self.final_value as f64).ln() * t;
        log_lerp.exp() as f32
    }
}

/// `init * final_factor^(min(step / max_steps, 1))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSchedule {
    pub init: f32,
    pub final_factor: f32,
    pub max_steps: u64,
}

impl WeightSchedule {
    pub fn at(&self, step: u64) -> f32 {
        let t = if self.max_steps == 0 {
            1.0
        } else {
            (step as f32 / self.max_steps as f32).min(1.0)
        };
        self.init * self.final_factor.powf(t)
    }
}

impl From<&WeightScheduleConfig> for WeightSchedule {
    fn from(config: &WeightScheduleConfig) -> Self {
        Self {
            init: config.init,
            final_factor: config.final_factor,
            max_steps: config.max_steps,
        }
    }
}

/// Learning rates in effect for one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttributeRates {
    pub position: f32,
    pub log_scale: f32,
    pub rotation: f32,
    pub opacity: f32,
    /// Applied to the first three SH scalars (the DC band).
    pub sh_dc: f32,
    pub sh_rest: f32,
}

impl AttributeRates {
    /// Rates at `iteration`; the position rate decays and scales with the scene extent.
    pub fn at(rates: &LearningRates, iteration: u64, scene_extent: f32) -> Self {
        let position = ExponentialDecay::new(
            rates.position_init * scene_extent,
            rates.position_final * scene_extent,
            rates.position_max_steps,
        );
        Self {
            position: position.at(iteration),
            log_scale: rates.log_scale,
            rotation: rates.rotation,
            opacity: rates.opacity,
            sh_dc: rates.sh_dc,
            sh_rest: rates.sh_rest,
        }
    }

    /// Rate for scalar `offset` within a row of `attribute`.
    pub fn for_element(&self, attribute: Attribute, offset: usize) -> f32 {
        match attribute {
            Attribute::Position => self.position,
            Attribute::LogScale => self.log_scale,
            Attribute::Rotation => self.rotation,
            Attribute::Opacity => self.opacity,
            Attribute::Sh if offset < 3 => self.sh_dc,
            Attribute::Sh => self.sh_rest,
        }
    }
}
