//! Photometric loss with optional inverse-depth regularization.

use crate::config::{DepthLossKind, DepthRegularizationConfig};
use crate::driver::{ImageGradient, LossFunction, LossOutput, RenderedFrame};
use crate::error::RenderError;
use crate::ingest::TrainingView;
use crate::optim::WeightSchedule;

/// Mean absolute RGB error, plus a decaying inverse-depth term when both the
/// view and the render carry inverse depth.
#[derive(Debug, Clone)]
pub struct PhotometricLoss {
    depth: Option<(DepthLossKind, WeightSchedule)>,
}

impl PhotometricLoss {
    pub fn new() -> Self {
        Self { depth: None }
    }

    pub fn with_depth_regularization(mut self, config: &DepthRegularizationConfig) -> Self {
        self.depth = Some((config.kind, WeightSchedule::from(&config.weight)));
        self
    }

    /// Depth term weight at `iteration`, if enabled.
    pub fn depth_weight(&self, iteration: u64) -> Option<f32> {
        self.depth.map(|(_, schedule)| schedule.at(iteration))
    }
}

impl Default for PhotometricLoss {
    fn default() -> Self {
        Self::new()
    }
}

fn l1(rendered: &[f32], target: &[f32], weight: f32) -> (f32, Vec<f32>) {
    let n = rendered.len().max(1) as f32;
    let mut value = 0.0;
    let gradient = rendered
        .iter()
        .zip(target)
        .map(|(&r, &t)| {
            let d = r - t;
            value += d.abs();
            // Subgradient 0 at d == 0.
            let sign = if d > 0.0 {
                1.0
            } else if d < 0.0 {
                -1.0
            } else {
                0.0
            };
            weight * sign / n
        })
        .collect();
    (weight * value / n, gradient)
}

fn l2(rendered: &[f32], target: &[f32], weight: f32) -> (f32, Vec<f32>) {
    let n = rendered.len().max(1) as f32;
    let mut value = 0.0;
    let gradient = rendered
        .iter()
        .zip(target)
        .map(|(&r, &t)| {
            let d = r - t;
            value += d * d;
            weight * 2.0 * d / n
        })
        .collect();
    (weight * value / n, gradient)
}

impl LossFunction for PhotometricLoss {
    fn evaluate(
        &self,
        frame: &RenderedFrame,
        view: &TrainingView,
        iteration: u64,
    ) -> Result<LossOutput, RenderError> {
        if frame.image.dimensions() != view.image.dimensions() {
            return Err(RenderError::new(format!(
                "rendered {:?} but target is {:?}",
                frame.image.dimensions(),
                view.image.dimensions()
            )));
        }
        let (mut value, image) = l1(frame.image.as_raw(), view.image.as_raw(), 1.0);

        let mut inverse_depth = None;
        if let (Some((kind, schedule)), Some(rendered), Some(target)) =
            (self.depth, &frame.inverse_depth, &view.inverse_depth)
        {
            if rendered.len() != target.len() {
                return Err(RenderError::new(format!(
                    "inverse depth has {} values, target has {}",
                    rendered.len(),
                    target.len()
                )));
            }
            let weight = schedule.at(iteration);
            let (depth_value, depth_gradient) = match kind {
                DepthLossKind::L1 => l1(rendered, target, weight),
                DepthLossKind::L2 => l2(rendered, target, weight),
            };
            value += depth_value;
            inverse_depth = Some(depth_gradient);
        }

        Ok(LossOutput {
            value,
            gradient: ImageGradient {
                image,
                inverse_depth,
            },
        })
    }
}
