//! View-space positional gradient statistics.

use crate::error::EngineError;
use crate::store::{EditPlan, IndexAligned};
use crate::store::edit::{permute_vec, retain_vec};
use serde::{Deserialize, Serialize};

/// Per-view output of a backward pass that feeds density control.
///
/// `visible`, `grad_norms` and `screen_radii` are parallel: entry `k`
/// describes point `visible[k]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameFeedback {
    pub visible: Vec<usize>,
    /// Norm of the loss gradient w.r.t. the projected 2D position.
    pub grad_norms: Vec<f32>,
    /// Projected radius in pixels.
    pub screen_radii: Vec<f32>,
}

impl FrameFeedback {
    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }
}

/// Running sums of positional gradient norms since the last reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientAccumulator {
    grad_sum: Vec<f32>,
    observations: Vec<u32>,
    max_screen_radius: Vec<f32>,
    views_observed: u64,
}

impl GradientAccumulator {
    pub fn new(points: usize) -> Self {
        Self {
            grad_sum: vec![0.0; points],
            observations: vec![0; points],
            max_screen_radius: vec![0.0; points],
            views_observed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.grad_sum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grad_sum.is_empty()
    }

    pub fn reserve(&mut self, points: usize) {
        self.grad_sum.reserve(points);
        self.observations.reserve(points);
        self.max_screen_radius.reserve(points);
    }

    /// Record one visible observation of point `index`.
    pub fn observe(&mut self, index: usize, grad_norm: f32) -> Result<(), EngineError> {
        let len = self.len();
        let sum = self
            .grad_sum
            .get_mut(index)
            .ok_or(EngineError::IndexOutOfBounds { index, len })?;
        if !grad_norm.is_finite() {
            return Err(EngineError::NonFiniteFeedback {
                field: "gradient norm",
                index,
            });
        }
        *sum += grad_norm;
        self.observations[index] += 1;
        Ok(())
    }

    /// Record every visible point of one rendered view.
    ///
    /// The frame is validated first; on error nothing is recorded.
    pub fn observe_frame(&mut self, frame: &FrameFeedback) -> Result<(), EngineError> {
        if frame.grad_norms.len() != frame.visible.len() {
            return Err(EngineError::shape(
                "feedback gradient norms",
                frame.visible.len(),
                frame.grad_norms.len(),
            ));
        }
        if frame.screen_radii.len() != frame.visible.len() {
            return Err(EngineError::shape(
                "feedback screen radii",
                frame.visible.len(),
                frame.screen_radii.len(),
            ));
        }
        let len = self.len();
        if let Some(&index) = frame.visible.iter().find(|&&i| i >= len) {
            return Err(EngineError::IndexOutOfBounds { index, len });
        }
        if let Some(position) = frame.grad_norms.iter().position(|norm| !norm.is_finite()) {
            return Err(EngineError::NonFiniteFeedback {
                field: "gradient norm",
                index: frame.visible[position],
            });
        }
        if let Some(position) = frame.screen_radii.iter().position(|radius| !radius.is_finite()) {
            return Err(EngineError::NonFiniteFeedback {
                field: "screen radius",
                index: frame.visible[position],
            });
        }

        for ((&index, &norm), &radius) in frame
            .visible
            .iter()
            .zip(&frame.grad_norms)
            .zip(&frame.screen_radii)
        {
            self.grad_sum[index] += norm;
            self.observations[index] += 1;
            self.max_screen_radius[index] = self.max_screen_radius[index].max(radius);
        }
        self.views_observed += 1;
        Ok(())
    }

    /// Mean gradient norm over the observations since reset; 0 if unobserved.
    pub fn mean_since_reset(&self, index: usize) -> f32 {
        match self.observations.get(index) {
            Some(&count) if count > 0 => self.grad_sum[index] / count as f32,
            _ => 0.0,
        }
    }

    pub fn observations(&self, index: usize) -> u32 {
        self.observations.get(index).copied().unwrap_or(0)
    }

    pub fn max_screen_radius(&self, index: usize) -> f32 {
        self.max_screen_radius.get(index).copied().unwrap_or(0.0)
    }

    pub fn views_observed(&self) -> u64 {
        self.views_observed
    }

    /// Whether any point was observed since the last reset.
    pub fn has_evidence(&self) -> bool {
        self.observations.iter().any(|&count| count > 0)
    }

    pub fn reset(&mut self) {
        self.grad_sum.fill(0.0);
        self.observations.fill(0);
        self.max_screen_radius.fill(0.0);
        self.views_observed = 0;
    }

    pub fn validate(&self) -> Result<usize, EngineError> {
        let len = self.len();
        if self.observations.len() != len {
            return Err(EngineError::shape("observation counts", len, self.observations.len()));
        }
        if self.max_screen_radius.len() != len {
            return Err(EngineError::shape("screen radii", len, self.max_screen_radius.len()));
        }
        Ok(len)
    }
}

impl IndexAligned for GradientAccumulator {
    fn aligned_len(&self) -> usize {
        self.len()
    }

    fn apply_edit(&mut self, plan: &EditPlan) -> Result<(), EngineError> {
        if plan.source_len() != self.len() {
            return Err(EngineError::shape("gradient statistics", plan.source_len(), self.len()));
        }
        let total = self.len() + plan.appended_len();
        self.grad_sum.resize(total, 0.0);
        self.observations.resize(total, 0);
        self.max_screen_radius.resize(total, 0.0);

        let mask = plan.extended_keep_mask();
        retain_vec(&mut self.grad_sum, &mask);
        retain_vec(&mut self.observations, &mask);
        retain_vec(&mut self.max_screen_radius, &mask);
        Ok(())
    }

    fn apply_permutation(&mut self, permutation: &[usize]) {
        permute_vec(&mut self.grad_sum, permutation);
        permute_vec(&mut self.observations, permutation);
        permute_vec(&mut self.max_screen_radius, permutation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_is_weighted_by_visibility() {
        let mut stats = GradientAccumulator::new(2);
        stats.observe(0, 0.2).unwrap();
        stats.observe(0, 0.4).unwrap();
        stats.observe(1, 0.1).unwrap();
        assert!((stats.mean_since_reset(0) - 0.3).abs() < 1e-6);
        assert!((stats.mean_since_reset(1) - 0.1).abs() < 1e-6);
        assert_eq!(stats.observations(0), 2);
    }

    #[test]
    fn test_unobserved_mean_is_zero() {
        let stats = GradientAccumulator::new(3);
        assert_eq!(stats.mean_since_reset(2), 0.0);
        assert_eq!(stats.mean_since_reset(99), 0.0);
        assert!(!stats.has_evidence());
    }

    #[test]
    fn test_observe_out_of_range() {
        let mut stats = GradientAccumulator::new(1);
        assert!(matches!(
            stats.observe(1, 0.5),
            Err(EngineError::IndexOutOfBounds { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_observe_frame_is_all_or_nothing() {
        let mut stats = GradientAccumulator::new(2);
        let frame = FrameFeedback {
            visible: vec![0, 5],
            grad_norms: vec![1.0, 1.0],
            screen_radii: vec![3.0, 3.0],
        };
        assert!(stats.observe_frame(&frame).is_err());
        assert!(!stats.has_evidence());
        assert_eq!(stats.views_observed(), 0);
    }

    #[test]
    fn test_observe_frame_tracks_max_radius() {
        let mut stats = GradientAccumulator::new(2);
        for radius in [4.0, 9.0, 2.0] {
            let frame = FrameFeedback {
                visible: vec![1],
                grad_norms: vec![0.1],
                screen_radii: vec![radius],
            };
            stats.observe_frame(&frame).unwrap();
        }
        assert_eq!(stats.max_screen_radius(1), 9.0);
        assert_eq!(stats.max_screen_radius(0), 0.0);
        assert_eq!(stats.views_observed(), 3);
    }

    #[test]
    fn test_non_finite_norms_are_not_evidence() {
        let mut stats = GradientAccumulator::new(3);
        assert!(matches!(
            stats.observe(1, f32::NAN),
            Err(EngineError::NonFiniteFeedback { index: 1, .. })
        ));
        let frame = FrameFeedback {
            visible: vec![0, 2],
            grad_norms: vec![0.5, f32::INFINITY],
            screen_radii: vec![3.0, 3.0],
        };
        assert!(matches!(
            stats.observe_frame(&frame),
            Err(EngineError::NonFiniteFeedback { index: 2, .. })
        ));
        let frame = FrameFeedback {
            visible: vec![0],
            grad_norms: vec![0.5],
            screen_radii: vec![f32::NAN],
        };
        assert!(stats.observe_frame(&frame).is_err());
        assert!(!stats.has_evidence());
        assert_eq!(stats.mean_since_reset(0), 0.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut stats = GradientAccumulator::new(1);
        stats.observe(0, 1.0).unwrap();
        stats.reset();
        assert!(!stats.has_evidence());
        assert_eq!(stats.mean_since_reset(0), 0.0);
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn test_edit_zero_initializes_new_points() {
        let mut stats = GradientAccumulator::new(3);
        stats.observe(2, 0.5).unwrap();
        let appended = crate::store::PointBatch::from_rows(
            0,
            &[crate::store::PointRow::new(glam::Vec3::ZERO, 0.1, 0.5, 0)],
        )
        .unwrap();
        let plan = EditPlan::new(3, &[0], appended).unwrap();
        stats.apply_edit(&plan).unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.observations(1), 1);
        assert_eq!(stats.observations(2), 0);
    }
}
