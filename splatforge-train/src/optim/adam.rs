//! Adam moments, index-aligned with the point store.

use crate::config::AdamConfig;
use crate::error::EngineError;
use crate::optim::gradients::PointGradients;
use crate::optim::schedule::AttributeRates;
use crate::store::{Attribute, ColumnSet, EditPlan, IndexAligned};
use serde::{Deserialize, Serialize};

/// First and second Adam moments for every trainable scalar.
///
/// Rows created by densification start with zero moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    first: ColumnSet,
    second: ColumnSet,
    /// Completed optimizer steps, used for bias correction.
    steps: u64,
}

impl OptimizerState {
    pub fn new(sh_stride: usize, points: usize) -> Self {
        Self {
            first: ColumnSet::zeros(sh_stride, points),
            second: ColumnSet::zeros(sh_stride, points),
            steps: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.first.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sh_stride(&self) -> usize {
        self.first.sh_stride()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn first_moment(&self, attribute: Attribute) -> &[f32] {
        self.first[attribute].as_slice()
    }

    pub fn second_moment(&self, attribute: Attribute) -> &[f32] {
        self.second[attribute].as_slice()
    }

    /// Reserve moment rows alongside the store.
    pub fn reserve(&mut self, points: usize) {
        self.first.reserve_rows(points);
        self.second.reserve_rows(points);
    }

    /// One Adam update of `params` in place.
    pub fn step(
        &mut self,
        params: &mut ColumnSet,
        gradients: &PointGradients,
        rates: &AttributeRates,
        adam: &AdamConfig,
    ) -> Result<(), EngineError> {
        let rows = params.validate()?;
        gradients.check_shape(params.sh_stride(), rows)?;
        if self.len() != rows {
            return Err(EngineError::shape("optimizer moments", rows, self.len()));
        }
        if self.sh_stride() != params.sh_stride() {
            return Err(EngineError::shape("optimizer sh stride", params.sh_stride(), self.sh_stride()));
        }

        self.steps += 1;
        // Saturates long after bias correction reaches 1.
        let t = self.steps.min(i32::MAX as u64) as i32;
        let bias1 = 1.0 - adam.beta1.powi(t);
        let bias2 = 1.0 - adam.beta2.powi(t);

        for attribute in Attribute::ALL {
            let stride = params[attribute].stride();
            let param = params[attribute].as_mut_slice();
            let grad = gradients.column(attribute).as_slice();
            let m = self.first[attribute].as_mut_slice();
            let v = self.second[attribute].as_mut_slice();
            for i in 0..param.len() {
                let g = grad[i];
                m[i] = adam.beta1 * m[i] + (1.0 - adam.beta1) * g;
                v[i] = adam.beta2 * v[i] + (1.0 - adam.beta2) * g * g;
                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                let lr = rates.for_element(attribute, i % stride);
                param[i] -= lr * m_hat / (v_hat.sqrt() + adam.epsilon);
            }
        }
        Ok(())
    }

    /// Zero both moments of one attribute group.
    pub fn reset_group(&mut self, attribute: Attribute) {
        self.first[attribute].fill(0.0);
        self.second[attribute].fill(0.0);
    }

    pub fn validate(&self) -> Result<usize, EngineError> {
        let rows = self.first.validate()?;
        let second = self.second.validate()?;
        if rows != second {
            return Err(EngineError::shape("second moment rows", rows, second));
        }
        if self.first.sh_stride() != self.second.sh_stride() {
            return Err(EngineError::shape(
                "second moment sh stride",
                self.first.sh_stride(),
                self.second.sh_stride(),
            ));
        }
        Ok(rows)
    }
}

impl IndexAligned for OptimizerState {
    fn aligned_len(&self) -> usize {
        self.len()
    }

    fn apply_edit(&mut self, plan: &EditPlan) -> Result<(), EngineError> {
        if plan.source_len() != self.len() {
            return Err(EngineError::shape("optimizer moments", plan.source_len(), self.len()));
        }
        let mask = plan.extended_keep_mask();
        for moments in [&mut self.first, &mut self.second] {
            moments.push_zero_rows(plan.appended_len());
            moments.retain_rows(&mask);
        }
        Ok(())
    }

    fn apply_permutation(&mut self, permutation: &[usize]) {
        self.first.permute(permutation);
        self.second.permute(permutation);
    }
}
