//! Per-point parameter gradients.

use crate::error::EngineError;
use crate::store::{Attribute, Column, ColumnSet};

/// Gradients with the same layout as the store's attribute columns.
#[derive(Debug, Clone, PartialEq)]
pub struct PointGradients {
    pub columns: ColumnSet,
}

impl PointGradients {
    pub fn zeros(sh_stride: usize, points: usize) -> Self {
        Self {
            columns: ColumnSet::zeros(sh_stride, points),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, attribute: Attribute) -> &Column {
        &self.columns[attribute]
    }

    pub fn column_mut(&mut self, attribute: Attribute) -> &mut Column {
        &mut self.columns[attribute]
    }

    /// Element-wise sum; both sides must have the same shape.
    pub fn accumulate(&mut self, other: &PointGradients) -> Result<(), EngineError> {
        self.columns.add_assign(&other.columns)
    }

    pub fn scale(&mut self, factor: f32) {
        self.columns.scale(factor);
    }

    /// Check the gradient layout against a store of `points` rows.
    pub fn check_shape(&self, sh_stride: usize, points: usize) -> Result<(), EngineError> {
        let rows = self.columns.validate()?;
        if self.columns.sh_stride() != sh_stride {
            return Err(EngineError::shape("gradient sh stride", sh_stride, self.columns.sh_stride()));
        }
        if rows != points {
            return Err(EngineError::shape("gradient rows", points, rows));
        }
        Ok(())
    }
}
