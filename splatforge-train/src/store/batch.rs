//! Row and batch views of Gaussian points.

use crate::error::EngineError;
use crate::store::column::{Attribute, ColumnSet, sh_stride_for_degree};
use glam::{Quat, Vec3};

/// `ln(p / (1 - p))`, clamped away from 0 and 1.
pub fn inverse_sigmoid(p: f32) -> f32 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One Gaussian, owned. Attributes are stored raw (log scale, opacity logit).
#[derive(Debug, Clone, PartialEq)]
pub struct PointRow {
    pub position: Vec3,
    pub log_scale: Vec3,
    pub rotation: Quat,
    pub opacity_logit: f32,
    pub sh: Vec<f32>,
    pub appearance: Option<u32>,
    pub deformation: Option<u32>,
}

impl PointRow {
    /// Isotropic point with zero SH, identity rotation and the given opacity.
    pub fn new(position: Vec3, scale: f32, opacity: f32, max_sh_degree: u32) -> Self {
        Self {
            position,
            log_scale: Vec3::splat(scale.max(f32::MIN_POSITIVE).ln()),
            rotation: Quat::IDENTITY,
            opacity_logit: inverse_sigmoid(opacity),
            sh: vec![0.0; sh_stride_for_degree(max_sh_degree)],
            appearance: None,
            deformation: None,
        }
    }

    pub fn with_log_scale(mut self, log_scale: Vec3) -> Self {
        self.log_scale = log_scale;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_sh_dc(mut self, dc: Vec3) -> Self {
        self.sh[..3].copy_from_slice(&dc.to_array());
        self
    }

    pub fn with_appearance(mut self, handle: u32) -> Self {
        self.appearance = Some(handle);
        self
    }

    pub fn with_deformation(mut self, handle: u32) -> Self {
        self.deformation = Some(handle);
        self
    }

    pub fn scale(&self) -> Vec3 {
        self.log_scale.exp()
    }

    pub fn opacity(&self) -> f32 {
        sigmoid(self.opacity_logit)
    }
}

/// Points to append, laid out like the store (structure of arrays).
#[derive(Debug, Clone, PartialEq)]
pub struct PointBatch {
    pub columns: ColumnSet,
    pub appearance: Vec<Option<u32>>,
    pub deformation: Vec<Option<u32>>,
}

impl PointBatch {
    pub fn new(max_sh_degree: u32) -> Self {
        Self::with_capacity(max_sh_degree, 0)
    }

    pub fn with_capacity(max_sh_degree: u32, rows: usize) -> Self {
        Self {
            columns: ColumnSet::with_capacity(sh_stride_for_degree(max_sh_degree), rows),
            appearance: Vec::with_capacity(rows),
            deformation: Vec::with_capacity(rows),
        }
    }

    pub fn from_rows(max_sh_degree: u32, rows: &[PointRow]) -> Result<Self, EngineError> {
        let mut batch = Self::with_capacity(max_sh_degree, rows.len());
        for row in rows {
            batch.push(row)?;
        }
        Ok(batch)
    }

    pub fn sh_stride(&self) -> usize {
        self.columns.sh_stride()
    }

    pub fn len(&self) -> usize {
        self.columns.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, row: &PointRow) -> Result<(), EngineError> {
        if row.sh.len() != self.sh_stride() {
            return Err(EngineError::shape("sh coefficients", self.sh_stride(), row.sh.len()));
        }
        self.columns[Attribute::Position].push_row(&row.position.to_array());
        self.columns[Attribute::LogScale].push_row(&row.log_scale.to_array());
        self.columns[Attribute::Rotation].push_row(&row.rotation.to_array());
        self.columns[Attribute::Opacity].push_row(&[row.opacity_logit]);
        self.columns[Attribute::Sh].push_row(&row.sh);
        self.appearance.push(row.appearance);
        self.deformation.push(row.deformation);
        Ok(())
    }

    /// All attribute columns and handle columns must agree in cardinality.
    pub fn validate(&self) -> Result<usize, EngineError> {
        let rows = self.columns.validate()?;
        if self.appearance.len() != rows {
            return Err(EngineError::shape("appearance handles", rows, self.appearance.len()));
        }
        if self.deformation.len() != rows {
            return Err(EngineError::shape("deformation handles", rows, self.deformation.len()));
        }
        Ok(rows)
    }
}
