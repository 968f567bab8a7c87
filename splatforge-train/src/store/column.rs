//! Flat, strided `f32` columns shared by the store, gradients and Adam moments.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Per-point trainable attribute. Each one owns one strided column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    /// World-space centre (x, y, z).
    Position,
    /// Log-space anisotropic extent (x, y, z).
    LogScale,
    /// Quaternion (x, y, z, w), normalized on read.
    Rotation,
    /// Opacity logit; activated with a sigmoid.
    Opacity,
    /// Spherical-harmonics coefficients, coefficient-major, rgb-minor.
    Sh,
}

impl Attribute {
    pub const ALL: [Attribute; 5] = [
        Attribute::Position,
        Attribute::LogScale,
        Attribute::Rotation,
        Attribute::Opacity,
        Attribute::Sh,
    ];

    pub fn index(self) -> usize {
        match self {
            Attribute::Position => 0,
            Attribute::LogScale => 1,
            Attribute::Rotation => 2,
            Attribute::Opacity => 3,
            Attribute::Sh => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Attribute::Position => "position",
            Attribute::LogScale => "log_scale",
            Attribute::Rotation => "rotation",
            Attribute::Opacity => "opacity",
            Attribute::Sh => "sh",
        }
    }

    /// Scalars per point for this attribute.
    pub fn stride(self, sh_stride: usize) -> usize {
        match self {
            Attribute::Position | Attribute::LogScale => 3,
            Attribute::Rotation => 4,
            Attribute::Opacity => 1,
            Attribute::Sh => sh_stride,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of SH scalars per point for a given degree (`3 * (d + 1)^2`).
pub fn sh_stride_for_degree(degree: u32) -> usize {
    let coefficients = (degree as usize + 1) * (degree as usize + 1);
    coefficients * 3
}

/// A row-major buffer of `stride` scalars per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    stride: usize,
    data: Vec<f32>,
}

impl Column {
    pub fn new(stride: usize) -> Self {
        Self {
            stride,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(stride: usize, rows: usize) -> Self {
        Self {
            stride,
            data: Vec::with_capacity(stride * rows),
        }
    }

    pub fn zeros(stride: usize, rows: usize) -> Self {
        Self {
            stride,
            data: vec![0.0; stride * rows],
        }
    }

    pub fn from_vec(stride: usize, data: Vec<f32>) -> Result<Self, EngineError> {
        if stride == 0 || data.len() % stride != 0 {
            return Err(EngineError::shape(
                "column length",
                data.len().next_multiple_of(stride.max(1)),
                data.len(),
            ));
        }
        Ok(Self { stride, data })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn rows(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.data.len() / self.stride
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row_capacity(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.data.capacity() / self.stride
        }
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.stride..(index + 1) * self.stride]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.data[index * self.stride..(index + 1) * self.stride]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn push_row(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.stride);
        self.data.extend_from_slice(row);
    }

    pub fn push_zero_rows(&mut self, count: usize) {
        self.data.resize(self.data.len() + count * self.stride, 0.0);
    }

    pub fn extend_from(&mut self, other: &Column) {
        debug_assert_eq!(other.stride, self.stride);
        self.data.extend_from_slice(&other.data);
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn reserve_rows(&mut self, rows: usize) {
        self.data.reserve(rows * self.stride);
    }

    /// Keep rows whose mask entry is `true`, preserving their relative order.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.rows());
        let stride = self.stride;
        let mut write = 0;
        for (read, &kept) in keep.iter().enumerate() {
            if !kept {
                continue;
            }
            if write != read {
                self.data
                    .copy_within(read * stride..(read + 1) * stride, write * stride);
            }
            write += 1;
        }
        self.data.truncate(write * stride);
    }

    /// Reorder rows so that `new[i] = old[permutation[i]]`.
    pub fn permute(&mut self, permutation: &[usize]) {
        debug_assert_eq!(permutation.len(), self.rows());
        let mut permuted = Vec::with_capacity(self.data.len());
        for &source in permutation {
            permuted.extend_from_slice(self.row(source));
        }
        self.data = permuted;
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &Column) {
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += *b;
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for value in &mut self.data {
            *value *= factor;
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

/// One column per [`Attribute`], all with the same number of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSet {
    sh_stride: usize,
    columns: [Column; 5],
}

impl ColumnSet {
    pub fn new(sh_stride: usize) -> Self {
        Self::with_capacity(sh_stride, 0)
    }

    pub fn with_capacity(sh_stride: usize, rows: usize) -> Self {
        Self {
            sh_stride,
            columns: Attribute::ALL.map(|a| Column::with_capacity(a.stride(sh_stride), rows)),
        }
    }

    pub fn zeros(sh_stride: usize, rows: usize) -> Self {
        Self {
            sh_stride,
            columns: Attribute::ALL.map(|a| Column::zeros(a.stride(sh_stride), rows)),
        }
    }

    pub fn sh_stride(&self) -> usize {
        self.sh_stride
    }

    /// Row count of the position column.
    pub fn rows(&self) -> usize {
        self.columns[0].rows()
    }

    /// Check strides and row counts; returns the common row count.
    pub fn validate(&self) -> Result<usize, EngineError> {
        let rows = self.rows();
        for attribute in Attribute::ALL {
            let column = &self[attribute];
            let stride = attribute.stride(self.sh_stride);
            if column.stride() != stride {
                return Err(EngineError::shape(
                    format!("{} stride", attribute),
                    stride,
                    column.stride(),
                ));
            }
            if column.as_slice().len() % stride != 0 {
                return Err(EngineError::shape(
                    format!("{} length", attribute),
                    column.rows() * stride,
                    column.as_slice().len(),
                ));
            }
            if column.rows() != rows {
                return Err(EngineError::shape(
                    format!("{} rows", attribute),
                    rows,
                    column.rows(),
                ));
            }
        }
        Ok(rows)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Attribute, &Column)> {
        Attribute::ALL.into_iter().zip(self.columns.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Attribute, &mut Column)> {
        Attribute::ALL.into_iter().zip(self.columns.iter_mut())
    }

    pub fn retain_rows(&mut self, keep: &[bool]) {
        for column in &mut self.columns {
            column.retain_rows(keep);
        }
    }

    pub fn permute(&mut self, permutation: &[usize]) {
        for column in &mut self.columns {
            column.permute(permutation);
        }
    }

    pub fn push_zero_rows(&mut self, count: usize) {
        for column in &mut self.columns {
            column.push_zero_rows(count);
        }
    }

    pub fn reserve_rows(&mut self, rows: usize) {
        for column in &mut self.columns {
            column.reserve_rows(rows);
        }
    }

    pub fn extend_from(&mut self, other: &ColumnSet) -> Result<(), EngineError> {
        if other.sh_stride != self.sh_stride {
            return Err(EngineError::shape("sh stride", self.sh_stride, other.sh_stride));
        }
        for (column, source) in self.columns.iter_mut().zip(&other.columns) {
            column.extend_from(source);
        }
        Ok(())
    }

    pub fn add_assign(&mut self, other: &ColumnSet) -> Result<(), EngineError> {
        let rows = self.validate()?;
        let other_rows = other.validate()?;
        if other.sh_stride != self.sh_stride {
            return Err(EngineError::shape("sh stride", self.sh_stride, other.sh_stride));
        }
        if rows != other_rows {
            return Err(EngineError::shape("gradient rows", rows, other_rows));
        }
        for (column, source) in self.columns.iter_mut().zip(&other.columns) {
            column.add_assign(source);
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        for column in &mut self.columns {
            column.scale(factor);
        }
    }
}

impl Index<Attribute> for ColumnSet {
    type Output = Column;

    fn index(&self, attribute: Attribute) -> &Column {
        &self.columns[attribute.index()]
    }
}

impl IndexMut<Attribute> for ColumnSet {
    fn index_mut(&mut self, attribute: Attribute) -> &mut Column {
        &mut self.columns[attribute.index()]
    }
}
