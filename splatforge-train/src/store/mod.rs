//! Gaussian point store.
//!
//! Structure-of-arrays arena: one strided column per trainable attribute plus
//! the conditioning handles. Buffers are reserved up front (typically to the
//! growth ceiling) and compacted in place on removal, so structural edits do
//! not reallocate in the common case.

pub mod batch;
pub mod column;
pub mod edit;
pub mod view;

pub use batch::{PointBatch, PointRow, inverse_sigmoid, sigmoid};
pub use column::{Attribute, Column, ColumnSet, sh_stride_for_degree};
pub use edit::{EditPlan, IndexAligned, IndexRemap, validate_permutation};
pub use view::SceneView;

use crate::error::EngineError;
use edit::{permute_vec, retain_vec};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use splatforge_data::{SplatRecord, sh_dc_to_rgb};
use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::ops::Range;
use tracing::debug;

/// Serializable copy of a [`PointStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub max_sh_degree: u32,
    pub columns: ColumnSet,
    pub appearance: Vec<Option<u32>>,
    pub deformation: Vec<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointStore {
    max_sh_degree: u32,
    columns: ColumnSet,
    appearance: Vec<Option<u32>>,
    deformation: Vec<Option<u32>>,
}

impl PointStore {
    pub fn new(max_sh_degree: u32) -> Self {
        Self::with_capacity(max_sh_degree, 0)
    }

    /// Reserve attribute buffers for `capacity` points.
    pub fn with_capacity(max_sh_degree: u32, capacity: usize) -> Self {
        Self {
            max_sh_degree,
            columns: ColumnSet::with_capacity(sh_stride_for_degree(max_sh_degree), capacity),
            appearance: Vec::with_capacity(capacity),
            deformation: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Points that fit without reallocating.
    pub fn capacity(&self) -> usize {
        self.columns[Attribute::Opacity].row_capacity()
    }

    pub fn max_sh_degree(&self) -> u32 {
        self.max_sh_degree
    }

    pub fn sh_stride(&self) -> usize {
        self.columns.sh_stride()
    }

    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    pub(crate) fn columns_mut(&mut self) -> &mut ColumnSet {
        &mut self.columns
    }

    pub fn column(&self, attribute: Attribute) -> &Column {
        &self.columns[attribute]
    }

    pub fn appearance_handles(&self) -> &[Option<u32>] {
        &self.appearance
    }

    pub fn deformation_handles(&self) -> &[Option<u32>] {
        &self.deformation
    }

    /// Append points; returns the index range they occupy.
    pub fn append(&mut self, batch: PointBatch) -> Result<Range<usize>, EngineError> {
        let rows = batch.validate()?;
        if batch.sh_stride() != self.sh_stride() {
            return Err(EngineError::shape("sh stride", self.sh_stride(), batch.sh_stride()));
        }
        let start = self.len();
        self.columns.extend_from(&batch.columns)?;
        self.appearance.extend_from_slice(&batch.appearance);
        self.deformation.extend_from_slice(&batch.deformation);
        debug!("Appended {} points ({} total)", rows, self.len());
        Ok(start..start + rows)
    }

    /// Remove points and compact; survivors keep their relative order.
    ///
    /// This edits the store alone. Use `TrainingEngine::apply_edit` to keep
    /// optimizer state and gradient statistics aligned.
    pub fn remove(&mut self, indices: &[usize]) -> Result<IndexRemap, EngineError> {
        let plan = EditPlan::removal_only(self.len(), indices, self.max_sh_degree)?;
        let remap = plan.remap();
        self.apply_edit(&plan)?;
        Ok(remap)
    }

    /// Reorder points so that `new[i] = old[permutation[i]]`.
    pub fn reorder(&mut self, permutation: &[usize]) -> Result<(), EngineError> {
        validate_permutation(permutation, self.len())?;
        self.apply_permutation(permutation);
        Ok(())
    }

    pub fn position(&self, index: usize) -> Vec3 {
        Vec3::from_slice(self.columns[Attribute::Position].row(index))
    }

    pub fn log_scale(&self, index: usize) -> Vec3 {
        Vec3::from_slice(self.columns[Attribute::LogScale].row(index))
    }

    /// Activated (linear) scale.
    pub fn scale(&self, index: usize) -> Vec3 {
        self.log_scale(index).exp()
    }

    pub fn max_scale(&self, index: usize) -> f32 {
        self.scale(index).max_element()
    }

    pub fn rotation(&self, index: usize) -> Quat {
        Quat::from_slice(self.columns[Attribute::Rotation].row(index)).normalize()
    }

    pub fn opacity_logit(&self, index: usize) -> f32 {
        self.columns[Attribute::Opacity].row(index)[0]
    }

    pub fn opacity(&self, index: usize) -> f32 {
        sigmoid(self.opacity_logit(index))
    }

    pub fn sh(&self, index: usize) -> &[f32] {
        self.columns[Attribute::Sh].row(index)
    }

    pub fn row(&self, index: usize) -> Result<PointRow, EngineError> {
        if index >= self.len() {
            return Err(EngineError::IndexOutOfBounds {
                index,
                len: self.len(),
            });
        }
        Ok(PointRow {
            position: self.position(index),
            log_scale: self.log_scale(index),
            rotation: Quat::from_slice(self.columns[Attribute::Rotation].row(index)),
            opacity_logit: self.opacity_logit(index),
            sh: self.sh(index).to_vec(),
            appearance: self.appearance[index],
            deformation: self.deformation[index],
        })
    }

    pub(crate) fn set_opacity_logit(&mut self, index: usize, logit: f32) {
        self.columns[Attribute::Opacity].row_mut(index)[0] = logit;
    }

    /// Borrow the attributes for rendering.
    pub fn view(&self, active_sh_degree: u32) -> SceneView<'_> {
        SceneView {
            positions: Cow::Borrowed(self.columns[Attribute::Position].as_slice()),
            log_scales: self.columns[Attribute::LogScale].as_slice(),
            rotations: self.columns[Attribute::Rotation].as_slice(),
            opacity_logits: self.columns[Attribute::Opacity].as_slice(),
            sh: Cow::Borrowed(self.columns[Attribute::Sh].as_slice()),
            sh_stride: self.sh_stride(),
            active_sh_degree: active_sh_degree.min(self.max_sh_degree),
            appearance: &self.appearance,
            deformation: &self.deformation,
        }
    }

    /// Packed rows for viewers; `scaling_modifier` multiplies every scale.
    pub fn records(&self, scaling_modifier: f32) -> Vec<SplatRecord> {
        (0..self.len())
            .map(|i| {
                let color = sh_dc_to_rgb(Vec3::from_slice(&self.sh(i)[..3]));
                let scale = self.scale(i) * scaling_modifier;
                SplatRecord {
                    position: self.position(i).to_array(),
                    _pad0: 0.0,
                    color_opacity: [color.x, color.y, color.z, self.opacity(i)],
                    rotation: self.rotation(i).to_array(),
                    scale: [scale.x, scale.y, scale.z, 0.0],
                }
            })
            .collect()
    }

    /// Hash of every attribute byte and handle; equal stores hash equally.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write_u32(self.max_sh_degree);
        hasher.write_usize(self.len());
        for (_, column) in self.columns.iter() {
            hasher.write(column.bytes());
        }
        for handle in self.appearance.iter().chain(&self.deformation) {
            hasher.write_u32(handle.map_or(u32::MAX, |h| h));
        }
        hasher.finish()
    }

    /// Z-order permutation of the points, for spatial locality.
    pub fn morton_order(&self) -> Vec<usize> {
        if self.is_empty() {
            return Vec::new();
        }
        let (min, max) = (0..self.len()).map(|i| self.position(i)).fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(lo, hi), p| (lo.min(p), hi.max(p)),
        );
        let extent = (max - min).max(Vec3::splat(f32::EPSILON));

        fn spread(mut v: u32) -> u32 {
            v &= 0x3ff;
            v = (v | (v << 16)) & 0x0300_00ff;
            v = (v | (v << 8)) & 0x0300_f00f;
            v = (v | (v << 4)) & 0x030c_30c3;
            v = (v | (v << 2)) & 0x0924_9249;
            v
        }

        let mut keyed: Vec<(u32, usize)> = (0..self.len())
            .map(|i| {
                let q = ((self.position(i) - min) / extent * 1023.0).round();
                let key = spread(q.x as u32) | (spread(q.y as u32) << 1) | (spread(q.z as u32) << 2);
                (key, i)
            })
            .collect();
        keyed.sort_by_key(|&(key, i)| (key, i));
        keyed.into_iter().map(|(_, i)| i).collect()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            max_sh_degree: self.max_sh_degree,
            columns: self.columns.clone(),
            appearance: self.appearance.clone(),
            deformation: self.deformation.clone(),
        }
    }

    pub fn restore(snapshot: StoreSnapshot) -> Result<Self, EngineError> {
        let expected = sh_stride_for_degree(snapshot.max_sh_degree);
        if snapshot.columns.sh_stride() != expected {
            return Err(EngineError::shape("sh stride", expected, snapshot.columns.sh_stride()));
        }
        let store = Self {
            max_sh_degree: snapshot.max_sh_degree,
            columns: snapshot.columns,
            appearance: snapshot.appearance,
            deformation: snapshot.deformation,
        };
        store.validate()?;
        Ok(store)
    }

    /// Check that every column and handle array has the same length.
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

impl IndexAligned for PointStore {
    fn aligned_len(&self) -> usize {
        self.len()
    }

    fn apply_edit(&mut self, plan: &EditPlan) -> Result<(), EngineError> {
        if plan.source_len() != self.len() {
            return Err(EngineError::shape("point store", plan.source_len(), self.len()));
        }
        if plan.appended().sh_stride() != self.sh_stride() {
            return Err(EngineError::shape(
                "sh stride",
                self.sh_stride(),
                plan.appended().sh_stride(),
            ));
        }
        let appended = plan.appended();
        self.columns.extend_from(&appended.columns)?;
        self.appearance.extend_from_slice(&appended.appearance);
        self.deformation.extend_from_slice(&appended.deformation);

        let mask = plan.extended_keep_mask();
        self.columns.retain_rows(&mask);
        retain_vec(&mut self.appearance, &mask);
        retain_vec(&mut self.deformation, &mask);
        Ok(())
    }

    fn apply_permutation(&mut self, permutation: &[usize]) {
        self.columns.permute(permutation);
        permute_vec(&mut self.appearance, permutation);
        permute_vec(&mut self.deformation, permutation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(points: &[(Vec3, f32)]) -> PointStore {
        let rows: Vec<PointRow> = points
            .iter()
            .enumerate()
            .map(|(i, &(p, opacity))| PointRow::new(p, 0.01, opacity, 1).with_appearance(i as u32))
            .collect();
        let mut store = PointStore::with_capacity(1, 16);
        store.append(PointBatch::from_rows(1, &rows).unwrap()).unwrap();
        store
    }

    #[test]
    fn test_append_returns_range() {
        let mut store = store_with(&[(Vec3::ZERO, 0.5)]);
        let batch = PointBatch::from_rows(1, &[PointRow::new(Vec3::X, 0.01, 0.5, 1)]).unwrap();
        assert_eq!(store.append(batch).unwrap(), 1..2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.position(1), Vec3::X);
    }

    #[test]
    fn test_append_rejects_mismatched_batch() {
        let mut store = store_with(&[(Vec3::ZERO, 0.5)]);
        let mut batch = PointBatch::from_rows(1, &[PointRow::new(Vec3::X, 0.01, 0.5, 1)]).unwrap();
        batch.columns[Attribute::Opacity].push_zero_rows(1);
        assert!(matches!(store.append(batch), Err(EngineError::ShapeMismatch { .. })));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_rejects_other_sh_degree() {
        let mut store = store_with(&[(Vec3::ZERO, 0.5)]);
        let batch = PointBatch::from_rows(0, &[PointRow::new(Vec3::X, 0.01, 0.5, 0)]).unwrap();
        assert!(matches!(store.append(batch), Err(EngineError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_remove_compacts_and_remaps() {
        let mut store = store_with(&[
            (Vec3::new(0.0, 0.0, 0.0), 0.5),
            (Vec3::new(1.0, 0.0, 0.0), 0.5),
            (Vec3::new(2.0, 0.0, 0.0), 0.5),
        ]);
        let remap = store.remove(&[1]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.position(1), Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(store.appearance_handles(), &[Some(0), Some(2)]);
        assert_eq!(remap.new_index(2), Some(1));
        assert_eq!(remap.new_index(1), None);
    }

    #[test]
    fn test_remove_out_of_range_leaves_store_untouched() {
        let mut store = store_with(&[(Vec3::ZERO, 0.5), (Vec3::X, 0.5)]);
        let before = store.fingerprint();
        assert!(matches!(
            store.remove(&[0, 7]),
            Err(EngineError::IndexOutOfBounds { index: 7, len: 2 })
        ));
        assert_eq!(store.fingerprint(), before);
    }

    #[test]
    fn test_reorder_moves_all_columns() {
        let mut store = store_with(&[(Vec3::ZERO, 0.2), (Vec3::X, 0.8)]);
        store.reorder(&[1, 0]).unwrap();
        assert_eq!(store.position(0), Vec3::X);
        assert!((store.opacity(0) - 0.8).abs() < 1e-5);
        assert_eq!(store.appearance_handles(), &[Some(1), Some(0)]);
        assert!(store.reorder(&[0, 0]).is_err());
    }

    #[test]
    fn test_morton_order_is_a_permutation() {
        let store = store_with(&[
            (Vec3::new(1.0, 1.0, 1.0), 0.5),
            (Vec3::new(0.0, 0.0, 0.0), 0.5),
            (Vec3::new(0.5, 0.5, 0.5), 0.5),
        ]);
        let order = store.morton_order();
        assert!(validate_permutation(&order, 3).is_ok());
        assert_eq!(order[0], 1);
        assert_eq!(order[2], 0);
    }

    #[test]
    fn test_snapshot_restore_is_exact() {
        let store = store_with(&[(Vec3::new(0.1, 0.2, 0.3), 0.3), (Vec3::Y, 0.9)]);
        let json = serde_json::to_string(&store.snapshot()).unwrap();
        let restored = PointStore::restore(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored, store);
        assert_eq!(restored.fingerprint(), store.fingerprint());
    }

    #[test]
    fn test_records_apply_scaling_modifier() {
        let store = store_with(&[(Vec3::ZERO, 0.5)]);
        let records = store.records(0.5);
        assert_eq!(records.len(), 1);
        assert!((records[0].scale[0] - 0.005).abs() < 1e-6);
        assert!((records[0].opacity() - 0.5).abs() < 1e-5);
        assert_eq!(records[0].color_opacity[0], 0.5);
    }

    #[test]
    fn test_capacity_is_reserved() {
        let store = PointStore::with_capacity(0, 128);
        assert!(store.capacity() >= 128);
        assert!(store.is_empty());
    }
}
