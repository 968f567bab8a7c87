//! Structural edits over index-aligned arrays.
//!
//! Every array keyed by point index (attributes, optimizer moments, gradient
//! statistics) implements [`IndexAligned`]. An [`EditPlan`] is validated once
//! and then applied to all of them, so no array can be left half-remapped.

use crate::error::EngineError;
use crate::store::batch::PointBatch;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A validated structural edit: remove some rows, append new ones.
///
/// Appended rows are placed after the surviving rows; survivors keep their
/// relative order.
#[derive(Debug, Clone)]
pub struct EditPlan {
    keep: Vec<bool>,
    removed: usize,
    appended: PointBatch,
}

impl EditPlan {
    /// Build a plan for a store of `len` rows. Duplicate removal indices are
    /// tolerated; out-of-range indices are not.
    pub fn new(len: usize, removed: &[usize], appended: PointBatch) -> Result<Self, EngineError> {
        let mut keep = vec![true; len];
        let mut count = 0;
        for &index in removed {
            let slot = keep
                .get_mut(index)
                .ok_or(EngineError::IndexOutOfBounds { index, len })?;
            if *slot {
                *slot = false;
                count += 1;
            }
        }
        appended.validate()?;
        Ok(Self {
            keep,
            removed: count,
            appended,
        })
    }

    pub fn removal_only(len: usize, removed: &[usize], max_sh_degree: u32) -> Result<Self, EngineError> {
        Self::new(len, removed, PointBatch::new(max_sh_degree))
    }

    /// Row count the plan expects before it is applied.
    pub fn source_len(&self) -> usize {
        self.keep.len()
    }

    pub fn removed(&self) -> usize {
        self.removed
    }

    pub fn appended(&self) -> &PointBatch {
        &self.appended
    }

    pub fn appended_len(&self) -> usize {
        self.appended.len()
    }

    pub fn result_len(&self) -> usize {
        self.keep.len() - self.removed + self.appended.len()
    }

    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.appended.is_empty()
    }

    /// Keep mask over the old rows followed by `true` for every appended row.
    pub fn extended_keep_mask(&self) -> Vec<bool> {
        let mut mask = Vec::with_capacity(self.keep.len() + self.appended.len());
        mask.extend_from_slice(&self.keep);
        mask.resize(self.keep.len() + self.appended.len(), true);
        mask
    }

    pub fn remap(&self) -> IndexRemap {
        let mut next = 0u32;
        let old_to_new = self
            .keep
            .iter()
            .map(|&kept| {
                kept.then(|| {
                    let index = next;
                    next += 1;
                    index
                })
            })
            .collect();
        let survivors = next as usize;
        IndexRemap {
            old_to_new,
            appended: survivors..survivors + self.appended.len(),
        }
    }
}

/// Old-index to new-index mapping produced by a structural edit, for any
/// external holder of point indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRemap {
    old_to_new: Vec<Option<u32>>,
    appended: Range<usize>,
}

impl IndexRemap {
    pub fn identity(len: usize) -> Self {
        Self {
            old_to_new: (0..len as u32).map(Some).collect(),
            appended: len..len,
        }
    }

    /// New index of an old row, or `None` if it was removed.
    pub fn new_index(&self, old: usize) -> Option<usize> {
        self.old_to_new.get(old).copied().flatten().map(|i| i as usize)
    }

    pub fn old_len(&self) -> usize {
        self.old_to_new.len()
    }

    pub fn removed(&self) -> usize {
        self.old_to_new.iter().filter(|slot| slot.is_none()).count()
    }

    /// Indices of rows that did not exist before the edit.
    pub fn appended(&self) -> Range<usize> {
        self.appended.clone()
    }

    pub fn new_len(&self) -> usize {
        self.appended.end
    }
}

/// An array keyed by point index that must follow every structural edit.
pub trait IndexAligned {
    fn aligned_len(&self) -> usize;

    /// Apply an already validated plan. New rows are zero-initialized unless
    /// the implementor stores point attributes.
    fn apply_edit(&mut self, plan: &EditPlan) -> Result<(), EngineError>;

    /// Apply a validated permutation (`new[i] = old[permutation[i]]`).
    fn apply_permutation(&mut self, permutation: &[usize]);
}

/// Check that `permutation` is a bijection of `0..len`.
pub fn validate_permutation(permutation: &[usize], len: usize) -> Result<(), EngineError> {
    if permutation.len() != len {
        return Err(EngineError::InvalidPermutation {
            len,
            reason: format!("has {} entries", permutation.len()),
        });
    }
    let mut seen = vec![false; len];
    for &index in permutation {
        match seen.get_mut(index) {
            None => {
                return Err(EngineError::InvalidPermutation {
                    len,
                    reason: format!("index {} out of range", index),
                });
            }
            Some(true) => {
                return Err(EngineError::InvalidPermutation {
                    len,
                    reason: format!("index {} repeated", index),
                });
            }
            Some(slot) => *slot = true,
        }
    }
    Ok(())
}

/// Permute a plain per-point vector.
pub(crate) fn permute_vec<T: Clone>(values: &mut Vec<T>, permutation: &[usize]) {
    let permuted: Vec<T> = permutation.iter().map(|&i| values[i].clone()).collect();
    *values = permuted;
}

/// Keep entries of a plain per-point vector by mask, stable.
pub(crate) fn retain_vec<T>(values: &mut Vec<T>, keep: &[bool]) {
    let mut mask = keep.iter();
    values.retain(|_| mask.next().copied().unwrap_or(true));
}
