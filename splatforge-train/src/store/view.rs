//! Read-only attribute view lent to renderers, conditioning modules and viewers.

use crate::store::batch::sigmoid;
use glam::{Quat, Vec3};
use std::borrow::Cow;

/// Borrowed attributes for one render. Conditioning modules may replace
/// positions or SH coefficients with owned, per-view copies.
#[derive(Debug, Clone)]
pub struct SceneView<'a> {
    pub positions: Cow<'a, [f32]>,
    pub log_scales: &'a [f32],
    pub rotations: &'a [f32],
    pub opacity_logits: &'a [f32],
    pub sh: Cow<'a, [f32]>,
    pub sh_stride: usize,
    /// SH bands the renderer should evaluate; higher bands are ignored.
    pub active_sh_degree: u32,
    pub appearance: &'a [Option<u32>],
    pub deformation: &'a [Option<u32>],
}

impl SceneView<'_> {
    pub fn len(&self) -> usize {
        self.opacity_logits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opacity_logits.is_empty()
    }

    pub fn position(&self, index: usize) -> Vec3 {
        Vec3::from_slice(&self.positions[index * 3..index * 3 + 3])
    }

    pub fn scale(&self, index: usize) -> Vec3 {
        Vec3::from_slice(&self.log_scales[index * 3..index * 3 + 3]).exp()
    }

    pub fn rotation(&self, index: usize) -> Quat {
        Quat::from_slice(&self.rotations[index * 4..index * 4 + 4]).normalize()
    }

    pub fn opacity(&self, index: usize) -> f32 {
        sigmoid(self.opacity_logits[index])
    }

    pub fn sh(&self, index: usize) -> &[f32] {
        &self.sh[index * self.sh_stride..(index + 1) * self.sh_stride]
    }

    /// Mutable positions, copied on first write.
    pub fn positions_mut(&mut self) -> &mut [f32] {
        self.positions.to_mut()
    }

    /// Mutable SH coefficients, copied on first write.
    pub fn sh_mut(&mut self) -> &mut [f32] {
        self.sh.to_mut()
    }

    pub fn is_conditioned(&self) -> bool {
        matches!(self.positions, Cow::Owned(_)) || matches!(self.sh, Cow::Owned(_))
    }
}
