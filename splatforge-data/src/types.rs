//! Core data types for seed points and exported splats.
//!
//! These are CPU-side representations. The training engine keeps its own
//! structure-of-arrays storage and converts to [`SplatRecord`] rows only
//! when handing data to a viewer or renderer.

use glam::Vec3;

/// Zeroth-order spherical harmonics basis constant, `1 / (2 * sqrt(pi))`.
pub const SH_C0: f32 = 0.282_094_8;

/// Convert a linear RGB color to the DC spherical-harmonics coefficient.
pub fn rgb_to_sh_dc(rgb: Vec3) -> Vec3 {
    (rgb - Vec3::splat(0.5)) / SH_C0
}

/// Convert a DC spherical-harmonics coefficient back to linear RGB.
pub fn sh_dc_to_rgb(dc: Vec3) -> Vec3 {
    (dc * SH_C0 + Vec3::splat(0.5)).clamp(Vec3::ZERO, Vec3::ONE)
}

/// A colored point from a sparse reconstruction, used to seed Gaussians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedPoint {
    /// Position in world space.
    pub position: Vec3,
    /// RGB color (linear, 0-1 range).
    pub color: Vec3,
}

impl SeedPoint {
    pub fn new(position: Vec3, color: Vec3) -> Self {
        Self { position, color }
    }

    /// A mid-gray point, used when the source carries no color.
    pub fn gray(position: Vec3) -> Self {
        Self {
            position,
            color: Vec3::splat(0.5),
        }
    }
}

impl Default for SeedPoint {
    fn default() -> Self {
        Self::gray(Vec3::ZERO)
    }
}

/// Packed splat row handed to renderers and viewers.
///
/// Activated values: `scale` is linear (not log), `color_opacity.w` is the
/// sigmoid-activated opacity and `rotation` is a unit quaternion (x, y, z, w).
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, Debug, PartialEq)]
pub struct SplatRecord {
    pub position: [f32; 3],
    pub _pad0: f32,
    /// rgb color (linear 0-1, from the DC term) and opacity in w.
    pub color_opacity: [f32; 4],
    pub rotation: [f32; 4],
    /// xyz scale, w unused.
    pub scale: [f32; 4],
}

impl SplatRecord {
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn opacity(&self) -> f32 {
        self.color_opacity[3]
    }

    pub fn max_scale(&self) -> f32 {
        self.scale[0].max(self.scale[1]).max(self.scale[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_dc_round_trip() {
        let rgb = Vec3::new(0.2, 0.5, 0.9);
        let back = sh_dc_to_rgb(rgb_to_sh_dc(rgb));
        assert!((back - rgb).length() < 1e-5);
    }

    #[test]
    fn test_mid_gray_has_zero_dc() {
        assert_eq!(rgb_to_sh_dc(Vec3::splat(0.5)), Vec3::ZERO);
    }

    #[test]
    fn test_splat_record_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<SplatRecord>(), 16 * 4);
        let record = SplatRecord {
            position: [1.0, 2.0, 3.0],
            _pad0: 0.0,
            color_opacity: [0.1, 0.2, 0.3, 0.4],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [0.5, 2.0, 1.0, 0.0],
        };
        let bytes: &[u8] = bytemuck::bytes_of(&record);
        assert_eq!(bytes.len(), 64);
        assert_eq!(record.max_scale(), 2.0);
        assert_eq!(record.opacity(), 0.4);
    }
}
