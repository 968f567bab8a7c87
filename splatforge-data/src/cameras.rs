//! Camera metadata written next to a training run (`cameras.json`).
//!
//! The engine never parses datasets; this file is the small, format-stable
//! summary of the training cameras that viewers use to orient the scene and
//! that the driver uses to derive the scene extent.

use crate::error::DataError;
use glam::{Mat3, Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// One entry of `cameras.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: u32,
    pub img_name: String,
    pub width: u32,
    pub height: u32,
    /// Camera centre in world space.
    pub position: [f32; 3],
    /// Camera-to-world rotation, row-major.
    pub rotation: [[f32; 3]; 3],
    pub fx: f32,
    pub fy: f32,
}

impl CameraRecord {
    pub fn center(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    /// Camera-to-world rotation as a column-major glam matrix.
    pub fn rotation_matrix(&self) -> Mat3 {
        Mat3::from_cols_array_2d(&self.rotation).transpose()
    }
}

/// Read `cameras.json`.
pub fn load_cameras(path: impl AsRef<Path>) -> Result<Vec<CameraRecord>, DataError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let cameras: Vec<CameraRecord> = serde_json::from_reader(reader)?;
    debug!("Loaded {} cameras from {}", cameras.len(), path.display());
    Ok(cameras)
}

/// Average world-space up direction of the cameras.
///
/// Cameras follow the y-down convention, so up is the negated mean of the
/// rotation matrices' second column.
pub fn up_vector(cameras: &[CameraRecord]) -> Option<Vec3> {
    if cameras.is_empty() {
        return None;
    }
    let sum: Vec3 = cameras.iter().map(|c| c.rotation_matrix().y_axis).sum();
    let up = -sum;
    (up.length_squared() > f32::EPSILON).then(|| up.normalize())
}

/// Transform that maps the cameras' average up direction onto +Z.
pub fn reorient_transform(cameras: &[CameraRecord]) -> Result<Mat4, DataError> {
    let up = up_vector(cameras).ok_or_else(|| DataError::NoCameras("camera list".to_string()))?;
    debug!("up vector = {:?}", up);
    Ok(Mat4::from_quat(Quat::from_rotation_arc(up, Vec3::Z)))
}

/// Radius of the camera rig: 1.1 times the largest distance from the mean
/// camera centre.
pub fn camera_extent(centers: &[Vec3]) -> f32 {
    if centers.is_empty() {
        return 0.0;
    }
    let mean = centers.iter().copied().sum::<Vec3>() / centers.len() as f32;
    let radius = centers
        .iter()
        .map(|c| c.distance(mean))
        .fold(0.0f32, f32::max);
    radius * 1.1
}
