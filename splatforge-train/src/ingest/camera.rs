//! Posed training views

use glam::{Mat4, Quat, Vec3};
use image::Rgb32FImage;
use splatforge_data::CameraRecord;

/// One posed image the driver renders against.
#[derive(Debug, Clone)]
pub struct TrainingView {
    /// Ground-truth image, linear RGB in 0-1
    pub image: Rgb32FImage,
    /// Camera centre in world space
    pub position: Vec3,
    /// Camera-to-world rotation
    pub rotation: Quat,
    pub fx: f32,
    pub fy: f32,
    /// Handle into an external per-image appearance table
    pub appearance_id: Option<u32>,
    /// Optional inverse-depth (disparity) map, row-major, same resolution as `image`
    pub inverse_depth: Option<Vec<f32>>,
}

impl TrainingView {
    pub fn new(image: Rgb32FImage, position: Vec3, rotation: Quat, fx: f32, fy: f32) -> Self {
        Self {
            image,
            position,
            rotation,
            fx,
            fy,
            appearance_id: None,
            inverse_depth: None,
        }
    }

    pub fn with_inverse_depth(mut self, inverse_depth: Vec<f32>) -> Self {
        self.inverse_depth = Some(inverse_depth);
        self
    }

    pub fn with_appearance(mut self, appearance_id: u32) -> Self {
        self.appearance_id = Some(appearance_id);
        self
    }

    /// Image dimensions (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn camera_to_world(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    pub fn world_to_camera(&self) -> Mat4 {
        self.camera_to_world().inverse()
    }

    /// Summary written to `cameras.json` for viewers.
    pub fn to_record(&self, id: u32, img_name: impl Into<String>) -> CameraRecord {
        let m = glam::Mat3::from_quat(self.rotation);
        let (width, height) = self.dimensions();
        CameraRecord {
            id,
            img_name: img_name.into(),
            width,
            height,
            position: self.position.to_array(),
            rotation: [
                m.row(0).to_array(),
                m.row(1).to_array(),
                m.row(2).to_array(),
            ],
            fx: self.fx,
            fy: self.fy,
        }
    }
}
