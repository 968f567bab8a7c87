//! Splatforge Data Crate
//!
//! CPU-side data shared by the training engine and external viewers:
//! seed point clouds loaded from PLY, camera metadata from `cameras.json`,
//! and the packed [`SplatRecord`] row exported for rendering.
//! This crate is renderer-agnostic and performs no optimization itself.

pub mod cameras;
pub mod error;
pub mod ply;
pub mod types;

pub use cameras::{CameraRecord, camera_extent, load_cameras, reorient_transform, up_vector};
pub use error::DataError;
pub use ply::{load_seed_points, ply_vertex_count};
pub use types::{SH_C0, SeedPoint, SplatRecord, rgb_to_sh_dc, sh_dc_to_rgb};
