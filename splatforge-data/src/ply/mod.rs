//! Seed point loading from PLY files

mod loader;

pub use loader::{load_seed_points, ply_vertex_count};
