//! PLY seed point loading

use crate::error::DataError;
use crate::types::SeedPoint;
use glam::Vec3;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

// Rows are read as maps so that sparse reconstructions with extra
// properties (normals, errors, track ids) still parse.
#[derive(Deserialize, Debug)]
struct PlyFile {
    #[serde(rename = "vertex")]
    vertex: Vec<HashMap<String, JsonValue>>,
}

fn get_f32(prop: Option<&JsonValue>) -> Option<f32> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n.as_f64().map(|f| f as f32),
        _ => None,
    })
}

fn get_u8(prop: Option<&JsonValue>) -> Option<u8> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n
            .as_u64()
            .map(|u| u.min(255) as u8)
            .or_else(|| n.as_f64().map(|f| f.clamp(0.0, 255.0) as u8)),
        _ => None,
    })
}

fn read_ply(path: &Path) -> Result<PlyFile, DataError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    serde_ply::from_reader(reader).map_err(|e| {
        warn!("Failed to parse PLY file: {}", e);
        DataError::Ply(e.to_string())
    })
}

/// Load seed points (position and color) from a PLY point cloud.
///
/// Colors are read from `red/green/blue` or `r/g/b` (8-bit); points without
/// color become mid-gray so their DC coefficient starts at zero.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_seed_points(path: impl AsRef<Path>) -> Result<Vec<SeedPoint>, DataError> {
    let path = path.as_ref();
    debug!("Loading seed points from: {}", path.display());
    let ply_data = read_ply(path)?;
    info!("PLY file parsed: {} vertices", ply_data.vertex.len());

    let mut points = Vec::with_capacity(ply_data.vertex.len());
    let mut uncolored = 0usize;

    for (index, vertex) in ply_data.vertex.iter().enumerate() {
        let x = get_f32(vertex.get("x")).ok_or(DataError::MissingProperty { property: "x", index })?;
        let y = get_f32(vertex.get("y")).ok_or(DataError::MissingProperty { property: "y", index })?;
        let z = get_f32(vertex.get("z")).ok_or(DataError::MissingProperty { property: "z", index })?;
        let position = Vec3::new(x, y, z);

        let rgb = match (
            get_u8(vertex.get("red")).or_else(|| get_u8(vertex.get("r"))),
            get_u8(vertex.get("green")).or_else(|| get_u8(vertex.get("g"))),
            get_u8(vertex.get("blue")).or_else(|| get_u8(vertex.get("b"))),
        ) {
            (Some(r), Some(g), Some(b)) => Some(Vec3::new(r as f32, g as f32, b as f32) / 255.0),
            _ => None,
        };

        match rgb {
            Some(color) => points.push(SeedPoint::new(position, color)),
            None => {
                uncolored += 1;
                points.push(SeedPoint::gray(position));
            }
        }
    }

    if uncolored > 0 {
        warn!("{} of {} seed points carry no color", uncolored, points.len());
    }
    debug!("Loaded {} seed points", points.len());
    Ok(points)
}

/// Number of vertices in a PLY file.
pub fn ply_vertex_count(path: impl AsRef<Path>) -> Result<usize, DataError> {
    Ok(read_ply(path.as_ref())?.vertex.len())
}
