//! Point-cloud file readers: one `inspect`/`stream` pair per supported format.
//!
//! Every reader normalizes its output to the fixed point schema
//! ([`crate::geometry::point::PointBatch`]) - missing attributes are
//! zero-filled at this boundary so nothing downstream has to branch on
//! attribute presence.

pub mod las;
pub mod ply;
pub mod xyz;

use crate::crs::CrsTransform;
use crate::geometry::aabb::Aabb;
use crate::geometry::point::PointBatch;
use std::path::Path;
use std::sync::Arc;

/// A contiguous range of an input file, sized to bound per-worker memory.
#[derive(Debug, Clone)]
pub struct Portion {
    pub start_point: u64,
    pub end_point: u64,
    pub byte_offset: u64,
}

impl Portion {
    pub fn point_count(&self) -> u64 {
        self.end_point - self.start_point
    }
}

/// Coarse-grained metadata gathered by a single sequential pass over a file,
/// before any worker starts reading it.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub portions: Vec<Portion>,
    pub aabb: Aabb,
    /// The input CRS, if one is known (either declared in the file or via `--srs_in`).
    pub crs: Option<String>,
    pub point_count: u64,
    pub avg_min: nalgebra::Point3<f64>,
}

/// Per-point transform applied while streaming: reproject (if a CRS
/// transform is configured), translate by `-offset`, scale, then rotate.
#[derive(Clone)]
pub struct StreamTransform {
    pub offset: nalgebra::Point3<f64>,
    pub scale: f64,
    pub rotation: nalgebra::Matrix3<f64>,
    pub crs: Option<Arc<dyn CrsTransform>>,
}

impl StreamTransform {
    pub fn apply(&self, p: nalgebra::Point3<f64>) -> [f32; 3] {
        let reprojected = match &self.crs {
            Some(crs) => crs.transform(p),
            None => p,
        };
        let translated = reprojected - self.offset.coords;
        let scaled = translated * self.scale;
        let rotated = self.rotation * scaled;
        [rotated.x as f32, rotated.y as f32, rotated.z as f32]
    }
}

/// Yields batches of at most a few hundred thousand points each. `color_scale`,
/// if set, multiplies RGB components before clamping to `[0, 255]`; `emit_intensity`
/// controls whether the intensity channel is populated or left zero-filled.
pub trait PointReader {
    fn inspect(path: &Path) -> crate::error::Result<Metadata>
    where
        Self: Sized;

    fn stream(
        path: &Path,
        portion: &Portion,
        transform: StreamTransform,
        color_scale: Option<f32>,
        emit_intensity: bool,
    ) -> crate::error::Result<Box<dyn Iterator<Item = crate::error::Result<PointBatch>>>>
    where
        Self: Sized;
}

/// Batches are capped at this many points, bounding worker memory regardless
/// of how large the input portion is.
pub const STREAM_BATCH_SIZE: usize = 100_000;

/// Portions are capped at this many points, bounding per-worker read memory.
pub const PORTION_SIZE: u64 = 1_000_000;

pub fn clamp_color(value: f32, color_scale: Option<f32>) -> u8 {
    let scaled = match color_scale {
        Some(s) => value * s,
        None => value,
    };
    scaled.clamp(0.0, 255.0) as u8
}

/// Dispatches `inspect` to the reader implied by `path`'s extension.
pub fn inspect_file(path: &Path) -> crate::error::Result<Metadata> {
    match extension_of(path)?.as_str() {
        "las" | "laz" => las::LasReader::inspect(path),
        "ply" => ply::PlyReader::inspect(path),
        "xyz" | "csv" | "txt" => xyz::XyzReader::inspect(path),
        _ => Err(crate::error::TilerError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

pub fn stream_file(
    path: &Path,
    portion: &Portion,
    transform: StreamTransform,
    color_scale: Option<f32>,
    emit_intensity: bool,
) -> crate::error::Result<Box<dyn Iterator<Item = crate::error::Result<PointBatch>>>> {
    match extension_of(path)?.as_str() {
        "las" | "laz" => las::LasReader::stream(path, portion, transform, color_scale, emit_intensity),
        "ply" => ply::PlyReader::stream(path, portion, transform, color_scale, emit_intensity),
        "xyz" | "csv" | "txt" => xyz::XyzReader::stream(path, portion, transform, color_scale, emit_intensity),
        _ => Err(crate::error::TilerError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

fn extension_of(path: &Path) -> crate::error::Result<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .ok_or_else(|| crate::error::TilerError::UnsupportedFormat {
            path: path.to_path_buf(),
        })
}

pub(crate) fn io_err(path: &Path, source: std::io::Error) -> crate::error::TilerError {
    crate::error::TilerError::Io {
        path: path.to_path_buf(),
        source,
    }
}
