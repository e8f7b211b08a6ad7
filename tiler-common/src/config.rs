//! The fully-resolved set of run parameters ("shared metadata"), assembled once
//! from CLI flags plus computed values before any worker starts. Every worker
//! and the dispatcher read this but never mutate it, mirroring the source
//! system's settings-struct convention.

use crate::geometry::aabb::Aabb;
use nalgebra::{Matrix3, Point3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Candidate root scales a run can choose between, picked from the overall
/// diagonal of the input point cloud.
pub const ROOT_SCALE_CANDIDATES: [f64; 3] = [1e-2, 1e-1, 1.0];

/// Root spacing is derived from the root AABB's diagonal so that descending
/// the tree eventually bottoms out at [`crate::node::MIN_SPACING_FACTOR`]
/// after a reasonable number of levels; the exact divisor is a tuning
/// constant, not something the spec pins down (see DESIGN.md).
pub const ROOT_SPACING_DIVISOR: f64 = 128.0;

/// Which optional per-point attributes get written into finalized tiles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttributeFlags {
    pub rgb: bool,
    pub classification: bool,
    pub intensity: bool,
}

impl Default for AttributeFlags {
    fn default() -> Self {
        AttributeFlags {
            rgb: true,
            classification: false,
            intensity: false,
        }
    }
}

/// The immutable, resolved set of run parameters every worker and the
/// dispatcher read but never mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedMetadata {
    pub out_folder: PathBuf,
    pub working_dir: PathBuf,
    pub jobs: usize,
    pub cache_size_bytes: usize,
    pub root_aabb: Aabb,
    pub root_spacing: f64,
    /// Translation applied to every point before scaling: `-avg_min`.
    pub offset: Point3<f64>,
    pub scale: f64,
    pub rotation: Matrix3<f64>,
    pub attributes: AttributeFlags,
    pub color_scale: Option<f32>,
    pub verbosity: u8,
    pub benchmark_tag: Option<String>,
}

impl SharedMetadata {
    /// Picks the smallest scale candidate from [`ROOT_SCALE_CANDIDATES`] that
    /// keeps the scaled diagonal above 1.0, falling back to the largest if the
    /// cloud is tiny - a zero or near-zero diagonal degenerates to the coarsest
    /// scale rather than div-by-zero territory.
    pub fn choose_scale(diagonal: f64) -> f64 {
        for candidate in ROOT_SCALE_CANDIDATES {
            if diagonal * candidate >= 1.0 {
                return candidate;
            }
        }
        *ROOT_SCALE_CANDIDATES.last().unwrap()
    }

    pub fn root_spacing_for(root_aabb: &Aabb) -> f64 {
        let size = root_aabb.size();
        let diagonal = (size.x * size.x + size.y * size.y + size.z * size.z).sqrt();
        diagonal / ROOT_SPACING_DIVISOR
    }
}

/// `cache_size_mb` default: total system RAM / 10. Falls back to a
/// conservative fixed default (512 MiB) if the host's physical memory cannot
/// be queried, rather than failing the run over an unrelated probe.
pub fn default_cache_size_mb() -> u64 {
    use sysinfo::{RefreshKind, System};
    const FALLBACK_MB: u64 = 512;
    let sys = System::new_with_specifics(RefreshKind::everything());
    let total_bytes = sys.total_memory();
    if total_bytes == 0 {
        FALLBACK_MB
    } else {
        (total_bytes / 1_000_000 / 10).max(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_scale_prefers_smallest_that_fits() {
        assert_eq!(SharedMetadata::choose_scale(1000.0), 1e-2);
        assert_eq!(SharedMetadata::choose_scale(5.0), 1e-1);
        assert_eq!(SharedMetadata::choose_scale(0.5), 1.0);
    }

    #[test]
    fn root_spacing_scales_with_diagonal() {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0));
        let spacing = SharedMetadata::root_spacing_for(&aabb);
        assert!(spacing > 0.0);
    }
}
