//! The fixed point schema this pipeline operates on: position plus RGB,
//! classification and intensity, stored as parallel arrays (a "struct of arrays"
//! batch) rather than an array of per-point structs, mirroring the source
//! system's point-batch convention. Missing attributes are always zero-filled
//! rather than represented as `Option`, so downstream code never has to branch
//! on attribute presence.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// A batch of points sharing the fixed attribute schema.
///
/// Position storage is `f32` (tile size matters, and points are always local
/// to a node whose AABB bounds the representable range); bookkeeping math
/// (AABBs, transforms) stays in `f64`. This split is intentional - see the
/// surrounding design notes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointBatch {
    pub xyz: Vec<[f32; 3]>,
    pub rgb: Vec<[u8; 3]>,
    pub classification: Vec<u8>,
    pub intensity: Vec<u8>,
}

impl PointBatch {
    pub fn with_capacity(cap: usize) -> Self {
        PointBatch {
            xyz: Vec::with_capacity(cap),
            rgb: Vec::with_capacity(cap),
            classification: Vec::with_capacity(cap),
            intensity: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.xyz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xyz.is_empty()
    }

    pub fn push(&mut self, xyz: [f32; 3], rgb: [u8; 3], classification: u8, intensity: u8) {
        self.xyz.push(xyz);
        self.rgb.push(rgb);
        self.classification.push(classification);
        self.intensity.push(intensity);
    }

    pub fn position_f64(&self, i: usize) -> Point3<f64> {
        let p = self.xyz[i];
        Point3::new(p[0] as f64, p[1] as f64, p[2] as f64)
    }

    /// Splits this batch point-by-point into however many buckets `bucket_of` assigns,
    /// preserving per-point attribute alignment across the `xyz`/`rgb`/`classification`/
    /// `intensity` arrays.
    pub fn partition_by(&self, mut bucket_of: impl FnMut(usize) -> usize, n_buckets: usize) -> Vec<PointBatch> {
        let mut buckets: Vec<PointBatch> = (0..n_buckets).map(|_| PointBatch::default()).collect();
        for i in 0..self.len() {
            let b = bucket_of(i);
            buckets[b].push(
                self.xyz[i],
                self.rgb[i],
                self.classification[i],
                self.intensity[i],
            );
        }
        buckets
    }

    pub fn extend_from(&mut self, other: &PointBatch) {
        self.xyz.extend_from_slice(&other.xyz);
        self.rgb.extend_from_slice(&other.rgb);
        self.classification.extend_from_slice(&other.classification);
        self.intensity.extend_from_slice(&other.intensity);
    }

    /// The `xyz || rgb || classification || intensity` flat encoding consumed by the
    /// tile encoder, with each section optionally omitted per the attribute-export flags.
    pub fn finalize(&self, include_rgb: bool, include_classification: bool, include_intensity: bool) -> Vec<u8> {
        let mut out = Vec::new();
        for p in &self.xyz {
            out.extend_from_slice(&p[0].to_le_bytes());
            out.extend_from_slice(&p[1].to_le_bytes());
            out.extend_from_slice(&p[2].to_le_bytes());
        }
        if include_rgb {
            for c in &self.rgb {
                out.extend_from_slice(c);
            }
        }
        if include_classification {
            out.extend_from_slice(&self.classification);
        }
        if include_intensity {
            out.extend_from_slice(&self.intensity);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_by_preserves_alignment() {
        let mut batch = PointBatch::default();
        batch.push([0.0, 0.0, 0.0], [1, 2, 3], 5, 9);
        batch.push([1.0, 1.0, 1.0], [4, 5, 6], 7, 11);
        let parts = batch.partition_by(|i| i, 2);
        assert_eq!(parts[0].rgb[0], [1, 2, 3]);
        assert_eq!(parts[1].classification[0], 7);
        assert_eq!(parts[1].intensity[0], 11);
    }

    #[test]
    fn finalize_omits_disabled_sections() {
        let mut batch = PointBatch::default();
        batch.push([1.0, 2.0, 3.0], [9, 9, 9], 1, 1);
        let bytes = batch.finalize(false, false, false);
        assert_eq!(bytes.len(), 12);
    }
}
