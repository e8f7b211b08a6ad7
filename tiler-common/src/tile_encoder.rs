//! Binary tile container encoding: wraps a node's finalized
//! `xyz || rgb || classification || intensity` buffer into a `.pnts` file.
//!
//! The exact wire format is explicitly non-normative (see the surrounding
//! design notes) - this is a minimal, self-contained encoder so the pipeline
//! is runnable end-to-end, modeled loosely on the 3D Tiles point-cloud
//! feature-table/batch-table framing: a fixed 28-byte header, a JSON feature
//! table describing the `POSITION`/`RGB` layout, a feature table binary
//! chunk, and (for classification/intensity, which have no feature-table
//! slot of their own) a small batch table carrying them as per-point
//! property arrays.

use crate::config::AttributeFlags;
use crate::error::{Result, TilerError};
use crate::geometry::point::PointBatch;
use serde_json::{json, Value};
use std::path::Path;

/// Seam between the worker pool and a concrete tile file format - a worker
/// never encodes bytes itself, only asks the encoder to. Kept as a trait
/// (rather than calling `encode_pnts` directly) so a future 3D Tiles
/// implementation could swap in glTF/`.glb` tiles without touching
/// `worker_pool`.
pub trait TileEncoder: Send + Sync {
    fn encode(&self, points: &PointBatch, attributes: AttributeFlags) -> Vec<u8>;
    fn file_extension(&self) -> &'static str;
}

/// The encoder shipped by this crate: the minimal `.pnts`-like format defined below.
pub struct PntsEncoder;

impl TileEncoder for PntsEncoder {
    fn encode(&self, points: &PointBatch, attributes: AttributeFlags) -> Vec<u8> {
        encode_pnts(points, attributes.rgb, attributes.classification, attributes.intensity)
    }

    fn file_extension(&self) -> &'static str {
        "pnts"
    }
}

const MAGIC: &[u8; 4] = b"pnts";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 28;

fn pad4(json: &mut Vec<u8>) {
    while json.len() % 4 != 0 {
        json.push(b' ');
    }
}

/// Encodes `points` (already finalized/thinned, in the node's local frame)
/// into a complete `.pnts` byte buffer.
pub fn encode_pnts(points: &PointBatch, include_rgb: bool, include_classification: bool, include_intensity: bool) -> Vec<u8> {
    let count = points.len();

    let mut feature_table_binary = Vec::with_capacity(count * 12);
    for p in &points.xyz {
        feature_table_binary.extend_from_slice(&p[0].to_le_bytes());
        feature_table_binary.extend_from_slice(&p[1].to_le_bytes());
        feature_table_binary.extend_from_slice(&p[2].to_le_bytes());
    }
    let position_offset = 0usize;
    let rgb_offset = feature_table_binary.len();
    if include_rgb {
        for c in &points.rgb {
            feature_table_binary.extend_from_slice(c);
        }
    }

    let mut feature_table_json = json!({
        "POINTS_LENGTH": count,
        "POSITION": { "byteOffset": position_offset },
    });
    if include_rgb {
        feature_table_json["RGB"] = json!({ "byteOffset": rgb_offset });
    }

    let mut batch_table_binary = Vec::new();
    let mut batch_table_json = json!({});
    if include_classification {
        let offset = batch_table_binary.len();
        batch_table_binary.extend_from_slice(&points.classification);
        batch_table_json["Classification"] = json!({
            "byteOffset": offset,
            "componentType": "UNSIGNED_BYTE",
            "type": "SCALAR",
        });
    }
    if include_intensity {
        let offset = batch_table_binary.len();
        batch_table_binary.extend_from_slice(&points.intensity);
        batch_table_json["Intensity"] = json!({
            "byteOffset": offset,
            "componentType": "UNSIGNED_BYTE",
            "type": "SCALAR",
        });
    }

    let mut feature_table_json_bytes = feature_table_json.to_string().into_bytes();
    pad4(&mut feature_table_json_bytes);
    let mut batch_table_json_bytes = batch_table_json.to_string().into_bytes();
    pad4(&mut batch_table_json_bytes);
    while feature_table_binary.len() % 4 != 0 {
        feature_table_binary.push(0);
    }
    while batch_table_binary.len() % 4 != 0 {
        batch_table_binary.push(0);
    }

    let byte_length = HEADER_LEN
        + feature_table_json_bytes.len()
        + feature_table_binary.len()
        + batch_table_json_bytes.len()
        + batch_table_binary.len();

    let mut out = Vec::with_capacity(byte_length);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(byte_length as u32).to_le_bytes());
    out.extend_from_slice(&(feature_table_json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&(feature_table_binary.len() as u32).to_le_bytes());
    out.extend_from_slice(&(batch_table_json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&(batch_table_binary.len() as u32).to_le_bytes());
    out.extend_from_slice(&feature_table_json_bytes);
    out.extend_from_slice(&feature_table_binary);
    out.extend_from_slice(&batch_table_json_bytes);
    out.extend_from_slice(&batch_table_binary);
    out
}

pub fn write_pnts(path: &Path, points: &PointBatch, include_rgb: bool, include_classification: bool, include_intensity: bool) -> Result<()> {
    let bytes = encode_pnts(points, include_rgb, include_classification, include_intensity);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| crate::io::io_err(path, e))?;
    }
    std::fs::write(path, bytes).map_err(|e| crate::io::io_err(path, e))
}

/// Decodes a `.pnts` buffer back into positions and, where present, RGB and
/// classification/intensity arrays. Used by tileset finalization, which needs
/// to read already-written tiles back (to build the root tile and to prune
/// small children into their parent).
pub fn decode_pnts(bytes: &[u8]) -> Result<PointBatch> {
    if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
        return Err(TilerError::DataFormat {
            path: Default::default(),
            message: "not a pnts file (bad magic)".to_string(),
        });
    }
    let read_u32 = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    let ft_json_len = read_u32(12) as usize;
    let ft_bin_len = read_u32(16) as usize;
    let bt_json_len = read_u32(20) as usize;
    let bt_bin_len = read_u32(24) as usize;

    let mut offset = HEADER_LEN;
    let ft_json: Value = serde_json::from_slice(&bytes[offset..offset + ft_json_len]).map_err(|e| TilerError::DataFormat {
        path: Default::default(),
        message: format!("malformed pnts feature table JSON: {e}"),
    })?;
    offset += ft_json_len;
    let ft_bin = &bytes[offset..offset + ft_bin_len];
    offset += ft_bin_len;
    let bt_json: Value = serde_json::from_slice(&bytes[offset..offset + bt_json_len]).map_err(|e| TilerError::DataFormat {
        path: Default::default(),
        message: format!("malformed pnts batch table JSON: {e}"),
    })?;
    offset += bt_json_len;
    let bt_bin = &bytes[offset..offset + bt_bin_len];

    let count = ft_json["POINTS_LENGTH"].as_u64().unwrap_or(0) as usize;
    let pos_offset = ft_json["POSITION"]["byteOffset"].as_u64().unwrap_or(0) as usize;

    let mut batch = PointBatch::with_capacity(count);
    let read_f32 = |buf: &[u8], off: usize| f32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    for i in 0..count {
        let base = pos_offset + i * 12;
        let xyz = [
            read_f32(ft_bin, base),
            read_f32(ft_bin, base + 4),
            read_f32(ft_bin, base + 8),
        ];

        let rgb = if let Some(rgb_field) = ft_json.get("RGB") {
            let rgb_offset = rgb_field["byteOffset"].as_u64().unwrap_or(0) as usize + i * 3;
            [ft_bin[rgb_offset], ft_bin[rgb_offset + 1], ft_bin[rgb_offset + 2]]
        } else {
            [0, 0, 0]
        };

        let classification = if let Some(field) = bt_json.get("Classification") {
            bt_bin[field["byteOffset"].as_u64().unwrap_or(0) as usize + i]
        } else {
            0
        };
        let intensity = if let Some(field) = bt_json.get("Intensity") {
            bt_bin[field["byteOffset"].as_u64().unwrap_or(0) as usize + i]
        } else {
            0
        };

        batch.push(xyz, rgb, classification, intensity);
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_positions_and_attributes() {
        let mut points = PointBatch::default();
        points.push([1.0, 2.0, 3.0], [10, 20, 30], 5, 200);
        points.push([4.0, 5.0, 6.0], [40, 50, 60], 7, 210);

        let bytes = encode_pnts(&points, true, true, true);
        let decoded = decode_pnts(&bytes).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.xyz, points.xyz);
        assert_eq!(decoded.rgb, points.rgb);
        assert_eq!(decoded.classification, points.classification);
        assert_eq!(decoded.intensity, points.intensity);
    }

    #[test]
    fn omitted_sections_decode_as_zero_filled() {
        let mut points = PointBatch::default();
        points.push([1.0, 1.0, 1.0], [9, 9, 9], 3, 3);
        let bytes = encode_pnts(&points, false, false, false);
        let decoded = decode_pnts(&bytes).unwrap();
        assert_eq!(decoded.rgb[0], [0, 0, 0]);
        assert_eq!(decoded.classification[0], 0);
        assert_eq!(decoded.intensity[0], 0);
    }
}
