//! Post-pipeline tileset assembly.
//!
//! Walks the on-disk node tiles that the worker pool wrote, prunes tiny
//! leaves into their parent, computes bounding volumes from the tiles'
//! actual encoded positions (not the theoretical node AABB, which is always
//! wider than what a spacing-enforced grid actually keeps), and writes
//! `tileset.json` - splitting a subtree into an external
//! `tileset.<name>.json` once it would be too large to embed inline.

use crate::config::SharedMetadata;
use crate::error::{Result, TilerError};
use crate::geometry::aabb::{Aabb, SubdivisionType};
use crate::geometry::name::NodeName;
use crate::geometry::point::PointBatch;
use crate::node;
use crate::tile_encoder::{decode_pnts, encode_pnts};
use serde_json::{json, Value};
use std::path::Path;

/// A childless node with fewer than this many points is merged into its
/// parent's tile rather than kept as its own near-empty tile file.
const PRUNE_MIN_POINTS: usize = 100;

/// A subtree whose inline JSON would exceed roughly this many bytes is split
/// off into its own `tileset.<name>.json`, referenced by an external content URI.
const SUBTILESET_SPLIT_BYTES: usize = 100_000;

struct TileInfo {
    name: NodeName,
    /// Tight bounding box of this node's own points only.
    own_aabb: Aabb,
    /// Union of `own_aabb` with every kept descendant's `subtree_aabb` -
    /// only used for the root tile, which (being REPLACE) must contain
    /// everything it can refine into.
    subtree_aabb: Aabb,
    point_count: usize,
    spacing: f64,
    children: Vec<TileInfo>,
}

/// Builds and writes `tileset.json` (plus any external sub-tilesets) under
/// `metadata.out_folder`, from the tiles already written to that folder.
pub fn finalize(metadata: &SharedMetadata) -> Result<()> {
    let root = build_and_prune(&NodeName::root(), metadata)?.ok_or_else(|| {
        TilerError::Other("no tiles were written; nothing to build a tileset from".to_string())
    })?;

    let top_level_error = if root.spacing > 0.0 { root.spacing } else { 1.0 };
    let doc = json!({
        "asset": { "version": "1.0" },
        "geometricError": top_level_error,
        "root": to_tile_json(&root, metadata, true)?,
    });

    let path = metadata.out_folder.join("tileset.json");
    std::fs::write(
        &path,
        serde_json::to_vec_pretty(&doc).expect("tileset JSON is always serializable"),
    )
    .map_err(|e| crate::io::io_err(&path, e))
}

fn applicable_octants(subdivision: SubdivisionType) -> &'static [u8] {
    match subdivision {
        SubdivisionType::Octree => &[0, 1, 2, 3, 4, 5, 6, 7],
        // The z bit is never set for a quadtree node (see Aabb::child_aabb),
        // so only the four octants with that bit clear are distinct.
        SubdivisionType::Quadtree => &[0, 2, 4, 6],
    }
}

/// Recursively loads the tile at `name` (if one was written), recurses into
/// its children first, then merges any child that turned out to be a
/// childless, under-threshold leaf back into this node before returning.
fn build_and_prune(name: &NodeName, metadata: &SharedMetadata) -> Result<Option<TileInfo>> {
    let path = name.sharded_path(&metadata.out_folder, "pnts");
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path).map_err(|e| crate::io::io_err(&path, e))?;
    let mut points = decode_pnts(&bytes)?;

    let (aabb, spacing) = node::aabb_and_spacing_for(name, &metadata.root_aabb, metadata.root_spacing);
    let subdivision = aabb.subdivision_type();

    let mut children = Vec::new();
    for &octant in applicable_octants(subdivision) {
        if let Some(child) = build_and_prune(&name.child(octant), metadata)? {
            children.push(child);
        }
    }

    let mut kept = Vec::with_capacity(children.len());
    let mut merged = false;
    for child in children {
        if child.children.is_empty() && child.point_count < PRUNE_MIN_POINTS && child.name.depth() > 1 {
            let child_path = child.name.sharded_path(&metadata.out_folder, "pnts");
            let child_bytes = std::fs::read(&child_path).map_err(|e| crate::io::io_err(&child_path, e))?;
            let child_points = decode_pnts(&child_bytes)?;
            points.extend_from(&child_points);
            std::fs::remove_file(&child_path).map_err(|e| crate::io::io_err(&child_path, e))?;
            merged = true;
        } else {
            kept.push(child);
        }
    }

    if merged {
        let encoded = encode_pnts(
            &points,
            metadata.attributes.rgb,
            metadata.attributes.classification,
            metadata.attributes.intensity,
        );
        std::fs::write(&path, encoded).map_err(|e| crate::io::io_err(&path, e))?;
    }

    let own_aabb = tight_aabb(&points).unwrap_or(aabb);
    let mut subtree_aabb = own_aabb;
    for child in &kept {
        subtree_aabb.extend_union(&child.subtree_aabb);
    }

    Ok(Some(TileInfo {
        name: name.clone(),
        own_aabb,
        subtree_aabb,
        point_count: points.len(),
        spacing,
        children: kept,
    }))
}

fn tight_aabb(points: &PointBatch) -> Option<Aabb> {
    Aabb::from_points((0..points.len()).map(|i| points.position_f64(i)))
}

fn box_bounding_volume(aabb: &Aabb) -> Value {
    let center = aabb.center();
    let size = aabb.size();
    json!({
        "box": [
            center.x, center.y, center.z,
            size.x / 2.0, 0.0, 0.0,
            0.0, size.y / 2.0, 0.0,
            0.0, 0.0, size.z / 2.0,
        ]
    })
}

/// Root uses its full subtree volume (REPLACE requires children be
/// contained within it); descendants use their own tight volume, matching
/// how point-cloud ADD tilesets are conventionally written.
fn to_tile_json(info: &TileInfo, metadata: &SharedMetadata, is_root: bool) -> Result<Value> {
    let bounding_volume = box_bounding_volume(if is_root { &info.subtree_aabb } else { &info.own_aabb });
    let geometric_error = if info.children.is_empty() { 0.0 } else { info.spacing };
    let uri = info.name.sharded_path(Path::new(""), "pnts");

    let mut children_json = Vec::with_capacity(info.children.len());
    for child in &info.children {
        children_json.push(to_tile_or_external(child, metadata)?);
    }

    let mut tile = json!({
        "boundingVolume": bounding_volume,
        "geometricError": geometric_error,
        "refine": if is_root { "REPLACE" } else { "ADD" },
        "content": { "uri": uri.to_string_lossy() },
    });
    if !children_json.is_empty() {
        tile["children"] = Value::Array(children_json);
    }
    Ok(tile)
}

/// Builds `child`'s tile JSON inline, unless its subtree is large enough to
/// warrant splitting into its own `tileset.<name>.json` file.
fn to_tile_or_external(child: &TileInfo, metadata: &SharedMetadata) -> Result<Value> {
    let inline = to_tile_json(child, metadata, false)?;
    if child.children.is_empty() {
        return Ok(inline);
    }
    let estimated_size = serde_json::to_string(&inline).map(|s| s.len()).unwrap_or(0);
    if estimated_size <= SUBTILESET_SPLIT_BYTES {
        return Ok(inline);
    }

    let sub_doc = json!({
        "asset": { "version": "1.0" },
        "geometricError": child.spacing,
        "root": inline,
    });
    let file_name = format!("tileset.{}.json", child.name);
    let path = metadata.out_folder.join(&file_name);
    std::fs::write(
        &path,
        serde_json::to_vec(&sub_doc).expect("tileset JSON is always serializable"),
    )
    .map_err(|e| crate::io::io_err(&path, e))?;

    Ok(json!({
        "boundingVolume": box_bounding_volume(&child.own_aabb),
        "geometricError": child.spacing,
        "refine": "ADD",
        "content": { "uri": file_name },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeFlags;
    use nalgebra::{Matrix3, Point3};

    fn metadata(out_folder: &Path) -> SharedMetadata {
        SharedMetadata {
            out_folder: out_folder.to_path_buf(),
            working_dir: out_folder.join("tmp"),
            jobs: 1,
            cache_size_bytes: 1 << 20,
            root_aabb: Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0)),
            root_spacing: 1.0,
            offset: Point3::new(0.0, 0.0, 0.0),
            scale: 1.0,
            rotation: Matrix3::identity(),
            attributes: AttributeFlags::default(),
            color_scale: None,
            verbosity: 0,
            benchmark_tag: None,
        }
    }

    struct TempDir(std::path::PathBuf);
    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("tileset-test-{}-{:p}", std::process::id(), &path as *const _));
            std::fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn write_tile(dir: &Path, name: &NodeName, count: usize) {
        let mut points = PointBatch::default();
        for i in 0..count {
            points.push([i as f32 * 0.1, 0.0, 0.0], [1, 2, 3], 0, 0);
        }
        let bytes = encode_pnts(&points, true, false, false);
        let path = name.sharded_path(dir, "pnts");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
    }

    #[test]
    fn single_root_tile_produces_tileset_json() {
        let dir = TempDir::new();
        write_tile(&dir.0, &NodeName::root(), 5);
        let metadata = metadata(&dir.0);

        finalize(&metadata).unwrap();
        let contents = std::fs::read_to_string(dir.0.join("tileset.json")).unwrap();
        assert!(contents.contains("\"REPLACE\""));
        assert!(contents.contains("\"boundingVolume\""));
    }

    #[test]
    fn tiny_grandchild_gets_pruned_into_its_parent() {
        let dir = TempDir::new();
        write_tile(&dir.0, &NodeName::root(), 5);
        write_tile(&dir.0, &NodeName::from_digits(&[0]), 50);
        write_tile(&dir.0, &NodeName::from_digits(&[0, 0]), 3);
        let metadata = metadata(&dir.0);

        finalize(&metadata).unwrap();
        assert!(!NodeName::from_digits(&[0, 0]).sharded_path(&dir.0, "pnts").exists());
        assert!(NodeName::from_digits(&[0]).sharded_path(&dir.0, "pnts").exists());
        let contents = std::fs::read_to_string(dir.0.join("tileset.json")).unwrap();
        // The [0] tile is kept as a childless leaf under root (its own grandchild was merged away).
        assert!(contents.contains("\"children\""));
    }

    #[test]
    fn deep_child_with_enough_points_is_kept() {
        let dir = TempDir::new();
        write_tile(&dir.0, &NodeName::root(), 5);
        write_tile(&dir.0, &NodeName::from_digits(&[0]), PRUNE_MIN_POINTS + 1);
        let metadata = metadata(&dir.0);

        finalize(&metadata).unwrap();
        assert!(NodeName::from_digits(&[0]).sharded_path(&dir.0, "pnts").exists());
        let contents = std::fs::read_to_string(dir.0.join("tileset.json")).unwrap();
        assert!(contents.contains("\"children\""));
        assert!(contents.contains("\"ADD\""));
    }
}
