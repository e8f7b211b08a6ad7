//! End-to-end scenarios driving `pipeline::run` against small fixture files,
//! checking the observable results (`tileset.json`, exit-mapped errors)
//! rather than internal pipeline state.

use std::io::Write;
use std::path::PathBuf;
use tiler_common::config::AttributeFlags;
use tiler_common::error::TilerError;
use tiler_common::pipeline::{self, ConvertOptions};

struct TempDir(PathBuf);

impl TempDir {
    fn new(label: &str) -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "tiler-convert-test-{label}-{}-{:p}",
            std::process::id(),
            &path as *const _
        ));
        std::fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn write_fixture(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.0.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

fn base_options(files: Vec<PathBuf>, out_folder: PathBuf) -> ConvertOptions {
    ConvertOptions {
        files,
        out_folder,
        overwrite: false,
        jobs: 2,
        cache_size_bytes: 64 << 20,
        srs_in: None,
        srs_out: None,
        force_srs_in: false,
        attributes: AttributeFlags::default(),
        color_scale: None,
        verbosity: 0,
        benchmark_tag: None,
    }
}

/// Scenario 1: two points produce a one-tile tileset whose root bounding box
/// is centered between them.
#[test]
fn tiny_two_point_file_produces_tileset() {
    let work = TempDir::new("tiny");
    let input = write_fixture(&work, "tiny.xyz", "0 0 0\n1 1 1\n");
    let out = work.0.join("out");

    let stats = pipeline::run(base_options(vec![input], out.clone())).unwrap();

    assert_eq!(stats.points_read, 2);
    assert_eq!(stats.points_written, 2);
    assert!(stats.tiles_written >= 1);

    let tileset = std::fs::read_to_string(out.join("tileset.json")).unwrap();
    assert!(tileset.contains("\"boundingVolume\""));
    assert!(tileset.contains("\"REPLACE\""));
}

/// Scenario 6: a non-empty output folder is rejected unless `--overwrite` is set.
#[test]
fn nonempty_out_folder_requires_overwrite() {
    let work = TempDir::new("overwrite");
    let input = write_fixture(&work, "points.xyz", "0 0 0\n1 1 1\n2 2 2\n");
    let out = work.0.join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("stale.txt"), b"leftover").unwrap();

    let err = pipeline::run(base_options(vec![input.clone()], out.clone())).unwrap_err();
    assert!(matches!(err, TilerError::FolderNotEmpty(_)));
    assert_eq!(err.exit_code(), 3);
    assert!(out.join("stale.txt").exists());

    let mut options = base_options(vec![input], out.clone());
    options.overwrite = true;
    let stats = pipeline::run(options).unwrap();
    assert_eq!(stats.points_written, 3);
    assert!(!out.join("stale.txt").exists());
}

/// An output CRS requested without any known input CRS fails fast, before any
/// worker is spawned, with the dedicated exit code.
#[test]
fn missing_input_srs_is_rejected_when_output_crs_requested() {
    let work = TempDir::new("missing-srs");
    let input = write_fixture(&work, "points.xyz", "0 0 0\n1 1 1\n");
    let out = work.0.join("out");

    let mut options = base_options(vec![input], out.clone());
    options.srs_out = Some(4978);

    let err = pipeline::run(options).unwrap_err();
    assert!(matches!(err, TilerError::MissingInputSrs { .. }));
    assert_eq!(err.exit_code(), 10);
    // Configuration errors are caught before any output folder is touched.
    assert!(!out.exists());
}

/// `--srs_in` applied uniformly satisfies the same check once every file is
/// known to share a CRS.
#[test]
fn srs_in_override_satisfies_missing_srs_check() {
    let work = TempDir::new("srs-in");
    let input = write_fixture(&work, "points.xyz", "0 0 0\n1 1 1\n");
    let out = work.0.join("out");

    let mut options = base_options(vec![input], out);
    options.srs_out = Some(4978);
    options.srs_in = Some("4326".to_string());

    let stats = pipeline::run(options).unwrap();
    assert_eq!(stats.points_written, 2);
}

/// A point count mismatch between what a reader reports and what lands in
/// tiles would be a fatal invariant violation; absent any fault injection,
/// this simply checks the accounting holds for a slightly larger cloud that
/// exercises multiple worker batches end to end.
#[test]
fn larger_cloud_preserves_point_count() {
    let work = TempDir::new("larger");
    let mut contents = String::new();
    for i in 0..5_000 {
        let v = i as f64 * 0.01;
        contents.push_str(&format!("{v} {v} {v}\n"));
    }
    let input = write_fixture(&work, "cloud.xyz", &contents);
    let out = work.0.join("out");

    let stats = pipeline::run(base_options(vec![input], out.clone())).unwrap();
    assert_eq!(stats.points_read, 5_000);
    assert_eq!(stats.points_written, 5_000);

    let tileset = std::fs::read_to_string(out.join("tileset.json")).unwrap();
    assert!(tileset.contains("\"asset\""));
}
