//! Top-level orchestration: the inspection pass over every input file, the
//! dispatcher-thread loop that drives a [`WorkerPool`] against a
//! [`TilerState`], and the point-accounting check that gates handing off to
//! tileset finalization. This module plays the role of the dispatcher
//! process in the surrounding design notes, with the process boundary
//! collapsed to this thread driving worker threads directly.

use crate::config::SharedMetadata;
use crate::crs::{self, CrsTransform, IdentityTransform};
use crate::dispatcher::{FilePortion, Job, TilerState};
use crate::error::{Result, TilerError};
use crate::geometry::aabb::Aabb;
use crate::io;
use crate::node_store::NodeStore;
use crate::tile_encoder::{PntsEncoder, TileEncoder};
use crate::tileset;
use crate::worker_pool::{WorkerPool, WorkerResult};
use log::{debug, info};
use nalgebra::Point3;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resolved CLI input to a conversion run - the raw, not-yet-computed half of
/// what becomes a [`SharedMetadata`].
pub struct ConvertOptions {
    pub files: Vec<PathBuf>,
    pub out_folder: PathBuf,
    pub overwrite: bool,
    pub jobs: usize,
    pub cache_size_bytes: usize,
    pub srs_in: Option<String>,
    /// Destination EPSG code, when reprojection is requested.
    pub srs_out: Option<u32>,
    pub force_srs_in: bool,
    pub attributes: crate::config::AttributeFlags,
    pub color_scale: Option<f32>,
    pub verbosity: u8,
    pub benchmark_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversionStats {
    pub points_read: u64,
    pub points_written: u64,
    pub tiles_written: u64,
    pub elapsed: Duration,
}

/// Runs one end-to-end conversion: inspect, tile, finalize.
pub fn run(options: ConvertOptions) -> Result<ConversionStats> {
    if options.files.is_empty() {
        return Err(TilerError::MissingArgument(
            "at least one input file is required".to_string(),
        ));
    }

    // Validate every input (including the CRS-consistency checks from §4.1)
    // before touching the filesystem, so a configuration error never leaves
    // behind an output folder - per §8's scenario 4.
    let start = Instant::now();
    let (per_file, overall_aabb, point_count) = inspect_inputs(&options)?;
    let overall_aabb = overall_aabb.make_valid();

    prepare_out_folder(&options.out_folder, options.overwrite)?;
    let working_dir = options.out_folder.join("tmp").join("points");
    std::fs::create_dir_all(&working_dir).map_err(|e| crate::io::io_err(&working_dir, e))?;

    let diagonal = {
        let size = overall_aabb.size();
        (size.x * size.x + size.y * size.y + size.z * size.z).sqrt()
    };
    let scale = SharedMetadata::choose_scale(diagonal);
    let root_spacing = SharedMetadata::root_spacing_for(&overall_aabb);
    let avg_min = average_min(&per_file);

    let geocentric = options.srs_out.map(crs::is_geocentric).unwrap_or(false);
    let rotation = crs::enu_rotation(avg_min, geocentric);
    // Reprojection itself is an external collaborator (see crs.rs); only the
    // rotation derived from the chosen output CRS is computed here.
    let crs_transform: Arc<dyn CrsTransform> = Arc::new(IdentityTransform);

    let shared = Arc::new(SharedMetadata {
        out_folder: options.out_folder.clone(),
        working_dir: working_dir.clone(),
        jobs: options.jobs,
        cache_size_bytes: options.cache_size_bytes,
        root_aabb: overall_aabb,
        root_spacing,
        offset: avg_min,
        scale,
        rotation,
        attributes: options.attributes,
        color_scale: options.color_scale,
        verbosity: options.verbosity,
        benchmark_tag: options.benchmark_tag.clone(),
    });

    let node_store = Arc::new(NodeStore::new(working_dir.clone()));
    let encoder: Arc<dyn TileEncoder> = Arc::new(PntsEncoder);

    let file_portions: Vec<FilePortion> = per_file
        .iter()
        .flat_map(|(path, meta)| {
            meta.portions.iter().map(move |p| FilePortion {
                path: path.clone(),
                start: p.start_point,
                end: p.end_point,
                byte_offset: p.byte_offset,
            })
        })
        .collect();

    info!(
        "inspected {} file(s), {} points total, root diagonal {:.2}",
        per_file.len(),
        point_count,
        diagonal
    );

    let mut state = TilerState::new(file_portions, shared.jobs.max(1) as u32);
    let pool = WorkerPool::spawn(
        shared.jobs,
        Arc::clone(&shared),
        Arc::clone(&node_store),
        encoder,
        crs_transform,
    );
    let job_tx = pool.job_sender();
    let result_rx = pool.result_receiver();

    let mut tiles_written = 0u64;
    let mut fatal: Option<TilerError> = None;

    loop {
        while let Some(job) = state.next_job() {
            if let Job::Read(ref portion) = job {
                state.on_read_started(portion.end - portion.start);
            }
            if job_tx.send(job).is_err() {
                break;
            }
        }

        if state.is_idle() {
            break;
        }

        debug!("queues: {}", state.queue_depths());

        let result = match result_rx.recv() {
            Ok(r) => r,
            Err(_) => break,
        };

        match result {
            WorkerResult::NewTask {
                node,
                data,
                point_count,
            } => {
                state.add_task_to_process(node, data, point_count);
            }
            WorkerResult::ReadDone => state.on_read_done(),
            WorkerResult::Processed { node, point_count } => state.on_processed(node, point_count),
            WorkerResult::Written { point_count, .. } => {
                state.on_write_done(point_count);
                tiles_written += 1;
            }
            WorkerResult::Error(message) => {
                fatal = Some(TilerError::WorkerFault(message));
                break;
            }
        }
    }

    let points_written = state.points_written;
    pool.shutdown();

    if let Some(err) = fatal {
        return Err(err);
    }

    if points_written != point_count {
        return Err(TilerError::PointAccountingMismatch {
            expected: point_count,
            actual: points_written,
        });
    }

    tileset::finalize(&shared)?;
    let _ = std::fs::remove_dir_all(&working_dir);

    let elapsed = start.elapsed();
    if let Some(tag) = &shared.benchmark_tag {
        // Printed directly to stdout (not through `log`) so the benchmark
        // line survives regardless of the run's verbosity level.
        let points_per_sec = points_written as f64 / elapsed.as_secs_f64().max(1e-9);
        println!("[{tag}] points_written={points_written} tiles_written={tiles_written} elapsed={elapsed:?} points_per_sec={points_per_sec:.0}");
    }

    Ok(ConversionStats {
        points_read: point_count,
        points_written,
        tiles_written,
        elapsed,
    })
}

fn prepare_out_folder(out_folder: &Path, overwrite: bool) -> Result<()> {
    if out_folder.exists() {
        let non_empty = std::fs::read_dir(out_folder)
            .map(|mut d| d.next().is_some())
            .unwrap_or(false);
        if non_empty {
            if overwrite {
                std::fs::remove_dir_all(out_folder).map_err(|e| crate::io::io_err(out_folder, e))?;
            } else {
                return Err(TilerError::FolderNotEmpty(out_folder.to_path_buf()));
            }
        }
    }
    std::fs::create_dir_all(out_folder).map_err(|e| crate::io::io_err(out_folder, e))
}

/// Inspects every input file, validating CRS consistency (when an output CRS
/// was requested) and accumulating the overall AABB/point count needed to
/// size the root node. Per-file embedded CRS detection is out of scope (see
/// DESIGN.md) - only `--srs_in`, applied uniformly to every file, is checked
/// here, so `MixedInputSrs` only fires for a future reader that populates
/// [`io::Metadata::crs`] from a file's own header.
fn inspect_inputs(options: &ConvertOptions) -> Result<(Vec<(PathBuf, io::Metadata)>, Aabb, u64)> {
    let mut per_file = Vec::with_capacity(options.files.len());
    let mut overall: Option<Aabb> = None;
    let mut total_points = 0u64;
    let mut first_known_crs: Option<(String, PathBuf)> = None;

    for path in &options.files {
        let mut meta = io::inspect_file(path)?;
        if let Some(srs_in) = &options.srs_in {
            meta.crs = Some(srs_in.clone());
        }

        if options.srs_out.is_some() && !options.force_srs_in {
            match &meta.crs {
                None => {
                    return Err(TilerError::MissingInputSrs { path: path.clone() });
                }
                Some(crs) => match &first_known_crs {
                    None => first_known_crs = Some((crs.clone(), path.clone())),
                    Some((first, first_path)) if first != crs => {
                        return Err(TilerError::MixedInputSrs {
                            first: first.clone(),
                            first_path: first_path.clone(),
                            second: crs.clone(),
                            second_path: path.clone(),
                        });
                    }
                    Some(_) => {}
                },
            }
        }

        total_points += meta.point_count;
        overall = Some(match overall {
            Some(mut acc) => {
                acc.extend_union(&meta.aabb);
                acc
            }
            None => meta.aabb,
        });
        per_file.push((path.clone(), meta));
    }

    let overall = overall.ok_or_else(|| {
        TilerError::MissingArgument("no input files yielded any points".to_string())
    })?;
    Ok((per_file, overall, total_points))
}

/// The point-count-weighted mean of every file's `avg_min`, used as the
/// translation offset so the scaled/rotated coordinates stay well inside
/// `f32` precision regardless of the cloud's absolute position.
fn average_min(per_file: &[(PathBuf, io::Metadata)]) -> Point3<f64> {
    let mut sum = Point3::new(0.0, 0.0, 0.0);
    let mut total = 0.0;
    for (_, meta) in per_file {
        let w = meta.point_count as f64;
        sum.x += meta.avg_min.x * w;
        sum.y += meta.avg_min.y * w;
        sum.z += meta.avg_min.z * w;
        total += w;
    }
    if total > 0.0 {
        Point3::new(sum.x / total, sum.y / total, sum.z / total)
    } else {
        Point3::origin()
    }
}
