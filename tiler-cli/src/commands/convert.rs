//! The `convert` subcommand: resolves CLI flags into a
//! [`tiler_common::pipeline::ConvertOptions`] and runs the pipeline.

use crate::cli::ConvertOptions;
use tiler_common::config::{default_cache_size_mb, AttributeFlags};
use tiler_common::error::Result;
use tiler_common::pipeline;

pub fn run(options: ConvertOptions) -> Result<()> {
    let jobs = options
        .jobs
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

    let cache_size_mb = options.cache_size.unwrap_or_else(default_cache_size_mb);
    let cache_size_bytes = (cache_size_mb as usize).saturating_mul(1_000_000);

    let attributes = AttributeFlags {
        rgb: !options.no_rgb,
        classification: options.classification,
        intensity: options.intensity,
    };

    let stats = pipeline::run(pipeline::ConvertOptions {
        files: options.files,
        out_folder: options.out,
        overwrite: options.overwrite,
        jobs,
        cache_size_bytes,
        srs_in: options.srs_in,
        srs_out: options.srs_out,
        force_srs_in: options.force_srs_in,
        attributes,
        color_scale: options.color_scale,
        verbosity: options.v,
        benchmark_tag: options.benchmark,
    })?;

    log::info!(
        "wrote {} tile(s), {} point(s) in {:?}",
        stats.tiles_written,
        stats.points_written,
        stats.elapsed
    );
    Ok(())
}
