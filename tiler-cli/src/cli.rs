//! Command-line surface: the single `convert` subcommand that drives
//! `tiler_common::pipeline::run`.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Converts point clouds into 3D Tiles point-cloud tilesets.
#[derive(Debug, Parser)]
#[command(name = "tiler")]
pub struct AppOptions {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Converts one or more LAS/LAZ, PLY, or XYZ/CSV files into a tileset.
    Convert(ConvertOptions),
}

#[derive(Args, Debug)]
pub struct ConvertOptions {
    /// Input point-cloud files (LAS/LAZ, PLY, or XYZ/CSV).
    #[clap(required = true)]
    pub files: Vec<PathBuf>,

    /// Output folder.
    #[clap(long, default_value = "./3dtiles")]
    pub out: PathBuf,

    /// Delete an existing non-empty output folder before converting.
    #[clap(long)]
    pub overwrite: bool,

    /// Worker thread count. Defaults to the number of available CPUs.
    #[clap(long)]
    pub jobs: Option<usize>,

    /// NodeStore memory budget, in MB. Defaults to total system RAM / 10.
    #[clap(long)]
    pub cache_size: Option<u64>,

    /// Overrides or assumes the input CRS (EPSG numeric or Proj4 string).
    #[clap(long)]
    pub srs_in: Option<String>,

    /// Target CRS for the tileset (EPSG numeric).
    #[clap(long)]
    pub srs_out: Option<u32>,

    /// Accepts input files with mixed/conflicting CRSes instead of failing.
    #[clap(long = "force-srs-in")]
    pub force_srs_in: bool,

    /// Omits per-point RGB color from output tiles.
    #[clap(long = "no-rgb")]
    pub no_rgb: bool,

    /// Includes per-point classification in output tiles.
    #[clap(long)]
    pub classification: bool,

    /// Includes per-point intensity in output tiles.
    #[clap(long)]
    pub intensity: bool,

    /// Multiplier applied to RGB components before clamping to [0, 255].
    #[clap(long)]
    pub color_scale: Option<f32>,

    /// Tag to print alongside a final points/second line on success.
    #[clap(long)]
    pub benchmark: Option<String>,

    /// Increases verbosity (-v info, -vv debug, -vvv trace). Default: warn.
    #[clap(short, action = clap::ArgAction::Count)]
    pub v: u8,
}
