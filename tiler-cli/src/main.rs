#![deny(unused_must_use)]

mod cli;
mod commands;

use crate::cli::{AppOptions, Command};
use clap::Parser;
use human_panic::setup_panic;
use log::{debug, error};
use std::process::ExitCode;
pub use tiler_common as common;

/// Maps the `-v` repeat count onto a `log` level: 0 = warn, 1 = info,
/// 2 = debug, 3+ = trace.
fn log_level_for(verbosity: u8) -> log::Level {
    match verbosity {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

fn main() -> ExitCode {
    setup_panic!();
    let args = AppOptions::parse();

    let verbosity = match &args.command {
        Command::Convert(options) => options.v,
    };
    // unwrap: will only fail if the logger is already initialized, which it is not.
    simple_logger::init_with_level(log_level_for(verbosity)).unwrap();

    let result = match args.command {
        Command::Convert(options) => commands::convert::run(options),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            debug!("{e:?}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
