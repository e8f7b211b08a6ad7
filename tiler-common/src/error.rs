use std::path::PathBuf;
use thiserror::Error;

/// All ways a conversion run can fail.
///
/// Every variant maps to exactly one of the process exit codes documented
/// on the `convert` CLI command; the mapping lives in [`TilerError::exit_code`]
/// so the CLI binary is the only place that needs to know about exit codes at all.
#[derive(Debug, Error)]
pub enum TilerError {
    #[error("unsupported input format: {path:?}")]
    UnsupportedFormat { path: PathBuf },

    #[error(
        "an output CRS was requested, but no input CRS is known for {path:?} (pass --srs_in)"
    )]
    MissingInputSrs { path: PathBuf },

    #[error(
        "input files have conflicting coordinate reference systems ({first} in {first_path:?}, {second} in {second_path:?}); pass --force-srs-in to override"
    )]
    MixedInputSrs {
        first: String,
        first_path: PathBuf,
        second: String,
        second_path: PathBuf,
    },

    #[error("output folder {0:?} already exists and is not empty (pass --overwrite)")]
    FolderNotEmpty(PathBuf),

    #[error("error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed point record in {path:?}: {message}")]
    DataFormat { path: PathBuf, message: String },

    #[error("worker task failed: {0}")]
    WorkerFault(String),

    #[error(
        "point accounting mismatch: readers reported {expected} points, but {actual} were written"
    )]
    PointAccountingMismatch { expected: u64, actual: u64 },

    #[error("missing required argument: {0}")]
    MissingArgument(String),

    #[error("{0}")]
    Other(String),
}

impl TilerError {
    /// Exit code this error should surface as, per the CLI's documented exit-code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            TilerError::MissingInputSrs { .. } => 10,
            TilerError::MissingArgument(_) => 2,
            TilerError::UnsupportedFormat { .. }
            | TilerError::MixedInputSrs { .. }
            | TilerError::FolderNotEmpty(_) => 3,
            TilerError::Io { .. }
            | TilerError::DataFormat { .. }
            | TilerError::WorkerFault(_)
            | TilerError::PointAccountingMismatch { .. }
            | TilerError::Other(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, TilerError>;
