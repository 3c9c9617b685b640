use std::path::PathBuf;
use thiserror::Error;

pub type MountResult<T> = Result<T, MountError>;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran but exited non-zero. `output` is stdout and stderr combined.
    #[error("{program} failed ({status}): {output}")]
    CommandFailed { program: String, status: String, output: String },

    #[error("unrecognized signature on {device}: {output}")]
    Unrecognized { device: PathBuf, output: String },

    #[error("failed to read mount table {path}: {source}")]
    MountTable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
