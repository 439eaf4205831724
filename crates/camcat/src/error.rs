use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the footage pipeline.
///
/// Skips (nothing discovered, single-file merge, output already present) are not errors; they
/// are reported through [`crate::pipeline::RunOutcome`] and [`crate::pipeline::UnitOutcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required directory or setting is missing or malformed. Raised before any discovery.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The parameter template could not be parsed or rendered.
    #[error("invalid parameter template: {0}")]
    Template(String),

    /// Listing a directory failed.
    #[error("failed to read {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error outside discovery (for example writing a concat manifest).
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The encoder could not be launched or exited with a failure status.
    #[error("encoder failed for {input} -> {}: {message}", output.display())]
    Encoder {
        input: String,
        output: PathBuf,
        exit_code: Option<i32>,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}
