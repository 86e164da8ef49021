//! Error types for the analysis driver.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

/// Various error types for the driver and its subsystems.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Internal IO error with the path that was touched.
    #[error(transparent)]
    Io(#[from] DriverIoError),
    /// Errors related to (de)serializing JSON documents.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Errors related to emitting YAML documents.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    SemVer(#[from] semver::Error),
    /// Invalid regular expression supplied in the configuration.
    #[error("invalid regex pattern: {0}")]
    Regex(#[from] regex::Error),
    /// The compilation database could not be used at all.
    #[error("the compilation database is empty")]
    EmptyCompilationDatabase,
    /// A compilation database entry without `command` or `arguments`.
    #[error("no valid 'command' or 'arguments' entry found in the compilation database")]
    MalformedDbEntry,
    /// Two actions collided under the configured deduplication policy.
    #[error("build action deduplication failed as both\n  {0}\nand\n  {1}\ncollide")]
    DuplicateAction(String, String),
    /// A fatal configuration problem detected before any task was run.
    #[error("configuration error: {0}")]
    Config(String),
    /// An analyzer subprocess could not even be spawned or waited for.
    #[error("analyzer {0} exited with {1}\n{2}")]
    AnalyzerFailure(String, std::process::ExitStatus, String),
    /// Reproducer archive packaging failed.
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error("{0}")]
    Message(String),
}

impl DriverError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        DriverIoError::new(err, path).into()
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        DriverError::Config(msg.to_string())
    }

    pub(crate) fn msg(msg: impl std::fmt::Display) -> Self {
        DriverError::Message(msg.to_string())
    }
}

/// An IO error that carries the path on which the operation failed.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct DriverIoError {
    io: io::Error,
    path: PathBuf,
}

impl DriverIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`.
    pub fn source(&self) -> &io::Error {
        &self.io
    }
}

impl From<DriverIoError> for io::Error {
    fn from(err: DriverIoError) -> Self {
        err.io
    }
}
