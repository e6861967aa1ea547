//! Error types for the grading core.
//!
//! Only configuration and infrastructure failures surface as [`Error`].
//! Anything verdict-shaped (compilation errors, limit breaches, judge
//! failures) is carried as an [`crate::outcome::Outcome`] value instead.

use std::path::PathBuf;

use thiserror::Error;

/// Grading core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad user input: missing source file, unknown path, malformed flags
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No language matched the source extension or explicit tag
    #[error("Unknown language for {0}")]
    UnknownLanguage(String),

    /// A command template referenced a marker outside the supported set
    #[error("Unknown template marker {marker:?} in command for language {language}")]
    UnknownMarker { language: String, marker: String },

    /// Configuration could not be loaded or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// A digest was requested that is not present in the store
    #[error("Digest {0} not found in store")]
    MissingDigest(String),

    /// Stored bytes no longer hash to their digest
    #[error("Integrity mismatch for {digest}: content hashes to {actual}")]
    Integrity { digest: String, actual: String },

    /// Dependency cache database error
    #[error("Dependency cache error: {0}")]
    Cache(#[from] sqlx::Error),

    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sandbox bookkeeping failure: lost child, fd exhaustion, /proc
    /// parsing gone wrong. Maps to an INTERNAL_ERROR verdict upstream.
    #[error("Sandbox internal error: {0}")]
    Sandbox(#[source] anyhow::Error),
}

impl Error {
    /// Attach a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True when this error should be reported as an INTERNAL_ERROR
    /// verdict rather than aborting the whole suite.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Sandbox(_) | Error::Integrity { .. } | Error::Io { .. }
        )
    }
}

/// Result type alias using the grading core error
pub type Result<T> = std::result::Result<T, Error>;

/// Extension for annotating `std::io::Result` values with the path that
/// produced them.
pub(crate) trait IoContext<T> {
    fn path_ctx(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn path_ctx(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
