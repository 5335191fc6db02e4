//! Error kinds surfaced by every stage of the squash pipeline.

use std::path::Path;
use thiserror::Error;

/// The result of an imgsquash operation.
pub type SquashResult<T> = Result<T, SquashError>;

#[derive(Debug, Error)]
pub enum SquashError {
    /// The archive is malformed, or its history cannot be squashed unambiguously.
    #[error("format error: {0}")]
    Format(String),

    /// A requested layer id or squash start does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A filesystem operation failed while extracting, merging or packing.
    #[error("io error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A user supplied value was rejected before any work started.
    #[error("validation error: {0}")]
    Validation(String),

    /// A termination signal stopped the run before it completed.
    #[error("interrupted by signal {0}")]
    Interrupted(i32),
}

impl SquashError {
    pub fn format(msg: impl Into<String>) -> Self {
        SquashError::Format(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SquashError::NotFound(msg.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SquashError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for SquashError {
    fn from(e: serde_json::Error) -> Self {
        SquashError::Format(format!("invalid json: {e}"))
    }
}

impl From<walkdir::Error> for SquashError {
    fn from(e: walkdir::Error) -> Self {
        let context = match e.path() {
            Some(path) => format!("Failed to walk {}", path.display()),
            None => "Failed to walk directory".to_string(),
        };
        SquashError::io(context, e.into())
    }
}

/// Attaches a description to a raw I/O result, in the spirit of `anyhow::Context`.
pub(crate) trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: C) -> SquashResult<T>;

    fn with_path(self, what: &str, path: &Path) -> SquashResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C: Into<String>>(self, context: C) -> SquashResult<T> {
        self.map_err(|e| SquashError::io(context, e))
    }

    fn with_path(self, what: &str, path: &Path) -> SquashResult<T> {
        self.map_err(|e| SquashError::io(format!("{what} {}", path.display()), e))
    }
}
