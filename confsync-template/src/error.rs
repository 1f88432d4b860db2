//! Error types for confsync-template.

use std::path::PathBuf;

use thiserror::Error;

use confsync_backends::BackendError;
use confsync_core::ConfigError;

/// All errors that can arise while processing one template resource.
///
/// Errors are resource-local: a failure here aborts the owning resource's
/// cycle only, never its siblings.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Malformed declaration or settings.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Backend fetch or watch failure.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Template parse or render failure.
    #[error("template error in {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: tera::Error,
    },

    /// Staging or filesystem failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The check command exited non-zero; the destination was left untouched.
    #[error("check command failed ({command}): exit {status}: {output}")]
    CheckFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// The reload command failed after the destination was already replaced.
    /// The on-disk file stays authoritative.
    #[error("reload command failed ({command}): exit {status}: {output}")]
    ReloadFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// Atomic apply failure other than the busy-mount fallback.
    #[error("failed to replace {dest}: {source}")]
    Replace {
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience constructor for [`ResourceError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ResourceError {
    ResourceError::Io {
        path: path.into(),
        source,
    }
}
