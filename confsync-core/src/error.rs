//! Error types for confsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from settings and declaration handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load — includes file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A declaration without a source template is unusable.
    #[error("declaration {path} has an empty src")]
    EmptySrc { path: PathBuf },

    /// The declared file mode could not be parsed as an octal string.
    #[error("invalid file mode '{mode}' in {path}")]
    BadFileMode { path: PathBuf, mode: String },
}

/// Convenience constructor for [`ConfigError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
