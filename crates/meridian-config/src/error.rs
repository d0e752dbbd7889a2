//! Configuration error types.

use thiserror::Error;

/// Errors loading, parsing, validating, or watching the manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The manifest could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The manifest path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid YAML/JSON or does not match the schema.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// The manifest path.
        path: String,
        /// Parser diagnostic.
        message: String,
    },

    /// A value is out of range.
    #[error("invalid config value at {field}: {message}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The file watcher failed.
    #[error("config watcher error: {message}")]
    Watch {
        /// Watcher diagnostic.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
