//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur, from I/O and configuration issues to
//! sensor transport and model problems.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration sources.
//! - **`Configuration`**: Semantic errors in a configuration that parsed correctly
//!   (duplicate sensor ids, empty ports, out-of-range ratios). Raised by `Settings::validate`.
//! - **`Io`**: Wraps `std::io::Error`, covering file and device I/O.
//! - **`Connection`**: A sensor port could not be opened. Recoverable by starting a new
//!   recording once the device is available again.
//! - **`Storage`**: Failures writing or reading the CSV persistence files.
//! - **`NotRecording`** / **`UnknownLabel`**: Segment misuse reported to the caller.
//! - **`EmptySegment`**: Feature extraction was asked to summarize zero readings.
//! - **`Model`** / **`Training`**: Classifier artifacts that cannot be used, datasets that
//!   cannot be trained on.
//! - **`FeatureNotEnabled`**: Functionality (serial links, CSV storage) compiled out via
//!   feature flags.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types with the
//! `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration sources could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sensor port could not be opened.
    #[error("Failed to open sensor port '{port}': {message}")]
    Connection {
        /// Port name as configured (e.g. "/dev/ttyUSB0", "COM9").
        port: String,
        /// Driver error message.
        message: String,
    },

    /// CSV reader or writer failure.
    #[cfg(feature = "storage_csv")]
    #[error("CSV storage error: {0}")]
    Csv(#[from] csv::Error),

    /// Persistence failure that is not a CSV encoding problem.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON (de)serialization failure, e.g. for model artifacts.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A segment operation was requested while no recording is running.
    #[error("No recording in progress")]
    NotRecording,

    /// The requested label is not part of the configured label set.
    #[error("Unknown label '{0}'")]
    UnknownLabel(String),

    /// Feature extraction was requested for a segment without readings.
    #[error("Cannot extract features from an empty segment")]
    EmptySegment,

    /// The model artifact is unusable for the requested operation.
    #[error("Model error: {0}")]
    Model(String),

    /// The training dataset or training parameters are unusable.
    #[error("Training error: {0}")]
    Training(String),

    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(String),

    /// Functionality compiled out via feature flags.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Several failures occurred while stopping a recording.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<tokio::task::JoinError> for DaqError {
    fn from(err: tokio::task::JoinError) -> Self {
        DaqError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Connection {
            port: "COM9".to_string(),
            message: "access denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to open sensor port 'COM9': access denied"
        );
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Storage("raw flush".into()),
            DaqError::Task("poll loop panicked".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DaqError = io.into();
        assert!(matches!(err, DaqError::Io(_)));
    }
}
