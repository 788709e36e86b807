//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when it is set, so a single run can be made
//! more verbose without touching the configuration file.

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber described by `app`.
///
/// Fails if a global subscriber is already installed.
pub fn init(app: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("imu_daq={0},{0}", app.log_level)))
        .map_err(|e| DaqError::Configuration(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match app.log_format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };

    result.map_err(|e| DaqError::Configuration(format!("Failed to install logger: {}", e)))
}
