//! Configuration system using Figment.
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/imu_daq.toml` by default)
//! 3. Environment variables prefixed with `IMU_DAQ_`, using `__` for nesting
//!
//! ```text
//! IMU_DAQ_APPLICATION__LOG_LEVEL=debug
//! IMU_DAQ_STORAGE__RAW_LOGGING=false
//! IMU_DAQ_FEATURES__TIMESTAMP_UNIT=seconds
//! ```
//!
//! After extraction the settings are validated; semantic problems surface as
//! [`DaqError::Configuration`].
//!
//! # Example
//!
//! ```no_run
//! use imu_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/imu_daq.toml")?;
//! println!("{} sensor(s), labels {:?}", settings.sensors.len(), settings.labels);
//! # Ok::<(), imu_daq::error::DaqError>(())
//! ```

use crate::classifier::Algorithm;
use crate::data::features::TimestampUnit;
use crate::error::{AppResult, DaqError};
use crate::sensor::ReaderOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/imu_daq.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "IMU_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sensors to open when recording starts, in enumeration order
    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorConfig>,
    /// Labels an operator may assign to repetitions (empty = any label)
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Acquisition loop timing
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Feature extraction settings
    #[serde(default)]
    pub features: FeatureConfig,
    /// Model artifact settings
    #[serde(default)]
    pub model: ModelConfig,
    /// Training pipeline settings
    #[serde(default)]
    pub training: TrainingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line human readable output
    #[default]
    Pretty,
    /// Single-line human readable output
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// One inertial sensor attached over a serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Unique sensor identifier written into every reading (e.g. "imu1")
    pub id: String,
    /// Serial port (e.g. "/dev/ttyUSB0", "COM9")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Whether this sensor is opened when recording starts
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl SensorConfig {
    /// Creates an enabled sensor definition.
    pub fn new(id: impl Into<String>, port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            id: id.into(),
            port: port.into(),
            baud_rate,
            enabled: true,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the CSV files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// File name of the raw stream
    #[serde(default = "default_raw_file")]
    pub raw_file: String,
    /// File name of the labeled segments
    #[serde(default = "default_labeled_file")]
    pub labeled_file: String,
    /// Whether every reading is appended to the raw stream (runtime toggleable)
    #[serde(default = "default_enabled")]
    pub raw_logging: bool,
    /// Continue rep_id numbering after the largest id already in the labeled file
    #[serde(default = "default_enabled")]
    pub resume_rep_ids: bool,
}

/// Acquisition timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Pause between poll cycles of the aggregation loop
    #[serde(default = "default_one_ms")]
    pub poll_interval_ms: u64,
    /// Pause of a reader loop when the device has no pending bytes
    #[serde(default = "default_one_ms")]
    pub reader_idle_ms: u64,
    /// Delay after opening a port before its input buffer is cleared
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Number of initial lines discarded as boot noise
    #[serde(default = "default_discard_lines")]
    pub discard_lines: usize,
    /// Capacity of each reader's reading channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Feature extraction configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Unit of the device timestamps
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
}

/// Model artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Where the trained model is written and loaded from
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
    /// Display names for predicted class labels
    #[serde(default)]
    pub label_names: HashMap<String, String>,
}

impl ModelConfig {
    /// Display name for a predicted label, falling back to the label itself.
    pub fn display_name<'a>(&'a self, label: &'a str) -> &'a str {
        self.label_names.get(label).map_or(label, String::as_str)
    }
}

/// Training pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Fraction of repetitions held out for testing
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    /// Seed for splits and fold assignment
    #[serde(default = "default_random_state")]
    pub random_state: u64,
    /// Candidate algorithms, evaluated in order
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<NamedAlgorithm>,
}

/// A candidate algorithm with a display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedAlgorithm {
    /// Name used in reports
    pub name: String,
    /// Algorithm and hyper-parameters
    pub algorithm: Algorithm,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "imu_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM9".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

fn default_sensors() -> Vec<SensorConfig> {
    vec![SensorConfig::new("imu1", default_port(), default_baud_rate())]
}

fn default_labels() -> Vec<String> {
    vec!["correcto".to_string(), "incorrecto".to_string()]
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_enabled() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_raw_file() -> String {
    "datos_ejercicio_raw.csv".to_string()
}

fn default_labeled_file() -> String {
    "datos_ejercicio.csv".to_string()
}

fn default_one_ms() -> u64 {
    1
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_discard_lines() -> usize {
    10
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_model_path() -> PathBuf {
    PathBuf::from("./models/model.json")
}

fn default_test_size() -> f64 {
    0.3
}

fn default_random_state() -> u64 {
    42
}

fn default_algorithms() -> Vec<NamedAlgorithm> {
    vec![
        NamedAlgorithm {
            name: "KNN".to_string(),
            algorithm: Algorithm::Knn { k: 5 },
        },
        NamedAlgorithm {
            name: "GaussianNB".to_string(),
            algorithm: Algorithm::GaussianNb {
                var_smoothing: 1e-9,
            },
        },
        NamedAlgorithm {
            name: "DecisionTree".to_string(),
            algorithm: Algorithm::DecisionTree {
                max_depth: None,
                min_samples_split: 2,
            },
        },
    ]
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            raw_file: default_raw_file(),
            labeled_file: default_labeled_file(),
            raw_logging: true,
            resume_rep_ids: true,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_one_ms(),
            reader_idle_ms: default_one_ms(),
            settle_ms: default_settle_ms(),
            discard_lines: default_discard_lines(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            label_names: HashMap::new(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            test_size: default_test_size(),
            random_state: default_random_state(),
            algorithms: default_algorithms(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            sensors: default_sensors(),
            labels: default_labels(),
            storage: StorageConfig::default(),
            acquisition: AcquisitionConfig::default(),
            features: FeatureConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific TOML file plus `IMU_DAQ_` environment overrides.
    ///
    /// A missing file leaves the defaults in place. The result is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Sensor ids are unique and non-empty, ports non-empty, baud rates non-zero
    /// - Labels are unique and non-empty
    /// - Acquisition channel capacity is non-zero
    /// - Training test size lies in (0, 1) and every candidate algorithm is valid
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if sensor.id.trim().is_empty() {
                return Err(DaqError::Configuration(
                    "Sensor 'id' cannot be empty".to_string(),
                ));
            }
            if !ids.insert(sensor.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate sensor ID: '{}'",
                    sensor.id
                )));
            }
            if sensor.port.trim().is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Sensor '{}': 'port' cannot be empty",
                    sensor.id
                )));
            }
            if sensor.baud_rate == 0 {
                return Err(DaqError::Configuration(format!(
                    "Sensor '{}': 'baud_rate' must be > 0",
                    sensor.id
                )));
            }
        }

        let mut labels = HashSet::new();
        for label in &self.labels {
            if label.trim().is_empty() {
                return Err(DaqError::Configuration("Labels cannot be empty".to_string()));
            }
            if !labels.insert(label.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate label: '{}'",
                    label
                )));
            }
        }

        if self.acquisition.channel_capacity == 0 {
            return Err(DaqError::Configuration(
                "acquisition.channel_capacity must be > 0".to_string(),
            ));
        }

        if !(self.training.test_size > 0.0 && self.training.test_size < 1.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid training.test_size {}. Must be in (0, 1)",
                self.training.test_size
            )));
        }

        let mut names = HashSet::new();
        for candidate in &self.training.algorithms {
            if !names.insert(candidate.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate algorithm name: '{}'",
                    candidate.name
                )));
            }
            candidate.algorithm.validate().map_err(|msg| {
                DaqError::Configuration(format!("Algorithm '{}': {}", candidate.name, msg))
            })?;
        }

        Ok(())
    }

    /// Sensors opened when recording starts, in enumeration order.
    pub fn enabled_sensors(&self) -> Vec<SensorConfig> {
        self.sensors.iter().filter(|s| s.enabled).cloned().collect()
    }

    /// Returns true if `label` may be assigned to a repetition.
    pub fn accepts_label(&self, label: &str) -> bool {
        self.labels.is_empty() || self.labels.iter().any(|l| l == label)
    }

    /// Full path of the raw stream file.
    pub fn raw_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.raw_file)
    }

    /// Full path of the labeled segments file.
    pub fn labeled_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.labeled_file)
    }

    /// Pause between poll cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquisition.poll_interval_ms)
    }

    /// Line reader options derived from the acquisition section.
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            settle: Duration::from_millis(self.acquisition.settle_ms),
            discard_lines: self.acquisition.discard_lines,
            idle_backoff: Duration::from_millis(self.acquisition.reader_idle_ms),
            channel_capacity: self.acquisition.channel_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.sensors.len(), 1);
        assert_eq!(settings.sensors[0].baud_rate, 115_200);
        assert_eq!(settings.labels, vec!["correcto", "incorrecto"]);
        assert_eq!(settings.features.timestamp_unit, TimestampUnit::Milliseconds);
    }

    #[test]
    fn test_from_toml_str() {
        let settings = Settings::from_toml_str(
            r#"
            labels = ["good", "bad", "partial"]

            [[sensors]]
            id = "imu1"
            port = "/dev/ttyUSB0"

            [[sensors]]
            id = "imu2"
            port = "/dev/ttyUSB1"
            baud_rate = 57600
            enabled = false

            [storage]
            data_dir = "/tmp/capture"
            raw_logging = false

            [features]
            timestamp_unit = "auto"
            "#,
        )
        .expect("valid config");

        assert_eq!(settings.sensors.len(), 2);
        assert_eq!(settings.sensors[0].baud_rate, 115_200);
        assert_eq!(settings.enabled_sensors().len(), 1);
        assert_eq!(settings.labels.len(), 3);
        assert!(!settings.storage.raw_logging);
        assert_eq!(
            settings.raw_path(),
            PathBuf::from("/tmp/capture/datos_ejercicio_raw.csv")
        );
        assert_eq!(settings.features.timestamp_unit, TimestampUnit::Auto);
        assert_eq!(settings.training.algorithms.len(), 3);
    }

    #[test]
    fn test_algorithms_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [[training.algorithms]]
            name = "knn3"
            algorithm = { kind = "knn", k = 3 }

            [[training.algorithms]]
            name = "tree"
            algorithm = { kind = "decision_tree", max_depth = 4, min_samples_split = 2 }
            "#,
        )
        .expect("valid config");

        assert_eq!(settings.training.algorithms.len(), 2);
        assert_eq!(settings.training.algorithms[0].algorithm, Algorithm::Knn { k: 3 });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_sensor_ids() {
        let mut settings = Settings::default();
        settings.sensors = vec![
            SensorConfig::new("imu1", "COM9", 115_200),
            SensorConfig::new("imu1", "COM10", 115_200),
        ];
        let result = settings.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate sensor ID"));
    }

    #[test]
    fn test_empty_port_rejected() {
        let mut settings = Settings::default();
        settings.sensors = vec![SensorConfig::new("imu1", "", 115_200)];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_test_size() {
        let mut settings = Settings::default();
        settings.training.test_size = 1.0;
        let result = settings.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid training.test_size"));
    }

    #[test]
    fn test_invalid_algorithm() {
        let mut settings = Settings::default();
        settings.training.algorithms = vec![NamedAlgorithm {
            name: "knn0".to_string(),
            algorithm: Algorithm::Knn { k: 0 },
        }];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_label_acceptance() {
        let mut settings = Settings::default();
        assert!(settings.accepts_label("correcto"));
        assert!(!settings.accepts_label("jumping"));
        settings.labels.clear();
        assert!(settings.accepts_label("jumping"));
    }

    #[test]
    fn test_display_name_fallback() {
        let mut model = ModelConfig::default();
        model
            .label_names
            .insert("correcto".to_string(), "Correct form".to_string());
        assert_eq!(model.display_name("correcto"), "Correct form");
        assert_eq!(model.display_name("incorrecto"), "incorrecto");
    }
}
