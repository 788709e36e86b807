//! Core library for the imu_daq application.
//!
//! Captures orientation data from one or more serial IMUs, lets an operator delimit and
//! label exercise repetitions, persists raw and labeled data as CSV, and turns each
//! repetition into a fixed feature vector for training and live classification.
//!
//! The main entry point is [`acquisition::AcquisitionController`]; the offline side
//! lives in [`classifier`].

pub mod acquisition;
pub mod adapters;
pub mod classifier;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod logging;
pub mod messages;
pub mod sensor;

pub use acquisition::{AcquisitionController, SegmentReport};
pub use error::{AppResult, DaqError};
