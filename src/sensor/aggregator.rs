//! Fan-in of several line readers.

use super::line_reader::{LineReader, ReaderOptions};
use crate::adapters::PortOpener;
use crate::config::SensorConfig;
use crate::core::Reading;
use crate::error::{AppResult, DaqError};
use crate::messages::SensorFault;
use std::sync::Arc;
use tracing::{error, info};

/// The set of open sensors of one recording, in configuration order.
pub struct SensorAggregator {
    readers: Vec<LineReader>,
}

impl SensorAggregator {
    /// Opens every enabled sensor in order.
    ///
    /// If any sensor fails to open, the ones already opened are closed before the error
    /// is returned.
    pub async fn open(
        sensors: &[SensorConfig],
        opener: &Arc<dyn PortOpener>,
        options: ReaderOptions,
    ) -> AppResult<Self> {
        let mut readers = Vec::with_capacity(sensors.len());
        for sensor in sensors.iter().filter(|s| s.enabled) {
            match LineReader::open(sensor, opener.clone(), options.clone()).await {
                Ok(reader) => readers.push(reader),
                Err(e) => {
                    error!(sensor_id = %sensor.id, port = %sensor.port, error = %e, "Failed to open sensor");
                    let mut partial = Self { readers };
                    if let Err(close_err) = partial.close_all().await {
                        error!(error = %close_err, "Failed to close partially opened sensors");
                    }
                    return Err(e);
                }
            }
        }
        info!(count = readers.len(), "Sensors opened");
        Ok(Self { readers })
    }

    /// Drains every reader in configuration order and concatenates the readings.
    pub fn read_all(&mut self) -> Vec<Reading> {
        let mut all = Vec::new();
        for reader in &mut self.readers {
            all.extend(reader.drain());
        }
        all
    }

    /// Transport faults observed since the previous call.
    pub fn take_faults(&mut self) -> Vec<SensorFault> {
        self.readers
            .iter_mut()
            .filter_map(LineReader::take_fault)
            .collect()
    }

    /// Sensor ids in configuration order.
    pub fn sensor_ids(&self) -> Vec<&str> {
        self.readers.iter().map(LineReader::sensor_id).collect()
    }

    /// Number of open readers.
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// Returns true if no sensor is open.
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Closes every reader, continuing past failures.
    pub async fn close_all(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        for reader in &mut self.readers {
            if let Err(e) = reader.close().await {
                error!(sensor_id = %reader.sensor_id(), error = %e, "Failed to close sensor");
                errors.push(e);
            }
        }
        self.readers.clear();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockPortOpener;
    use std::time::Duration;

    fn options() -> ReaderOptions {
        ReaderOptions {
            settle: Duration::ZERO,
            discard_lines: 0,
            idle_backoff: Duration::from_millis(1),
            channel_capacity: 64,
        }
    }

    fn shared(opener: &MockPortOpener) -> Arc<dyn PortOpener> {
        Arc::new(opener.clone())
    }

    fn lines(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{},0,0,0", i * 10)).collect()
    }

    #[tokio::test]
    async fn test_read_all_merges_sensors() {
        let opener = MockPortOpener::new()
            .with_lines("COM1", lines(3))
            .with_lines("COM2", lines(4));
        let sensors = vec![
            SensorConfig::new("imu1", "COM1", 115_200),
            SensorConfig::new("imu2", "COM2", 115_200),
        ];
        let mut aggregator = SensorAggregator::open(&sensors, &shared(&opener), options())
            .await
            .unwrap();
        assert_eq!(aggregator.sensor_ids(), vec!["imu1", "imu2"]);

        let mut readings = Vec::new();
        for _ in 0..500 {
            readings.extend(aggregator.read_all());
            if readings.len() >= 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(readings.len(), 7);
        assert_eq!(readings.iter().filter(|r| r.sensor_id == "imu2").count(), 4);
        assert!(aggregator.take_faults().is_empty());
        aggregator.close_all().await.unwrap();
        assert!(aggregator.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_sensors_are_skipped() {
        let opener = MockPortOpener::new().with_lines("COM1", lines(1));
        let mut disabled = SensorConfig::new("imu2", "COM2", 115_200);
        disabled.enabled = false;
        let sensors = vec![SensorConfig::new("imu1", "COM1", 115_200), disabled];
        let mut aggregator = SensorAggregator::open(&sensors, &shared(&opener), options())
            .await
            .unwrap();
        assert_eq!(aggregator.len(), 1);
        aggregator.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_closes_opened_readers() {
        let opener = MockPortOpener::new().with_lines("COM1", lines(1));
        let sensors = vec![
            SensorConfig::new("imu1", "COM1", 115_200),
            SensorConfig::new("imu2", "COM404", 115_200),
        ];
        let result = SensorAggregator::open(&sensors, &shared(&opener), options()).await;
        assert!(matches!(result, Err(DaqError::Connection { ref port, .. }) if port == "COM404"));
        assert_eq!(opener.open_count("COM1"), 1);
    }
}
