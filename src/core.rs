//! Core data types for the capture pipeline.
//!
//! These types flow through every stage of the system:
//!
//! ```text
//! LineReader --[Reading]--> SensorAggregator --> poll loop --+--> raw sink   [RawRow]
//!                                                            +--> recorder --[Segment]--> labeled sink [LabeledRow]
//!                                                                                     \--> FeatureExtractor
//! ```
//!
//! `Reading` is the unit of acquisition, `Segment` the unit of labeling, and the two row
//! types fix the column layout of the persisted CSV files.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single orientation sample reported by one sensor.
///
/// Timestamps are expressed in the device clock (milliseconds for the reference
/// firmware). They are monotonic per sensor but not synchronized across sensors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier of the sensor that produced the sample (e.g. "imu1").
    pub sensor_id: String,
    /// Device clock timestamp.
    pub timestamp: f64,
    /// Yaw in degrees.
    pub yaw: f64,
    /// Pitch in degrees.
    pub pitch: f64,
    /// Roll in degrees.
    pub roll: f64,
}

impl Reading {
    /// Creates a reading.
    pub fn new(sensor_id: impl Into<String>, timestamp: f64, yaw: f64, pitch: f64, roll: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            yaw,
            pitch,
            roll,
        }
    }

    /// Orders two readings by timestamp.
    pub fn cmp_timestamp(&self, other: &Self) -> Ordering {
        self.timestamp.total_cmp(&other.timestamp)
    }
}

/// A labeled, operator-delimited span of readings representing one repetition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Session-scoped repetition id, assigned when the segment was started.
    pub rep_id: u64,
    /// Label chosen by the operator.
    pub label: String,
    /// Readings sorted by timestamp ascending.
    pub readings: Vec<Reading>,
}

impl Segment {
    /// Builds a finalized segment, sorting the readings by timestamp.
    ///
    /// The sort is stable, so readings with equal timestamps keep their arrival order.
    pub fn new(rep_id: u64, label: impl Into<String>, mut readings: Vec<Reading>) -> Self {
        readings.sort_by(Reading::cmp_timestamp);
        Self {
            rep_id,
            label: label.into(),
            readings,
        }
    }

    /// Number of readings in the segment.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Returns true if the segment holds no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Labeled persistence rows for this segment, in reading order.
    pub fn labeled_rows(&self) -> impl Iterator<Item = LabeledRow> + '_ {
        self.readings
            .iter()
            .map(move |reading| LabeledRow::new(self.rep_id, &self.label, reading))
    }
}

/// One row of the raw stream file: `timestamp,sensor_id,yaw,pitch,roll`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    /// Device clock timestamp.
    pub timestamp: f64,
    /// Sensor identifier.
    pub sensor_id: String,
    /// Yaw in degrees.
    pub yaw: f64,
    /// Pitch in degrees.
    pub pitch: f64,
    /// Roll in degrees.
    pub roll: f64,
}

impl From<&Reading> for RawRow {
    fn from(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp,
            sensor_id: reading.sensor_id.clone(),
            yaw: reading.yaw,
            pitch: reading.pitch,
            roll: reading.roll,
        }
    }
}

/// One row of the labeled segments file: `rep_id,timestamp,sensor_id,yaw,pitch,roll,label`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabeledRow {
    /// Repetition the row belongs to.
    pub rep_id: u64,
    /// Device clock timestamp.
    pub timestamp: f64,
    /// Sensor identifier. Missing in single-sensor recordings.
    #[serde(default)]
    pub sensor_id: String,
    /// Yaw in degrees.
    pub yaw: f64,
    /// Pitch in degrees.
    pub pitch: f64,
    /// Roll in degrees.
    pub roll: f64,
    /// Repetition label. Older recordings used the column name `etiqueta`.
    #[serde(alias = "etiqueta")]
    pub label: String,
}

impl LabeledRow {
    /// Combines a reading with its segment's id and label.
    pub fn new(rep_id: u64, label: &str, reading: &Reading) -> Self {
        Self {
            rep_id,
            timestamp: reading.timestamp,
            sensor_id: reading.sensor_id.clone(),
            yaw: reading.yaw,
            pitch: reading.pitch,
            roll: reading.roll,
            label: label.to_string(),
        }
    }

    /// The reading carried by this row.
    pub fn reading(&self) -> Reading {
        Reading::new(
            self.sensor_id.clone(),
            self.timestamp,
            self.yaw,
            self.pitch,
            self.roll,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_sorts_readings() {
        let segment = Segment::new(
            3,
            "correcto",
            vec![
                Reading::new("imu2", 20.0, 0.0, 0.0, 0.0),
                Reading::new("imu1", 10.0, 1.0, 0.0, 0.0),
                Reading::new("imu1", 30.0, 2.0, 0.0, 0.0),
            ],
        );
        let stamps: Vec<f64> = segment.readings.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_sort_is_stable_for_equal_timestamps() {
        let segment = Segment::new(
            1,
            "x",
            vec![
                Reading::new("imu1", 5.0, 1.0, 0.0, 0.0),
                Reading::new("imu2", 5.0, 2.0, 0.0, 0.0),
            ],
        );
        assert_eq!(segment.readings[0].sensor_id, "imu1");
        assert_eq!(segment.readings[1].sensor_id, "imu2");
    }

    #[test]
    fn test_labeled_rows_carry_segment_identity() {
        let segment = Segment::new(7, "incorrecto", vec![Reading::new("imu1", 1.0, 2.0, 3.0, 4.0)]);
        let rows: Vec<LabeledRow> = segment.labeled_rows().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rep_id, 7);
        assert_eq!(rows[0].label, "incorrecto");
        assert_eq!(rows[0].reading(), segment.readings[0]);
    }
}
