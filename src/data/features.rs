//! Fixed-layout feature vectors summarizing one repetition.
//!
//! Features, in schema order:
//!
//! | name | meaning |
//! |------|---------|
//! | `duration` | last minus first timestamp, seconds |
//! | `<axis>_mean`, `<axis>_std`, `<axis>_range` | population statistics of the angle |
//! | `<axis>_vel_mean`, `<axis>_vel_max` | mean / max of `abs(dx/dt)` |
//! | `<axis>_num_peaks` | strict local maxima, plateaus counted once |
//! | `corr_yaw_pitch`, `corr_yaw_roll`, `corr_pitch_roll` | Pearson correlation, NaN if undefined |
//! | `energy_total` | sum over axes of the mean squared angle |
//!
//! for each axis in `yaw`, `pitch`, `roll`.

use crate::core::Reading;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Version of the feature layout. Bumped whenever [`FEATURE_NAMES`] changes.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Number of scalars in a [`FeatureVector`].
pub const FEATURE_COUNT: usize = 23;

/// Feature names in vector order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "duration",
    "yaw_mean",
    "yaw_std",
    "yaw_range",
    "yaw_vel_mean",
    "yaw_vel_max",
    "yaw_num_peaks",
    "pitch_mean",
    "pitch_std",
    "pitch_range",
    "pitch_vel_mean",
    "pitch_vel_max",
    "pitch_num_peaks",
    "roll_mean",
    "roll_std",
    "roll_range",
    "roll_vel_mean",
    "roll_vel_max",
    "roll_num_peaks",
    "corr_yaw_pitch",
    "corr_yaw_roll",
    "corr_pitch_roll",
    "energy_total",
];

/// Substitute for zero time steps when computing velocities.
const MIN_DT: f64 = 1e-6;

/// Unit of device timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    /// Milliseconds (reference firmware)
    #[default]
    Milliseconds,
    /// Seconds
    Seconds,
    /// Milliseconds if the segment spans more than 1000 units, seconds otherwise
    Auto,
}

/// Per-axis statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisFeatures {
    /// Mean angle
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    /// Max minus min
    pub range: f64,
    /// Mean absolute angular velocity (units per second)
    pub vel_mean: f64,
    /// Max absolute angular velocity
    pub vel_max: f64,
    /// Number of local maxima
    pub num_peaks: u32,
}

/// Summary of one repetition.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Segment duration in seconds
    pub duration: f64,
    /// Yaw statistics
    pub yaw: AxisFeatures,
    /// Pitch statistics
    pub pitch: AxisFeatures,
    /// Roll statistics
    pub roll: AxisFeatures,
    /// Pearson correlation of yaw and pitch
    pub corr_yaw_pitch: f64,
    /// Pearson correlation of yaw and roll
    pub corr_yaw_roll: f64,
    /// Pearson correlation of pitch and roll
    pub corr_pitch_roll: f64,
    /// Sum of per-axis mean squares
    pub energy_total: f64,
}

impl FeatureVector {
    /// Flattens the vector in [`FEATURE_NAMES`] order.
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        let mut out = [0.0; FEATURE_COUNT];
        out[0] = self.duration;
        for (i, axis) in [&self.yaw, &self.pitch, &self.roll].into_iter().enumerate() {
            let base = 1 + i * 6;
            out[base] = axis.mean;
            out[base + 1] = axis.std;
            out[base + 2] = axis.range;
            out[base + 3] = axis.vel_mean;
            out[base + 4] = axis.vel_max;
            out[base + 5] = f64::from(axis.num_peaks);
        }
        out[19] = self.corr_yaw_pitch;
        out[20] = self.corr_yaw_roll;
        out[21] = self.corr_pitch_roll;
        out[22] = self.energy_total;
        out
    }

    /// Value of the named feature.
    pub fn get(&self, name: &str) -> Option<f64> {
        let index = FEATURE_NAMES.iter().position(|n| *n == name)?;
        Some(self.to_array()[index])
    }
}

/// Computes [`FeatureVector`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor {
    unit: TimestampUnit,
}

impl FeatureExtractor {
    /// Creates an extractor for timestamps in `unit`.
    pub fn new(unit: TimestampUnit) -> Self {
        Self { unit }
    }

    /// Timestamp unit in use.
    pub fn unit(&self) -> TimestampUnit {
        self.unit
    }

    /// Summarizes `readings`, which must be sorted by timestamp.
    ///
    /// # Errors
    ///
    /// [`DaqError::EmptySegment`] when `readings` is empty.
    pub fn extract(&self, readings: &[Reading]) -> AppResult<FeatureVector> {
        let first = readings.first().ok_or(DaqError::EmptySegment)?;

        let t = self.normalize_time(first.timestamp, readings);
        let yaw: Vec<f64> = readings.iter().map(|r| r.yaw).collect();
        let pitch: Vec<f64> = readings.iter().map(|r| r.pitch).collect();
        let roll: Vec<f64> = readings.iter().map(|r| r.roll).collect();

        let duration = match (t.first(), t.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        };

        Ok(FeatureVector {
            duration,
            yaw: axis_features(&t, &yaw),
            pitch: axis_features(&t, &pitch),
            roll: axis_features(&t, &roll),
            corr_yaw_pitch: pearson(&yaw, &pitch),
            corr_yaw_roll: pearson(&yaw, &roll),
            corr_pitch_roll: pearson(&pitch, &roll),
            energy_total: mean_square(&yaw) + mean_square(&pitch) + mean_square(&roll),
        })
    }

    fn normalize_time(&self, origin: f64, readings: &[Reading]) -> Vec<f64> {
        let relative: Vec<f64> = readings.iter().map(|r| r.timestamp - origin).collect();
        let divisor = match self.unit {
            TimestampUnit::Milliseconds => 1000.0,
            TimestampUnit::Seconds => 1.0,
            TimestampUnit::Auto => {
                let max = relative.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if max > 1e3 {
                    1000.0
                } else {
                    1.0
                }
            }
        };
        relative.into_iter().map(|t| t / divisor).collect()
    }
}

fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

fn mean_square(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64
}

fn axis_features(t: &[f64], x: &[f64]) -> AxisFeatures {
    let m = mean(x);
    let variance = x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / x.len() as f64;
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = x.iter().copied().fold(f64::INFINITY, f64::min);

    let velocities: Vec<f64> = t
        .windows(2)
        .zip(x.windows(2))
        .map(|(tw, xw)| {
            let dt = tw[1] - tw[0];
            let dt = if dt == 0.0 { MIN_DT } else { dt };
            ((xw[1] - xw[0]) / dt).abs()
        })
        .collect();
    let (vel_mean, vel_max) = if velocities.is_empty() {
        (0.0, 0.0)
    } else {
        (
            mean(&velocities),
            velocities.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        )
    };

    AxisFeatures {
        mean: m,
        std: variance.sqrt(),
        range: max - min,
        vel_mean,
        vel_max,
        num_peaks: count_peaks(x),
    }
}

/// Counts samples (or flat runs) strictly greater than both neighbours.
fn count_peaks(x: &[f64]) -> u32 {
    let n = x.len();
    if n < 3 {
        return 0;
    }
    let last = n - 1;
    let mut peaks = 0;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks += 1;
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let (ma, mb) = (mean(a), mean(b));
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    if saa == 0.0 || sbb == 0.0 {
        return f64::NAN;
    }
    (sab / (saa.sqrt() * sbb.sqrt())).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(ts: f64, yaw: f64, pitch: f64, roll: f64) -> Reading {
        Reading::new("imu1", ts, yaw, pitch, roll)
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_reference_segment() {
        let readings = vec![
            r(0.0, 10.0, 0.0, 0.0),
            r(100.0, 12.0, 0.0, 0.0),
            r(200.0, 11.0, 0.0, 0.0),
        ];
        let f = FeatureExtractor::default().extract(&readings).unwrap();

        assert_close(f.duration, 0.2);
        assert_close(f.yaw.mean, 11.0);
        assert_close(f.yaw.range, 2.0);
        assert_close(f.yaw.std, (2.0f64 / 3.0).sqrt());
        assert_close(f.yaw.vel_mean, 15.0);
        assert_close(f.yaw.vel_max, 20.0);
        assert_eq!(f.yaw.num_peaks, 1);
        assert_eq!(f.pitch.num_peaks, 0);
        assert!(f.corr_yaw_pitch.is_nan());
        assert_close(f.energy_total, (100.0 + 144.0 + 121.0) / 3.0);
    }

    #[test]
    fn test_empty_segment_is_error() {
        let result = FeatureExtractor::default().extract(&[]);
        assert!(matches!(result, Err(DaqError::EmptySegment)));
    }

    #[test]
    fn test_single_reading() {
        let f = FeatureExtractor::default()
            .extract(&[r(500.0, 1.0, 2.0, 3.0)])
            .unwrap();
        assert_eq!(f.duration, 0.0);
        assert_eq!(f.yaw.vel_mean, 0.0);
        assert_eq!(f.yaw.vel_max, 0.0);
        assert_eq!(f.yaw.std, 0.0);
        assert!(f.corr_pitch_roll.is_nan());
    }

    #[test]
    fn test_zero_energy() {
        let readings: Vec<Reading> = (0..5).map(|i| r(i as f64 * 10.0, 0.0, 0.0, 0.0)).collect();
        let f = FeatureExtractor::default().extract(&readings).unwrap();
        assert_eq!(f.energy_total, 0.0);
    }

    #[test]
    fn test_zero_dt_uses_epsilon() {
        let readings = vec![r(0.0, 0.0, 0.0, 0.0), r(0.0, 1.0, 0.0, 0.0)];
        let f = FeatureExtractor::new(TimestampUnit::Seconds)
            .extract(&readings)
            .unwrap();
        assert!(f.yaw.vel_max.is_finite());
        assert!((f.yaw.vel_max - 1e6).abs() < 1e-3);
    }

    #[test]
    fn test_correlation_perfect_and_inverse() {
        let readings: Vec<Reading> = (0..6)
            .map(|i| {
                let x = i as f64;
                r(x * 10.0, x, 2.0 * x + 1.0, -x)
            })
            .collect();
        let f = FeatureExtractor::default().extract(&readings).unwrap();
        assert_close(f.corr_yaw_pitch, 1.0);
        assert_close(f.corr_yaw_roll, -1.0);
    }

    #[test]
    fn test_plateau_peak_counts_once() {
        assert_eq!(count_peaks(&[0.0, 1.0, 1.0, 1.0, 0.0]), 1);
        assert_eq!(count_peaks(&[0.0, 1.0, 1.0, 2.0, 0.0]), 1);
        assert_eq!(count_peaks(&[0.0, 1.0, 1.0]), 0);
        assert_eq!(count_peaks(&[2.0, 1.0, 2.0]), 0);
        assert_eq!(count_peaks(&[0.0, 3.0, 0.0, 3.0, 0.0]), 2);
    }

    #[test]
    fn test_timestamp_units() {
        let readings = vec![r(0.0, 0.0, 0.0, 0.0), r(2.0, 0.0, 0.0, 0.0)];
        let ms = FeatureExtractor::new(TimestampUnit::Milliseconds)
            .extract(&readings)
            .unwrap();
        let s = FeatureExtractor::new(TimestampUnit::Seconds)
            .extract(&readings)
            .unwrap();
        let auto = FeatureExtractor::new(TimestampUnit::Auto)
            .extract(&readings)
            .unwrap();
        assert_close(ms.duration, 0.002);
        assert_close(s.duration, 2.0);
        assert_close(auto.duration, 2.0);

        let long = vec![r(0.0, 0.0, 0.0, 0.0), r(5000.0, 0.0, 0.0, 0.0)];
        let auto = FeatureExtractor::new(TimestampUnit::Auto)
            .extract(&long)
            .unwrap();
        assert_close(auto.duration, 5.0);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let readings: Vec<Reading> = (0..50)
            .map(|i| {
                let x = i as f64;
                r(x * 7.0, (x * 0.3).sin() * 20.0, x.cos(), x * 0.1)
            })
            .collect();
        let extractor = FeatureExtractor::default();
        let a = extractor.extract(&readings).unwrap().to_array();
        let b = extractor.extract(&readings).unwrap().to_array();
        assert_eq!(a.map(f64::to_bits), b.map(f64::to_bits));
    }

    #[test]
    fn test_array_matches_names() {
        let f = FeatureVector {
            duration: 1.0,
            pitch: AxisFeatures {
                num_peaks: 4,
                ..AxisFeatures::default()
            },
            energy_total: 9.0,
            ..FeatureVector::default()
        };
        assert_eq!(f.get("duration"), Some(1.0));
        assert_eq!(f.get("pitch_num_peaks"), Some(4.0));
        assert_eq!(f.get("energy_total"), Some(9.0));
        assert_eq!(f.get("nope"), None);
    }
}
