//! Labeled segment recording.
//!
//! ```text
//!   Idle --start(label)--> Active{rep_id, label, buffer}
//!   Active --append(r)--> Active (buffer += r)
//!   Active --finish--> Idle   => Completed(segment) | Empty{rep_id}
//!   Idle --finish--> Idle     => Idle
//! ```
//!
//! A rep_id is consumed by every successful `start`, including segments that end up
//! empty, so ids in the labeled table are unique but may have gaps.

use crate::core::{LabeledRow, Reading, Segment};
use crate::data::storage::RowSink;
use crate::error::AppResult;
use tracing::{debug, info};

/// Outcome of closing a segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentClose {
    /// No segment was open.
    Idle,
    /// The segment received no readings and was discarded.
    Empty {
        /// Id that had been allocated to the segment
        rep_id: u64,
    },
    /// The segment holds at least one reading, sorted by timestamp.
    Completed(Segment),
}

impl SegmentClose {
    /// Id of the closed segment, if one was open.
    pub fn rep_id(&self) -> Option<u64> {
        match self {
            SegmentClose::Idle => None,
            SegmentClose::Empty { rep_id } => Some(*rep_id),
            SegmentClose::Completed(segment) => Some(segment.rep_id),
        }
    }
}

struct ActiveSegment {
    rep_id: u64,
    label: String,
    readings: Vec<Reading>,
}

/// Buffers readings of the active segment and persists completed segments.
pub struct SegmentRecorder {
    next_rep_id: u64,
    active: Option<ActiveSegment>,
    labeled_sink: Box<dyn RowSink<LabeledRow>>,
}

impl SegmentRecorder {
    /// Creates an idle recorder whose first segment gets `first_rep_id` (at least 1).
    pub fn new(first_rep_id: u64, labeled_sink: Box<dyn RowSink<LabeledRow>>) -> Self {
        Self {
            next_rep_id: first_rep_id.max(1),
            active: None,
            labeled_sink,
        }
    }

    /// Opens a segment. Returns the allocated rep_id, or `None` if one is already open.
    pub fn start(&mut self, label: &str) -> Option<u64> {
        if self.active.is_some() {
            debug!(label, "Segment already active, start ignored");
            return None;
        }
        let rep_id = self.next_rep_id;
        self.next_rep_id += 1;
        self.active = Some(ActiveSegment {
            rep_id,
            label: label.to_string(),
            readings: Vec::new(),
        });
        info!(rep_id, label, "Segment started");
        Some(rep_id)
    }

    /// Buffers `reading` if a segment is open.
    pub fn append(&mut self, reading: &Reading) -> bool {
        match self.active.as_mut() {
            Some(active) => {
                active.readings.push(reading.clone());
                true
            }
            None => false,
        }
    }

    /// Returns true while a segment is open.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the open segment.
    pub fn active_rep_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.rep_id)
    }

    /// Label of the open segment.
    pub fn active_label(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.label.as_str())
    }

    /// Readings buffered in the open segment.
    pub fn buffered(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.readings.len())
    }

    /// Id the next started segment will get.
    pub fn next_rep_id(&self) -> u64 {
        self.next_rep_id
    }

    /// Closes the open segment without persisting it.
    pub fn finish(&mut self) -> SegmentClose {
        let Some(active) = self.active.take() else {
            return SegmentClose::Idle;
        };
        if active.readings.is_empty() {
            info!(rep_id = active.rep_id, "Segment stopped without readings, discarded");
            return SegmentClose::Empty {
                rep_id: active.rep_id,
            };
        }
        let segment = Segment::new(active.rep_id, active.label, active.readings);
        info!(
            rep_id = segment.rep_id,
            label = %segment.label,
            readings = segment.len(),
            "Segment stopped"
        );
        SegmentClose::Completed(segment)
    }

    /// Writes every reading of `segment` to the labeled table and flushes.
    pub fn persist(&mut self, segment: &Segment) -> AppResult<()> {
        for row in segment.labeled_rows() {
            self.labeled_sink.append(&row)?;
        }
        self.labeled_sink.flush()
    }

    /// Closes and persists the open segment.
    ///
    /// The segment is closed even when persisting fails.
    pub fn stop(&mut self) -> AppResult<Option<Segment>> {
        match self.finish() {
            SegmentClose::Completed(segment) => {
                self.persist(&segment)?;
                Ok(Some(segment))
            }
            SegmentClose::Idle | SegmentClose::Empty { .. } => Ok(None),
        }
    }

    /// Drops the open segment, if any, returning its id.
    pub fn abandon(&mut self) -> Option<u64> {
        self.active.take().map(|active| active.rep_id)
    }

    /// Flushes the labeled table.
    pub fn flush(&mut self) -> AppResult<()> {
        self.labeled_sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::MemorySink;
    use crate::error::DaqError;
    use std::sync::{Arc, Mutex};

    fn recorder(first: u64) -> (SegmentRecorder, Arc<Mutex<Vec<LabeledRow>>>) {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink::new(rows.clone());
        (SegmentRecorder::new(first, Box::new(sink)), rows)
    }

    fn reading(ts: f64) -> Reading {
        Reading::new("imu1", ts, ts, 0.0, 0.0)
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mut rec, _) = recorder(1);
        assert_eq!(rec.start("correcto"), Some(1));
        assert_eq!(rec.start("incorrecto"), None);
        assert_eq!(rec.active_label(), Some("correcto"));
        assert_eq!(rec.next_rep_id(), 2);
    }

    #[test]
    fn test_append_only_while_active() {
        let (mut rec, _) = recorder(1);
        assert!(!rec.append(&reading(0.0)));
        rec.start("x");
        assert!(rec.append(&reading(0.0)));
        assert_eq!(rec.buffered(), 1);
    }

    #[test]
    fn test_stop_persists_every_reading() {
        let (mut rec, rows) = recorder(4);
        rec.start("correcto");
        for ts in [30.0, 10.0, 20.0] {
            rec.append(&reading(ts));
        }
        let segment = rec.stop().unwrap().unwrap();
        assert_eq!(segment.rep_id, 4);

        let rows = rows.lock().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.rep_id == 4 && r.label == "correcto"));
        let stamps: Vec<f64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let (mut rec, rows) = recorder(1);
        assert_eq!(rec.finish(), SegmentClose::Idle);
        assert!(rec.stop().unwrap().is_none());
        assert!(rows.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_segment_consumes_id() {
        let (mut rec, rows) = recorder(1);
        rec.start("x");
        assert_eq!(rec.finish(), SegmentClose::Empty { rep_id: 1 });
        assert_eq!(rec.start("x"), Some(2));
        assert!(rows.lock().unwrap().is_empty());
    }

    #[test]
    fn test_first_rep_id_is_at_least_one() {
        let (mut rec, _) = recorder(0);
        assert_eq!(rec.start("x"), Some(1));
    }

    #[test]
    fn test_persist_failure_still_closes() {
        let mut rec = SegmentRecorder::new(1, Box::new(MemorySink::<LabeledRow>::failing()));
        rec.start("x");
        rec.append(&reading(1.0));
        assert!(matches!(rec.stop(), Err(DaqError::Storage(_))));
        assert!(!rec.is_active());
    }

    #[test]
    fn test_abandon() {
        let (mut rec, rows) = recorder(9);
        rec.start("x");
        rec.append(&reading(1.0));
        assert_eq!(rec.abandon(), Some(9));
        assert_eq!(rec.finish(), SegmentClose::Idle);
        assert!(rows.lock().unwrap().is_empty());
    }
}
