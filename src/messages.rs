//! Event types published by the acquisition controller.
//!
//! Observers are registered on an [`EventBus`] and invoked synchronously, in
//! registration order, on the task that produced the event. Front ends that need to
//! consume events elsewhere use [`EventBus::channel`] to get an unbounded receiver.

use crate::core::Reading;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::error;

/// Which part of the pipeline reported a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOrigin {
    /// A sensor link identified by its sensor id
    Sensor(String),
    /// Raw or labeled persistence
    Storage,
    /// The acquisition poll loop itself
    PollLoop,
    /// The attached classifier
    Classifier,
    /// Releasing sensors at the end of a recording
    Shutdown,
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultOrigin::Sensor(id) => write!(f, "sensor '{}'", id),
            FaultOrigin::Storage => write!(f, "storage"),
            FaultOrigin::PollLoop => write!(f, "poll loop"),
            FaultOrigin::Classifier => write!(f, "classifier"),
            FaultOrigin::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A non-fatal failure surfaced to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    /// Where the failure happened
    pub origin: FaultOrigin,
    /// Human readable description
    pub message: String,
}

impl FaultReport {
    /// Creates a report.
    pub fn new(origin: FaultOrigin, message: impl Into<String>) -> Self {
        Self {
            origin,
            message: message.into(),
        }
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.message)
    }
}

/// A sensor link that stopped delivering data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorFault {
    /// Sensor identifier
    pub sensor_id: String,
    /// Transport error message
    pub message: String,
}

impl From<SensorFault> for FaultReport {
    fn from(fault: SensorFault) -> Self {
        FaultReport::new(FaultOrigin::Sensor(fault.sensor_id), fault.message)
    }
}

/// Notifications emitted during acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// A reading was acquired
    DataReady(Reading),
    /// All sensors are open and the poll loop is running
    RecordingStarted,
    /// The poll loop has stopped and all sensors are closed
    RecordingStopped,
    /// A labeled segment opened
    SegmentStarted {
        /// Operator label
        label: String,
        /// Allocated repetition id
        rep_id: u64,
    },
    /// A labeled segment closed
    SegmentStopped {
        /// Repetition id of the closed segment
        rep_id: u64,
    },
    /// The attached classifier predicted a label for the closed segment
    PredictionReady {
        /// Display label of the predicted class
        label: String,
        /// Probability of the predicted class
        probability: f64,
    },
    /// A non-fatal failure
    Error(FaultReport),
}

/// Receives acquisition events.
pub trait AcquisitionObserver: Send + Sync {
    /// Called once per event. Must not block.
    fn on_event(&self, event: &AcquisitionEvent);
}

impl<F> AcquisitionObserver for F
where
    F: Fn(&AcquisitionEvent) + Send + Sync,
{
    fn on_event(&self, event: &AcquisitionEvent) {
        self(event)
    }
}

/// Shared list of observers.
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Arc<RwLock<Vec<Arc<dyn AcquisitionObserver>>>>,
}

impl EventBus {
    /// Creates a bus without observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer.
    pub fn subscribe(&self, observer: Arc<dyn AcquisitionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Registers a forwarding observer and returns the receiving end.
    ///
    /// Events are dropped silently once the receiver is gone.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<AcquisitionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(move |event: &AcquisitionEvent| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    /// Delivers `event` to every observer in registration order.
    ///
    /// A panicking observer is logged and skipped; the emitting task keeps running.
    pub fn emit(&self, event: &AcquisitionEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event)));
            if delivered.is_err() {
                error!("Acquisition observer panicked, event dropped for it");
            }
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_observers_called_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |_: &AcquisitionEvent| {
                seen.lock().unwrap().push(tag);
            }));
        }
        bus.emit(&AcquisitionEvent::RecordingStarted);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_channel_forwards_events() {
        let bus = EventBus::new();
        let mut rx = bus.channel();
        bus.emit(&AcquisitionEvent::SegmentStopped { rep_id: 4 });
        assert_eq!(
            rx.try_recv().unwrap(),
            AcquisitionEvent::SegmentStopped { rep_id: 4 }
        );
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let bus = EventBus::new();
        drop(bus.channel());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        bus.subscribe(Arc::new(move |_: &AcquisitionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        bus.emit(&AcquisitionEvent::RecordingStopped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_observer_does_not_stop_delivery() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(|_: &AcquisitionEvent| panic!("observer bug")));
        let mut rx = bus.channel();
        bus.emit(&AcquisitionEvent::RecordingStarted);
        bus.emit(&AcquisitionEvent::RecordingStopped);
        assert_eq!(rx.try_recv().unwrap(), AcquisitionEvent::RecordingStarted);
        assert_eq!(rx.try_recv().unwrap(), AcquisitionEvent::RecordingStopped);
    }

    #[test]
    fn test_sensor_fault_report_display() {
        let report: FaultReport = SensorFault {
            sensor_id: "imu2".into(),
            message: "device disconnected".into(),
        }
        .into();
        assert_eq!(report.to_string(), "sensor 'imu2': device disconnected");
    }
}
