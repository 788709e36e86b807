//! Acquisition controller.
//!
//! The controller owns one recording session at a time:
//!
//! ```text
//!   start_recording()                                   stop_recording()
//!         |                                                    |
//!         v                                                    v
//!   SensorAggregator::open --> poll loop task ------------> join, close sensors,
//!   open raw/labeled sinks       | read_all()                 flush sinks
//!                                | raw sink (if enabled)
//!                                | recorder.append()  <---- start_segment / stop_segment
//!                                | DataReady events
//!                                v
//!                            sleep(poll_interval)
//! ```
//!
//! The segment recorder is shared between the poll loop and the segment entry points
//! through an async mutex. Events are emitted after the lock is released. A supervisor
//! task awaits the poll loop and reports it as soon as it dies.

use crate::adapters::PortOpener;
use crate::classifier::{Classifier, Prediction};
use crate::config::Settings;
use crate::core::{RawRow, Reading, Segment};
use crate::data::features::{FeatureExtractor, FeatureVector};
use crate::data::segment::{SegmentClose, SegmentRecorder};
use crate::data::storage::{RowSink, SessionStorage};
use crate::error::{AppResult, DaqError};
use crate::messages::{AcquisitionEvent, EventBus, FaultOrigin, FaultReport};
use crate::sensor::SensorAggregator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of closing a segment that held readings.
#[derive(Debug, Clone)]
pub struct SegmentReport {
    /// The closed segment, sorted by timestamp
    pub segment: Segment,
    /// Its feature vector
    pub features: FeatureVector,
    /// Classifier output, when a classifier is attached and succeeded
    pub prediction: Option<Prediction>,
}

/// Resources handed back by the poll loop when it ends.
struct PollLoopState {
    aggregator: SensorAggregator,
    raw_sink: Box<dyn RowSink<RawRow>>,
}

struct Session {
    recorder: Arc<Mutex<SegmentRecorder>>,
    shutdown_tx: watch::Sender<bool>,
    /// Supervisor of the poll loop; `None` when the loop died and was reported.
    task: JoinHandle<Option<PollLoopState>>,
}

/// Drives recordings, segments and per-segment classification.
pub struct AcquisitionController {
    settings: Arc<Settings>,
    opener: Arc<dyn PortOpener>,
    storage: Arc<dyn SessionStorage>,
    events: EventBus,
    raw_logging: Arc<AtomicBool>,
    extractor: FeatureExtractor,
    classifier: Option<Arc<dyn Classifier>>,
    next_rep_id: Option<u64>,
    session: Option<Session>,
}

impl AcquisitionController {
    /// Creates an idle controller.
    pub fn new(
        settings: Settings,
        opener: Arc<dyn PortOpener>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        let raw_logging = Arc::new(AtomicBool::new(settings.storage.raw_logging));
        let extractor = FeatureExtractor::new(settings.features.timestamp_unit);
        Self {
            settings: Arc::new(settings),
            opener,
            storage,
            events: EventBus::new(),
            raw_logging,
            extractor,
            classifier: None,
            next_rep_id: None,
            session: None,
        }
    }

    /// Starts rep_id numbering at `first_rep_id` instead of resuming from storage.
    pub fn with_first_rep_id(mut self, first_rep_id: u64) -> Self {
        self.next_rep_id = Some(first_rep_id.max(1));
        self
    }

    /// Classifies every completed segment with `classifier`.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Event bus for registering observers.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns true while a recording is running.
    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Returns true while a segment is open.
    pub async fn is_segment_active(&self) -> bool {
        match &self.session {
            Some(session) => session.recorder.lock().await.is_active(),
            None => false,
        }
    }

    /// Id the next segment will get, once known.
    pub async fn next_rep_id(&self) -> Option<u64> {
        match &self.session {
            Some(session) => Some(session.recorder.lock().await.next_rep_id()),
            None => self.next_rep_id,
        }
    }

    /// Enables or disables raw stream persistence. Takes effect on the next poll cycle.
    pub fn set_raw_logging(&self, enabled: bool) {
        self.raw_logging.store(enabled, Ordering::Relaxed);
        info!(enabled, "Raw logging toggled");
    }

    /// Whether raw stream persistence is enabled.
    pub fn raw_logging(&self) -> bool {
        self.raw_logging.load(Ordering::Relaxed)
    }

    /// Opens the sensors and sinks and starts the poll loop. No-op while recording.
    ///
    /// # Errors
    ///
    /// Fails if a sensor cannot be opened or a sink cannot be created; nothing is left
    /// open in that case.
    pub async fn start_recording(&mut self) -> AppResult<()> {
        if self.session.is_some() {
            debug!("Recording already running, start ignored");
            return Ok(());
        }

        let first_rep_id = match self.next_rep_id {
            Some(next) => next,
            None if self.settings.storage.resume_rep_ids => self
                .storage
                .last_rep_id()?
                .map_or(1, |last| last.saturating_add(1)),
            None => 1,
        };

        let mut aggregator = SensorAggregator::open(
            &self.settings.sensors,
            &self.opener,
            self.settings.reader_options(),
        )
        .await?;

        let sinks = self
            .storage
            .open_raw()
            .and_then(|raw| Ok((raw, self.storage.open_labeled()?)));
        let (raw_sink, labeled_sink) = match sinks {
            Ok(sinks) => sinks,
            Err(e) => {
                if let Err(close_err) = aggregator.close_all().await {
                    error!(error = %close_err, "Failed to close sensors after storage error");
                }
                return Err(e);
            }
        };

        let recorder = Arc::new(Mutex::new(SegmentRecorder::new(first_rep_id, labeled_sink)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll_loop = PollLoop {
            aggregator,
            raw_sink,
            recorder: recorder.clone(),
            events: self.events.clone(),
            raw_logging: self.raw_logging.clone(),
            interval: self.settings.poll_interval(),
        };
        let poll_task = tokio::spawn(poll_loop.run(shutdown_rx));
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            match poll_task.await {
                Ok(state) => Some(state),
                Err(join_err) => {
                    let message = task_failure(join_err);
                    error!(error = %message, "Poll loop terminated abnormally");
                    events.emit(&AcquisitionEvent::Error(FaultReport::new(
                        FaultOrigin::PollLoop,
                        message,
                    )));
                    None
                }
            }
        });

        self.next_rep_id = Some(first_rep_id);
        self.session = Some(Session {
            recorder,
            shutdown_tx,
            task,
        });

        info!(first_rep_id, "Recording started");
        self.events.emit(&AcquisitionEvent::RecordingStarted);
        Ok(())
    }

    /// Stops the poll loop and closes sensors and sinks. No-op when idle.
    ///
    /// An open segment is discarded. Cleanup continues past failures, which are returned
    /// together as [`DaqError::ShutdownFailed`].
    pub async fn stop_recording(&mut self) -> AppResult<()> {
        let Some(session) = self.session.take() else {
            debug!("No recording running, stop ignored");
            return Ok(());
        };

        let _ = session.shutdown_tx.send(true);
        let mut errors = Vec::new();

        match session.task.await {
            Ok(Some(mut state)) => {
                if let Err(e) = state.raw_sink.flush() {
                    error!(error = %e, "Failed to flush raw stream");
                    self.report(FaultOrigin::Storage, &e);
                    errors.push(e);
                }
                if let Err(e) = state.aggregator.close_all().await {
                    self.report(FaultOrigin::Shutdown, &e);
                    errors.push(e);
                }
            }
            Ok(None) => {
                errors.push(DaqError::Task("poll loop terminated abnormally".to_string()));
            }
            Err(join_err) => {
                let message = task_failure(join_err);
                error!(error = %message, "Poll loop supervisor terminated abnormally");
                let e = DaqError::Task(message);
                self.report(FaultOrigin::PollLoop, &e);
                errors.push(e);
            }
        }

        {
            let mut recorder = session.recorder.lock().await;
            if let Some(rep_id) = recorder.abandon() {
                warn!(rep_id, "Recording stopped with an open segment, segment discarded");
            }
            self.next_rep_id = Some(recorder.next_rep_id());
            if let Err(e) = recorder.flush() {
                error!(error = %e, "Failed to flush labeled segments");
                self.report(FaultOrigin::Storage, &e);
                errors.push(e);
            }
        }

        info!("Recording stopped");
        self.events.emit(&AcquisitionEvent::RecordingStopped);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Opens a labeled segment.
    ///
    /// Returns the allocated rep_id, or `None` when a segment is already open.
    ///
    /// # Errors
    ///
    /// [`DaqError::NotRecording`] without a running recording, [`DaqError::UnknownLabel`]
    /// when the label is not configured.
    pub async fn start_segment(&self, label: &str) -> AppResult<Option<u64>> {
        let session = self.session.as_ref().ok_or(DaqError::NotRecording)?;
        if !self.settings.accepts_label(label) {
            return Err(DaqError::UnknownLabel(label.to_string()));
        }

        let rep_id = session.recorder.lock().await.start(label);
        if let Some(rep_id) = rep_id {
            self.events.emit(&AcquisitionEvent::SegmentStarted {
                label: label.to_string(),
                rep_id,
            });
        }
        Ok(rep_id)
    }

    /// Closes the open segment, persists it, and classifies it when a classifier is
    /// attached.
    ///
    /// Returns `None` when no segment was open or the segment had no readings.
    ///
    /// # Errors
    ///
    /// A persistence failure is returned after the segment events were emitted; the
    /// segment is closed either way.
    pub async fn stop_segment(&self) -> AppResult<Option<SegmentReport>> {
        let Some(session) = self.session.as_ref() else {
            debug!("No recording running, segment stop ignored");
            return Ok(None);
        };

        let (close, persisted) = {
            let mut recorder = session.recorder.lock().await;
            let close = recorder.finish();
            let persisted = match &close {
                SegmentClose::Completed(segment) => recorder.persist(segment),
                SegmentClose::Idle | SegmentClose::Empty { .. } => Ok(()),
            };
            (close, persisted)
        };

        if let Some(rep_id) = close.rep_id() {
            self.events
                .emit(&AcquisitionEvent::SegmentStopped { rep_id });
        }
        if let Err(e) = &persisted {
            error!(rep_id = ?close.rep_id(), error = %e, "Failed to persist segment");
            self.events.emit(&AcquisitionEvent::Error(FaultReport::new(
                FaultOrigin::Storage,
                e.to_string(),
            )));
        }

        let SegmentClose::Completed(segment) = close else {
            persisted?;
            return Ok(None);
        };

        let features = self.extractor.extract(&segment.readings)?;
        let prediction = self.classify(segment.rep_id, &features);
        persisted?;

        Ok(Some(SegmentReport {
            segment,
            features,
            prediction,
        }))
    }

    fn report(&self, origin: FaultOrigin, error: &DaqError) {
        self.events
            .emit(&AcquisitionEvent::Error(FaultReport::new(origin, error.to_string())));
    }

    fn classify(&self, rep_id: u64, features: &FeatureVector) -> Option<Prediction> {
        let classifier = self.classifier.as_ref()?;
        match classifier.predict(features) {
            Ok(prediction) => {
                let label = self.settings.model.display_name(&prediction.label);
                info!(
                    rep_id,
                    label,
                    probability = prediction.probability,
                    "Repetition classified"
                );
                self.events.emit(&AcquisitionEvent::PredictionReady {
                    label: label.to_string(),
                    probability: prediction.probability,
                });
                Some(prediction)
            }
            Err(e) => {
                error!(rep_id, error = %e, "Classification failed");
                self.events.emit(&AcquisitionEvent::Error(FaultReport::new(
                    FaultOrigin::Classifier,
                    e.to_string(),
                )));
                None
            }
        }
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.shutdown_tx.send(true);
        }
    }
}

/// Describes a failed task, using the panic payload when there is one.
fn task_failure(join_err: tokio::task::JoinError) -> String {
    if !join_err.is_panic() {
        return join_err.to_string();
    }
    let payload = join_err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

struct PollLoop {
    aggregator: SensorAggregator,
    raw_sink: Box<dyn RowSink<RawRow>>,
    recorder: Arc<Mutex<SegmentRecorder>>,
    events: EventBus,
    raw_logging: Arc<AtomicBool>,
    interval: Duration,
}

impl PollLoop {
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> PollLoopState {
        let mut raw_error_reported = false;

        loop {
            if *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err() {
                break;
            }

            let readings = self.aggregator.read_all();
            for fault in self.aggregator.take_faults() {
                warn!(sensor_id = %fault.sensor_id, error = %fault.message, "Sensor stopped delivering data");
                self.events.emit(&AcquisitionEvent::Error(fault.into()));
            }

            if !readings.is_empty() {
                if self.raw_logging.load(Ordering::Relaxed) {
                    if let Err(e) = self.write_raw(&readings) {
                        if !raw_error_reported {
                            raw_error_reported = true;
                            error!(error = %e, "Raw stream write failed");
                            self.events.emit(&AcquisitionEvent::Error(FaultReport::new(
                                FaultOrigin::Storage,
                                e.to_string(),
                            )));
                        }
                    }
                }

                {
                    let mut recorder = self.recorder.lock().await;
                    for reading in &readings {
                        recorder.append(reading);
                    }
                }

                for reading in readings {
                    self.events.emit(&AcquisitionEvent::DataReady(reading));
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!("Poll loop finished");
        PollLoopState {
            aggregator: self.aggregator,
            raw_sink: self.raw_sink,
        }
    }

    fn write_raw(&mut self, readings: &[Reading]) -> AppResult<()> {
        for reading in readings {
            self.raw_sink.append(&RawRow::from(reading))?;
        }
        self.raw_sink.flush()
    }
}
