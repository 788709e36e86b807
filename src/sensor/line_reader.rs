//! Per-sensor line reader.
//!
//! Each [`LineReader`] owns one device link and a blocking read thread that turns the
//! byte stream into [`Reading`]s:
//!
//! ```text
//! ByteSource --bytes--> LineDecoder --lines--> parse_line --Reading--> mpsc --> drain()
//! ```
//!
//! The wire format is one `timestamp,yaw,pitch,roll` record per `\n`-terminated line.
//! Lines that do not parse are dropped without notice. A transport error, or a read
//! thread that dies without one, is reported once as a [`SensorFault`].

use crate::adapters::{ByteSource, PortOpener};
use crate::config::SensorConfig;
use crate::core::Reading;
use crate::error::AppResult;
use crate::messages::SensorFault;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 1024;

/// Timing and buffering options for a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderOptions {
    /// Delay after opening before the input buffer is cleared
    pub settle: Duration,
    /// Complete lines dropped right after opening
    pub discard_lines: usize,
    /// Pause when the device has no pending bytes
    pub idle_backoff: Duration,
    /// Capacity of the reading channel
    pub channel_capacity: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(2000),
            discard_lines: 10,
            idle_backoff: Duration::from_millis(1),
            channel_capacity: 4096,
        }
    }
}

/// Splits a byte stream into text lines.
///
/// Bytes after the last newline are kept until the rest of the line arrives. Invalid
/// UTF-8 is dropped from the decoded text.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete line without its terminator, if any.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line[..end]);
        Some(text.chars().filter(|&c| c != char::REPLACEMENT_CHARACTER).collect())
    }

    /// Number of buffered bytes that do not form a complete line yet.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Parses one `timestamp,yaw,pitch,roll` line.
///
/// Returns `None` unless the line has exactly four finite numeric fields.
pub fn parse_line(sensor_id: &str, line: &str) -> Option<Reading> {
    let mut values = [0.0f64; 4];
    let mut fields = line.trim().split(',');
    for slot in values.iter_mut() {
        let value: f64 = fields.next()?.trim().parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        *slot = value;
    }
    if fields.next().is_some() {
        return None;
    }
    let [timestamp, yaw, pitch, roll] = values;
    Some(Reading::new(sensor_id, timestamp, yaw, pitch, roll))
}

enum ReaderItem {
    Reading(Reading),
    Fault(String),
}

/// A running reader for one sensor.
///
/// Device I/O runs on a blocking thread; readings reach [`LineReader::drain`] through a
/// bounded channel.
pub struct LineReader {
    sensor_id: String,
    port: String,
    rx: mpsc::Receiver<ReaderItem>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    fault: Option<SensorFault>,
    ended: bool,
    crash_reported: bool,
}

impl LineReader {
    /// Opens the sensor's port and starts the read thread.
    ///
    /// Waits `options.settle`, clears the device input buffer, and drops the first
    /// `options.discard_lines` complete lines.
    pub async fn open(
        sensor: &SensorConfig,
        opener: Arc<dyn PortOpener>,
        options: ReaderOptions,
    ) -> AppResult<Self> {
        let port = sensor.port.clone();
        let baud_rate = sensor.baud_rate;
        let mut source =
            tokio::task::spawn_blocking(move || opener.open(&port, baud_rate)).await??;

        if !options.settle.is_zero() {
            tokio::time::sleep(options.settle).await;
        }
        let (source, cleared) = tokio::task::spawn_blocking(move || {
            let cleared = source.discard_input();
            (source, cleared)
        })
        .await?;
        if let Err(e) = cleared {
            warn!(sensor_id = %sensor.id, error = %e, "Failed to clear input buffer");
        }

        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sensor_id = sensor.id.clone();
        let task = tokio::task::spawn_blocking(move || {
            read_loop(sensor_id, source, options, tx, shutdown_rx)
        });

        info!(sensor_id = %sensor.id, port = %sensor.port, "Sensor reader started");
        Ok(Self {
            sensor_id: sensor.id.clone(),
            port: sensor.port.clone(),
            rx,
            shutdown_tx,
            task: Some(task),
            fault: None,
            ended: false,
            crash_reported: false,
        })
    }

    /// Sensor identifier.
    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    /// Port the sensor is attached to.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Returns every reading received since the previous call without waiting.
    ///
    /// A read thread that stops without reporting a transport error (a panicking
    /// driver) is turned into a fault here.
    pub fn drain(&mut self) -> Vec<Reading> {
        let mut readings = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(ReaderItem::Reading(reading)) => readings.push(reading),
                Ok(ReaderItem::Fault(message)) => {
                    self.ended = true;
                    self.fault = Some(SensorFault {
                        sensor_id: self.sensor_id.clone(),
                        message,
                    });
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.ended {
                        self.ended = true;
                        self.crash_reported = true;
                        error!(sensor_id = %self.sensor_id, "Sensor read thread terminated unexpectedly");
                        self.fault = Some(SensorFault {
                            sensor_id: self.sensor_id.clone(),
                            message: "read thread terminated unexpectedly".to_string(),
                        });
                    }
                    break;
                }
            }
        }
        readings
    }

    /// Takes the transport fault, if one occurred and was not taken yet.
    pub fn take_fault(&mut self) -> Option<SensorFault> {
        self.fault.take()
    }

    /// Returns true while the read thread has not finished.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the read thread and releases the device. Idempotent.
    ///
    /// A crash already surfaced through [`LineReader::take_fault`] is not returned again.
    pub async fn close(&mut self) -> AppResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        self.ended = true;
        let _ = self.shutdown_tx.send(true);
        let result = task.await;
        debug!(sensor_id = %self.sensor_id, "Sensor reader closed");
        match result {
            Err(e) if self.crash_reported => {
                debug!(sensor_id = %self.sensor_id, error = %e, "Read thread failure already reported");
                Ok(())
            }
            result => result.map_err(Into::into),
        }
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        // Blocking threads cannot be aborted; they exit on the signal or a closed channel.
        let _ = self.shutdown_tx.send(true);
    }
}

fn stop_requested(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err()
}

/// Hands `item` to the consumer, waiting while the channel is full.
///
/// Returns false once the consumer is gone or a stop was requested.
fn deliver(
    tx: &mpsc::Sender<ReaderItem>,
    mut item: ReaderItem,
    shutdown_rx: &watch::Receiver<bool>,
    backoff: Duration,
) -> bool {
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(back)) => {
                if stop_requested(shutdown_rx) {
                    return false;
                }
                item = back;
                std::thread::sleep(backoff);
            }
        }
    }
}

fn read_loop(
    sensor_id: String,
    mut source: Box<dyn ByteSource>,
    options: ReaderOptions,
    tx: mpsc::Sender<ReaderItem>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut decoder = LineDecoder::new();
    let mut to_discard = options.discard_lines;
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if stop_requested(&shutdown_rx) {
            break;
        }

        let n = match source.read_available(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(sensor_id = %sensor_id, port = %source.name(), error = %e, "Sensor read failed");
                deliver(&tx, ReaderItem::Fault(e.to_string()), &shutdown_rx, options.idle_backoff);
                break;
            }
        };

        if n == 0 {
            std::thread::sleep(options.idle_backoff);
            continue;
        }

        decoder.push(&buf[..n]);
        while let Some(line) = decoder.next_line() {
            if to_discard > 0 {
                to_discard -= 1;
                continue;
            }
            let Some(reading) = parse_line(&sensor_id, &line) else {
                continue;
            };
            if !deliver(&tx, ReaderItem::Reading(reading), &shutdown_rx, options.idle_backoff) {
                return;
            }
        }
    }
    debug!(sensor_id = %sensor_id, "Read loop finished");
}
