//! In-process sensor links for tests and `--simulate` runs.

use super::{ByteSource, PortOpener};
use crate::error::{AppResult, DaqError};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::TAU;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

type SourceFactory = Arc<dyn Fn() -> Box<dyn ByteSource> + Send + Sync>;

/// Port opener backed by registered factories.
///
/// Each `open` call builds a fresh source, so a restarted recording sees the device from
/// the beginning again. Unknown port names fail like a missing device.
#[derive(Clone, Default)]
pub struct MockPortOpener {
    factories: HashMap<String, SourceFactory>,
    opens: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockPortOpener {
    /// Creates an opener with no ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a port whose sources are built by `factory`.
    pub fn with_port<F>(mut self, port: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ByteSource> + Send + Sync + 'static,
    {
        self.factories.insert(port.into(), Arc::new(factory));
        self
    }

    /// Registers a port that emits `lines` once, one line per read, then stays silent.
    pub fn with_lines(self, port: impl Into<String>, lines: Vec<String>) -> Self {
        let port = port.into();
        let name = port.clone();
        self.with_port(port, move || {
            Box::new(ScriptedPort::from_lines(name.clone(), &lines)) as Box<dyn ByteSource>
        })
    }

    /// Registers a port backed by a [`SimulatedImu`].
    pub fn with_simulated(self, port: impl Into<String>, rate_hz: f64, limit: Option<usize>) -> Self {
        let port = port.into();
        let name = port.clone();
        self.with_port(port, move || {
            Box::new(SimulatedImu::new(name.clone(), rate_hz).with_limit(limit)) as Box<dyn ByteSource>
        })
    }

    /// Number of times `port` has been opened successfully.
    pub fn open_count(&self, port: &str) -> usize {
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .copied()
            .unwrap_or(0)
    }
}

impl PortOpener for MockPortOpener {
    fn open(&self, port: &str, _baud_rate: u32) -> AppResult<Box<dyn ByteSource>> {
        let factory = self.factories.get(port).ok_or_else(|| DaqError::Connection {
            port: port.to_string(),
            message: "no such device".to_string(),
        })?;
        *self
            .opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(port.to_string())
            .or_insert(0) += 1;
        Ok(factory())
    }
}

/// A source that replays fixed byte chunks, one chunk per read.
pub struct ScriptedPort {
    name: String,
    chunks: VecDeque<Vec<u8>>,
    fail_when_exhausted: bool,
}

impl ScriptedPort {
    /// Creates a source replaying `chunks` in order.
    pub fn new(name: impl Into<String>, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            chunks: chunks.into(),
            fail_when_exhausted: false,
        }
    }

    /// One newline-terminated chunk per line.
    pub fn from_lines(name: impl Into<String>, lines: &[String]) -> Self {
        let chunks = lines
            .iter()
            .map(|line| format!("{}\n", line).into_bytes())
            .collect();
        Self::new(name, chunks)
    }

    /// After the last chunk, reads fail as if the device was unplugged.
    pub fn fail_when_exhausted(mut self) -> Self {
        self.fail_when_exhausted = true;
        self
    }
}

impl ByteSource for ScriptedPort {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            if self.fail_when_exhausted {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device disconnected",
                ));
            }
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            self.chunks.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        // Scripted bytes model data sent after the reader attached, so nothing is dropped.
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A free-running IMU emitting `timestamp_ms,yaw,pitch,roll` lines at a fixed rate.
///
/// Angles follow slow sine waves so segments have non-trivial features.
pub struct SimulatedImu {
    name: String,
    period: Duration,
    started: Instant,
    emitted: usize,
    limit: Option<usize>,
    pending: Vec<u8>,
}

impl SimulatedImu {
    /// Creates a simulator producing `rate_hz` lines per second.
    pub fn new(name: impl Into<String>, rate_hz: f64) -> Self {
        let rate_hz = if rate_hz.is_finite() && rate_hz > 0.0 {
            rate_hz
        } else {
            100.0
        };
        Self {
            name: name.into(),
            period: Duration::from_secs_f64(1.0 / rate_hz),
            started: Instant::now(),
            emitted: 0,
            limit: None,
            pending: Vec::new(),
        }
    }

    /// Stops after `limit` lines.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    fn line(&self, index: usize) -> String {
        let t_ms = index as f64 * self.period.as_secs_f64() * 1000.0;
        let phase = t_ms / 1000.0 * TAU * 0.5;
        format!(
            "{:.0},{:.2},{:.2},{:.2}\n",
            t_ms,
            30.0 * phase.sin(),
            10.0 * (phase * 0.5).cos(),
            5.0 * (phase * 2.0).sin()
        )
    }
}

impl ByteSource for SimulatedImu {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut due = (elapsed / self.period.as_secs_f64()) as usize + 1;
        if let Some(limit) = self.limit {
            due = due.min(limit);
        }
        while self.emitted < due {
            let line = self.line(self.emitted);
            self.pending.extend_from_slice(line.as_bytes());
            self.emitted += 1;
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        // Lines due before the discard are dropped along with the buffered ones.
        self.started = Instant::now();
        self.emitted = 0;
        self.pending.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_port_splits_large_chunks() {
        let mut port = ScriptedPort::new("p", vec![b"abcdef".to_vec()]);
        let mut buf = [0u8; 4];
        assert_eq!(port.read_available(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(port.read_available(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(port.read_available(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_scripted_port_failure() {
        let mut port = ScriptedPort::new("p", vec![]).fail_when_exhausted();
        let mut buf = [0u8; 4];
        assert!(port.read_available(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_port_is_connection_error() {
        let opener = MockPortOpener::new();
        assert!(matches!(
            opener.open("COM1", 115_200),
            Err(DaqError::Connection { .. })
        ));
    }

    #[test]
    fn test_open_count() {
        let opener = MockPortOpener::new().with_lines("COM1", vec!["1,2,3,4".to_string()]);
        opener.open("COM1", 115_200).unwrap();
        opener.open("COM1", 115_200).unwrap();
        assert_eq!(opener.open_count("COM1"), 2);
        assert_eq!(opener.open_count("COM2"), 0);
    }

    #[test]
    fn test_simulated_imu_respects_limit() {
        let mut imu = SimulatedImu::new("sim", 1_000_000.0).with_limit(Some(3));
        std::thread::sleep(Duration::from_millis(5));
        let mut buf = [0u8; 4096];
        let n = imu.read_available(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("0,"));
    }

    #[test]
    fn test_simulated_imu_discard_drops_backlog() {
        let mut imu = SimulatedImu::new("sim", 1_000.0);
        std::thread::sleep(Duration::from_millis(100));
        imu.discard_input().unwrap();

        let mut buf = [0u8; 8192];
        let n = imu.read_available(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("0,"));
        assert!(text.lines().count() < 50);
    }
}
