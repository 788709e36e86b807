//! Data handling: segment recording, feature extraction and persistence.

pub mod features;
pub mod segment;
pub mod storage;

pub use features::{FeatureExtractor, FeatureVector, TimestampUnit, FEATURE_NAMES};
pub use segment::{SegmentClose, SegmentRecorder};
pub use storage::{CsvStorage, MemoryStorage, RowSink, SessionStorage};
