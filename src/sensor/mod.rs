//! Sensor acquisition: per-port line readers and their aggregation.

pub mod aggregator;
pub mod line_reader;

pub use aggregator::SensorAggregator;
pub use line_reader::{parse_line, LineDecoder, LineReader, ReaderOptions};
