//! Row persistence with clean feature flag handling.
//!
//! Capture sessions write two append-only tables: the raw stream and the labeled
//! segments. Both go through the [`RowSink`] trait so the acquisition code does not care
//! whether rows end up in CSV files or in memory.

use crate::config::Settings;
use crate::core::{LabeledRow, RawRow};
use crate::data::features::{FeatureVector, FEATURE_NAMES};
use crate::error::{AppResult, DaqError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Append-only destination for rows of one table.
pub trait RowSink<R>: Send {
    /// Appends one row. May buffer.
    fn append(&mut self, row: &R) -> AppResult<()>;

    /// Pushes buffered rows to the underlying storage.
    fn flush(&mut self) -> AppResult<()>;
}

/// Factory for the sinks of a capture session.
pub trait SessionStorage: Send + Sync {
    /// Opens the raw stream table.
    fn open_raw(&self) -> AppResult<Box<dyn RowSink<RawRow>>>;

    /// Opens the labeled segments table.
    fn open_labeled(&self) -> AppResult<Box<dyn RowSink<LabeledRow>>>;

    /// Largest rep_id already persisted in the labeled table.
    fn last_rep_id(&self) -> AppResult<Option<u64>> {
        Ok(None)
    }
}

// ============================================================================
// CSV Storage
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::fs::{File, OpenOptions};
    use std::marker::PhantomData;

    /// Appends serializable rows to a CSV file.
    ///
    /// The header row is written only when the file is new or empty.
    pub struct CsvSink<R> {
        path: PathBuf,
        writer: csv::Writer<File>,
        _row: PhantomData<fn(&R)>,
    }

    impl<R> CsvSink<R> {
        /// Opens `path` for appending, creating parent directories as needed.
        pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
            let path = path.into();
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let empty = file.metadata()?.len() == 0;
            let writer = csv::WriterBuilder::new()
                .has_headers(empty)
                .from_writer(file);
            tracing::debug!(path = %path.display(), new_file = empty, "CSV sink opened");
            Ok(Self {
                path,
                writer,
                _row: PhantomData,
            })
        }

        /// File being written.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl<R: Serialize> RowSink<R> for CsvSink<R> {
        fn append(&mut self, row: &R) -> AppResult<()> {
            self.writer.serialize(row)?;
            Ok(())
        }

        fn flush(&mut self) -> AppResult<()> {
            self.writer.flush()?;
            Ok(())
        }
    }

    /// CSV files under the configured data directory.
    #[derive(Debug, Clone)]
    pub struct CsvStorage {
        raw_path: PathBuf,
        labeled_path: PathBuf,
    }

    impl CsvStorage {
        /// Uses explicit file paths.
        pub fn new(raw_path: impl Into<PathBuf>, labeled_path: impl Into<PathBuf>) -> Self {
            Self {
                raw_path: raw_path.into(),
                labeled_path: labeled_path.into(),
            }
        }

        /// Uses the paths from the `storage` section.
        pub fn from_settings(settings: &Settings) -> Self {
            Self::new(settings.raw_path(), settings.labeled_path())
        }

        /// Raw stream file.
        pub fn raw_path(&self) -> &Path {
            &self.raw_path
        }

        /// Labeled segments file.
        pub fn labeled_path(&self) -> &Path {
            &self.labeled_path
        }
    }

    impl SessionStorage for CsvStorage {
        fn open_raw(&self) -> AppResult<Box<dyn RowSink<RawRow>>> {
            Ok(Box::new(CsvSink::<RawRow>::open(&self.raw_path)?))
        }

        fn open_labeled(&self) -> AppResult<Box<dyn RowSink<LabeledRow>>> {
            Ok(Box::new(CsvSink::<LabeledRow>::open(&self.labeled_path)?))
        }

        fn last_rep_id(&self) -> AppResult<Option<u64>> {
            #[derive(Deserialize)]
            struct RepOnly {
                rep_id: u64,
            }

            if !self.labeled_path.exists() {
                return Ok(None);
            }
            let mut reader = csv::Reader::from_path(&self.labeled_path)?;
            let mut last = None;
            for row in reader.deserialize::<RepOnly>() {
                let rep_id = row?.rep_id;
                last = Some(last.map_or(rep_id, |l: u64| l.max(rep_id)));
            }
            Ok(last)
        }
    }

    /// Reads every row of a labeled segments file.
    ///
    /// Files written before the `label` column was renamed (`etiqueta`) are accepted.
    pub fn read_labeled_rows(path: &Path) -> AppResult<Vec<LabeledRow>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize::<LabeledRow>() {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Writes one feature row per repetition: `rep_id,label,<feature names>`.
    pub fn write_feature_table(
        path: &Path,
        rows: &[(u64, String, FeatureVector)],
    ) -> AppResult<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["rep_id", "label"];
        header.extend_from_slice(&FEATURE_NAMES);
        writer.write_record(&header)?;
        for (rep_id, label, features) in rows {
            let mut record = vec![rep_id.to_string(), label.clone()];
            record.extend(features.to_array().iter().map(f64::to_string));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use std::marker::PhantomData;

    /// Placeholder when CSV support is compiled out.
    pub struct CsvSink<R>(PhantomData<fn(&R)>);

    impl<R> CsvSink<R> {
        /// Always fails with `FeatureNotEnabled`.
        pub fn open(_path: impl Into<PathBuf>) -> AppResult<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    /// Placeholder when CSV support is compiled out.
    #[derive(Debug, Clone)]
    pub struct CsvStorage;

    impl CsvStorage {
        /// Creates the placeholder.
        pub fn new(_raw_path: impl Into<PathBuf>, _labeled_path: impl Into<PathBuf>) -> Self {
            Self
        }

        /// Creates the placeholder.
        pub fn from_settings(_settings: &Settings) -> Self {
            Self
        }
    }

    impl SessionStorage for CsvStorage {
        fn open_raw(&self) -> AppResult<Box<dyn RowSink<RawRow>>> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        fn open_labeled(&self) -> AppResult<Box<dyn RowSink<LabeledRow>>> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    /// Always fails with `FeatureNotEnabled`.
    pub fn read_labeled_rows(_path: &Path) -> AppResult<Vec<LabeledRow>> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// Always fails with `FeatureNotEnabled`.
    pub fn write_feature_table(
        _path: &Path,
        _rows: &[(u64, String, FeatureVector)],
    ) -> AppResult<()> {
        let _ = FEATURE_NAMES;
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{read_labeled_rows, write_feature_table, CsvSink, CsvStorage};
#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{read_labeled_rows, write_feature_table, CsvSink, CsvStorage};

// ============================================================================
// In-memory Storage
// ============================================================================

/// Collects rows in a shared vector.
pub struct MemorySink<R> {
    rows: Arc<Mutex<Vec<R>>>,
    fail: bool,
}

impl<R> MemorySink<R> {
    /// Appends into `rows`.
    pub fn new(rows: Arc<Mutex<Vec<R>>>) -> Self {
        Self { rows, fail: false }
    }

    /// A sink whose appends always fail.
    pub fn failing() -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        }
    }
}

impl<R: Clone + Send> RowSink<R> for MemorySink<R> {
    fn append(&mut self, row: &R) -> AppResult<()> {
        if self.fail {
            return Err(DaqError::Storage("sink rejected write".to_string()));
        }
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row.clone());
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Keeps both tables in memory. Cloning shares the tables.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    raw: Arc<Mutex<Vec<RawRow>>>,
    labeled: Arc<Mutex<Vec<LabeledRow>>>,
    fail_raw: bool,
}

impl MemoryStorage {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw sinks opened from this storage reject every write.
    pub fn with_failing_raw(mut self) -> Self {
        self.fail_raw = true;
        self
    }

    /// Snapshot of the raw table.
    pub fn raw_rows(&self) -> Vec<RawRow> {
        self.raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the labeled table.
    pub fn labeled_rows(&self) -> Vec<LabeledRow> {
        self.labeled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SessionStorage for MemoryStorage {
    fn open_raw(&self) -> AppResult<Box<dyn RowSink<RawRow>>> {
        if self.fail_raw {
            return Ok(Box::new(MemorySink::<RawRow>::failing()));
        }
        Ok(Box::new(MemorySink::new(self.raw.clone())))
    }

    fn open_labeled(&self) -> AppResult<Box<dyn RowSink<LabeledRow>>> {
        Ok(Box::new(MemorySink::new(self.labeled.clone())))
    }

    fn last_rep_id(&self) -> AppResult<Option<u64>> {
        Ok(self
            .labeled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|row| row.rep_id)
            .max())
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::core::Reading;
    use tempfile::tempdir;

    #[test]
    fn test_csv_sink_writes_header_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("raw.csv");

        for ts in [1.0, 2.0] {
            let mut sink: CsvSink<RawRow> = CsvSink::open(&path).unwrap();
            sink.append(&RawRow::from(&Reading::new("imu1", ts, 0.5, 1.5, -2.0)))
                .unwrap();
            sink.flush().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,sensor_id,yaw,pitch,roll");
        assert!(lines[1].starts_with("1.0,imu1,"));
    }

    #[test]
    fn test_last_rep_id_reads_legacy_column_name() {
        let dir = tempdir().unwrap();
        let labeled = dir.path().join("labeled.csv");
        std::fs::write(
            &labeled,
            "rep_id,timestamp,sensor_id,yaw,pitch,roll,etiqueta\n\
             3,0,imu1,1,2,3,correcto\n\
             7,10,imu1,1,2,3,incorrecto\n\
             5,20,imu1,1,2,3,correcto\n",
        )
        .unwrap();

        let storage = CsvStorage::new(dir.path().join("raw.csv"), &labeled);
        assert_eq!(storage.last_rep_id().unwrap(), Some(7));

        let rows = read_labeled_rows(&labeled).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].label, "incorrecto");
    }

    #[test]
    fn test_last_rep_id_missing_file() {
        let dir = tempdir().unwrap();
        let storage = CsvStorage::new(dir.path().join("a.csv"), dir.path().join("b.csv"));
        assert_eq!(storage.last_rep_id().unwrap(), None);
    }

    #[test]
    fn test_labeled_rows_without_sensor_column() {
        let dir = tempdir().unwrap();
        let labeled = dir.path().join("labeled.csv");
        std::fs::write(
            &labeled,
            "rep_id,timestamp,yaw,pitch,roll,etiqueta\n1,0,1,2,3,correcto\n",
        )
        .unwrap();

        let rows = read_labeled_rows(&labeled).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sensor_id, "");
        assert_eq!(rows[0].label, "correcto");
    }

    #[test]
    fn test_memory_storage_shares_rows() {
        let storage = MemoryStorage::new();
        let mut sink = storage.open_labeled().unwrap();
        sink.append(&LabeledRow::new(2, "x", &Reading::new("imu1", 0.0, 0.0, 0.0, 0.0)))
            .unwrap();
        assert_eq!(storage.labeled_rows().len(), 1);
        assert_eq!(storage.last_rep_id().unwrap(), Some(2));
    }
}
