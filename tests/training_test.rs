//! Training pipeline tests: dataset loading, model selection and artifact round trips.

use imu_daq::classifier::training::train_and_save;
use imu_daq::classifier::{Classifier, Dataset, Model, TrainingPipeline};
use imu_daq::config::TrainingConfig;
use imu_daq::core::{Reading, Segment};
use imu_daq::data::features::{FeatureExtractor, TimestampUnit};
use imu_daq::data::segment::SegmentRecorder;
use imu_daq::data::storage::{read_labeled_rows, write_feature_table, CsvStorage, SessionStorage};
use imu_daq::DaqError;
use tempfile::tempdir;
use tracing_test::traced_test;

/// A 1 s repetition at 50 Hz whose swing is `amplitude` degrees.
fn repetition(rep_id: u64, label: &str, amplitude: f64) -> Segment {
    let readings = (0..50)
        .map(|i| {
            let t = i as f64 * 20.0;
            let phase = t / 1000.0 * std::f64::consts::TAU;
            Reading::new(
                "imu1",
                t,
                amplitude * phase.sin(),
                0.3 * amplitude * phase.cos(),
                0.1 * amplitude * (2.0 * phase).sin(),
            )
        })
        .collect();
    Segment::new(rep_id, label, readings)
}

/// Eight small and eight large swings, interleaved by rep_id.
fn two_class_segments() -> Vec<Segment> {
    (0..16)
        .map(|i| {
            let rep_id = i as u64 + 1;
            let jitter = (i / 2) as f64 * 0.5;
            if i % 2 == 0 {
                repetition(rep_id, "correcto", 10.0 + jitter)
            } else {
                repetition(rep_id, "incorrecto", 45.0 + jitter)
            }
        })
        .collect()
}

fn extractor() -> FeatureExtractor {
    FeatureExtractor::new(TimestampUnit::Milliseconds)
}

#[test]
#[traced_test]
fn test_pipeline_separates_two_classes() {
    let dataset = Dataset::from_segments(&two_class_segments(), &extractor()).unwrap();
    assert_eq!(dataset.classes(), vec!["correcto", "incorrecto"]);

    let dir = tempdir().unwrap();
    let model_path = dir.path().join("models").join("model.json");
    let pipeline = TrainingPipeline::from_config(&TrainingConfig::default());
    let report = train_and_save(&pipeline, &dataset, &model_path).unwrap();

    assert_eq!(report.train_size + report.test_size, 16);
    assert_eq!(report.test_size, 4);
    assert_eq!(report.candidates.len(), 3);
    for candidate in &report.candidates {
        assert_eq!(candidate.folds, 5);
        let total: usize = candidate.confusion.iter().flatten().sum();
        assert_eq!(total, report.test_size);
    }
    let best = report.best_candidate().unwrap();
    assert_eq!(best.accuracy, 1.0);
    assert!(logs_contain("Best model saved"));

    let loaded = Model::load(&model_path).unwrap();
    assert_eq!(loaded.classes(), best.model.classes());
    assert_eq!(loaded.algorithm_name, best.name);

    let small = extractor().extract(&repetition(99, "?", 11.0).readings).unwrap();
    let large = extractor().extract(&repetition(100, "?", 47.0).readings).unwrap();
    let small = loaded.predict(&small).unwrap();
    let large = loaded.predict(&large).unwrap();
    assert_eq!(small.label, "correcto");
    assert_eq!(large.label, "incorrecto");
    for prediction in [&small, &large] {
        assert!((prediction.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(prediction.probability >= 0.5);
    }
}

#[test]
fn test_same_seed_gives_same_report() {
    let dataset = Dataset::from_segments(&two_class_segments(), &extractor()).unwrap();
    let pipeline = TrainingPipeline::from_config(&TrainingConfig::default());
    let first = pipeline.run(&dataset).unwrap();
    let second = pipeline.run(&dataset).unwrap();
    for (a, b) in first.candidates.iter().zip(&second.candidates) {
        assert_eq!(a.accuracy, b.accuracy);
        assert_eq!(a.cv_mean, b.cv_mean);
        assert_eq!(a.confusion, b.confusion);
    }
}

#[test]
fn test_single_class_is_rejected() {
    let segments: Vec<Segment> = (1..=6).map(|i| repetition(i, "correcto", 10.0)).collect();
    let dataset = Dataset::from_segments(&segments, &extractor()).unwrap();
    let pipeline = TrainingPipeline::from_config(&TrainingConfig::default());
    assert!(matches!(pipeline.run(&dataset), Err(DaqError::Training(_))));
}

#[test]
fn test_labeled_csv_round_trip_into_dataset() {
    let dir = tempdir().unwrap();
    let storage = CsvStorage::new(dir.path().join("raw.csv"), dir.path().join("labeled.csv"));

    let segments = two_class_segments();
    let mut recorder = SegmentRecorder::new(1, storage.open_labeled().unwrap());
    for segment in &segments {
        recorder.persist(segment).unwrap();
    }
    drop(recorder);

    assert_eq!(storage.last_rep_id().unwrap(), Some(16));
    assert_eq!(read_labeled_rows(storage.labeled_path()).unwrap().len(), 16 * 50);

    let from_file = Dataset::from_labeled_csv(storage.labeled_path(), &extractor()).unwrap();
    let direct = Dataset::from_segments(&segments, &extractor()).unwrap();
    assert_eq!(from_file.len(), 16);
    for (a, b) in from_file.samples.iter().zip(&direct.samples) {
        assert_eq!(a.rep_id, b.rep_id);
        assert_eq!(a.label, b.label);
        for (x, y) in a.features.to_array().iter().zip(b.features.to_array()) {
            assert!((x - y).abs() < 1e-9 || (x.is_nan() && y.is_nan()));
        }
    }

    let table = dir.path().join("features.csv");
    let rows: Vec<_> = from_file
        .samples
        .into_iter()
        .map(|s| (s.rep_id, s.label, s.features))
        .collect();
    write_feature_table(&table, &rows).unwrap();
    let content = std::fs::read_to_string(&table).unwrap();
    let mut lines = content.lines();
    assert!(lines.next().unwrap().starts_with("rep_id,label,duration,yaw_mean"));
    assert_eq!(lines.count(), 16);
}

#[test]
fn test_load_rejects_foreign_json() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.json");
    std::fs::write(&path, "{\"weights\": [1, 2, 3]}").unwrap();
    assert!(Model::load(&path).is_err());
    assert!(matches!(
        Model::load(&dir.path().join("missing.json")),
        Err(DaqError::Model(_))
    ));
}
