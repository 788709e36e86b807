//! Model training and evaluation.
//!
//! ```text
//! labeled CSV --group by rep_id--> Segment --FeatureExtractor--> Sample
//!     --stratified split--> train / test
//!     --per algorithm: scaler + fit--> test accuracy, confusion matrix, k-fold CV
//!     --best test accuracy--> Model
//! ```

use super::model::Model;
use super::Classifier;
use crate::config::{NamedAlgorithm, TrainingConfig};
use crate::core::{Reading, Segment};
use crate::data::features::{FeatureExtractor, FeatureVector};
use crate::data::storage::read_labeled_rows;
use crate::error::{AppResult, DaqError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Maximum number of cross-validation folds.
const MAX_FOLDS: usize = 5;

/// One repetition prepared for training.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Repetition id
    pub rep_id: u64,
    /// Repetition label
    pub label: String,
    /// Extracted features
    pub features: FeatureVector,
}

/// Repetitions with features and labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    /// Samples in rep_id order
    pub samples: Vec<Sample>,
}

impl Dataset {
    /// Builds a dataset from finalized segments. Empty segments are skipped.
    pub fn from_segments(segments: &[Segment], extractor: &FeatureExtractor) -> AppResult<Self> {
        let mut samples = Vec::with_capacity(segments.len());
        for segment in segments.iter().filter(|s| !s.is_empty()) {
            samples.push(Sample {
                rep_id: segment.rep_id,
                label: segment.label.clone(),
                features: extractor.extract(&segment.readings)?,
            });
        }
        Ok(Self { samples })
    }

    /// Loads a labeled segments file and groups it into repetitions.
    ///
    /// Each repetition takes the label of its first row in file order.
    pub fn from_labeled_csv(path: &Path, extractor: &FeatureExtractor) -> AppResult<Self> {
        let segments = Self::segments_from_csv(path)?;
        let dataset = Self::from_segments(&segments, extractor)?;
        info!(
            path = %path.display(),
            repetitions = dataset.len(),
            "Labeled dataset loaded"
        );
        Ok(dataset)
    }

    /// Groups the rows of a labeled segments file by rep_id.
    pub fn segments_from_csv(path: &Path) -> AppResult<Vec<Segment>> {
        let rows = read_labeled_rows(path)?;
        let mut groups: BTreeMap<u64, (String, Vec<Reading>)> = BTreeMap::new();
        for row in rows {
            let reading = row.reading();
            groups
                .entry(row.rep_id)
                .or_insert_with(|| (row.label.clone(), Vec::new()))
                .1
                .push(reading);
        }
        Ok(groups
            .into_iter()
            .map(|(rep_id, (label, readings))| Segment::new(rep_id, label, readings))
            .collect())
    }

    /// Number of repetitions.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if there are no repetitions.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Distinct labels, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.samples.iter().map(|s| s.label.clone()).collect();
        classes.sort();
        classes.dedup();
        classes
    }

    /// Raw feature rows in sample order.
    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.samples
            .iter()
            .map(|s| s.features.to_array().to_vec())
            .collect()
    }
}

/// Evaluation of one candidate algorithm.
#[derive(Debug, Clone)]
pub struct CandidateReport {
    /// Candidate name
    pub name: String,
    /// Accuracy on the held-out test set
    pub accuracy: f64,
    /// Mean k-fold cross-validation accuracy over the whole dataset
    pub cv_mean: f64,
    /// Standard deviation of the fold accuracies
    pub cv_std: f64,
    /// Number of folds used
    pub folds: usize,
    /// `confusion[true][predicted]` counts on the test set, in class order
    pub confusion: Vec<Vec<usize>>,
    /// Model fitted on the training split
    pub model: Model,
}

/// Outcome of a training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// Class labels, in confusion matrix order
    pub classes: Vec<String>,
    /// Training split size
    pub train_size: usize,
    /// Test split size
    pub test_size: usize,
    /// Every candidate, in configuration order
    pub candidates: Vec<CandidateReport>,
    /// Index of the candidate with the best test accuracy (first on ties)
    pub best: usize,
}

impl TrainingReport {
    /// The best candidate.
    pub fn best_candidate(&self) -> Option<&CandidateReport> {
        self.candidates.get(self.best)
    }

    /// The best model.
    pub fn best_model(&self) -> Option<&Model> {
        self.best_candidate().map(|c| &c.model)
    }
}

/// Trains and compares the configured algorithms.
#[derive(Debug, Clone)]
pub struct TrainingPipeline {
    test_size: f64,
    random_state: u64,
    algorithms: Vec<NamedAlgorithm>,
}

impl TrainingPipeline {
    /// Creates a pipeline.
    pub fn new(test_size: f64, random_state: u64, algorithms: Vec<NamedAlgorithm>) -> Self {
        Self {
            test_size,
            random_state,
            algorithms,
        }
    }

    /// Creates a pipeline from the `training` section.
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.test_size,
            config.random_state,
            config.algorithms.clone(),
        )
    }

    /// Splits, fits and evaluates every candidate.
    ///
    /// # Errors
    ///
    /// [`DaqError::Training`] with fewer than two classes, a class with fewer than two
    /// repetitions, an invalid test size, or no candidate algorithms.
    pub fn run(&self, dataset: &Dataset) -> AppResult<TrainingReport> {
        if self.algorithms.is_empty() {
            return Err(DaqError::Training("no candidate algorithms".to_string()));
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(DaqError::Training(format!(
                "test_size {} must be in (0, 1)",
                self.test_size
            )));
        }

        let classes = dataset.classes();
        if classes.len() < 2 {
            return Err(DaqError::Training(format!(
                "need at least two classes, found {}",
                classes.len()
            )));
        }
        let y: Vec<usize> = dataset
            .samples
            .iter()
            .map(|s| classes.iter().position(|c| *c == s.label).unwrap_or(0))
            .collect();
        let per_class = class_members(&y, classes.len());
        if let Some((class, members)) = per_class.iter().enumerate().find(|(_, m)| m.len() < 2) {
            return Err(DaqError::Training(format!(
                "class '{}' has {} repetition(s), need at least 2",
                classes[class],
                members.len()
            )));
        }

        let rows = dataset.rows();
        let (train, test) = self.stratified_split(&per_class);
        let min_count = per_class.iter().map(Vec::len).min().unwrap_or(0);
        let folds = if min_count >= 2 { MAX_FOLDS.min(min_count) } else { 2 };

        info!(
            repetitions = dataset.len(),
            classes = ?classes,
            train = train.len(),
            test = test.len(),
            folds,
            "Training started"
        );

        let mut candidates = Vec::with_capacity(self.algorithms.len());
        for candidate in &self.algorithms {
            let model = Model::fit(
                &candidate.name,
                &candidate.algorithm,
                classes.clone(),
                &select(&rows, &train),
                &select(&y, &train),
            )?;
            let mut confusion = vec![vec![0usize; classes.len()]; classes.len()];
            let mut correct = 0;
            for &i in &test {
                let predicted = predict_index(&model, &rows[i]);
                confusion[y[i]][predicted] += 1;
                if predicted == y[i] {
                    correct += 1;
                }
            }
            let accuracy = correct as f64 / test.len().max(1) as f64;

            let scores = self.cross_validate(candidate, &classes, &rows, &y, &per_class, folds)?;
            let cv_mean = scores.iter().sum::<f64>() / scores.len().max(1) as f64;
            let cv_std = (scores.iter().map(|s| (s - cv_mean).powi(2)).sum::<f64>()
                / scores.len().max(1) as f64)
                .sqrt();

            info!(
                algorithm = %candidate.name,
                accuracy,
                cv_mean,
                cv_std,
                "Candidate evaluated"
            );
            candidates.push(CandidateReport {
                name: candidate.name.clone(),
                accuracy,
                cv_mean,
                cv_std,
                folds,
                confusion,
                model,
            });
        }

        let mut best = 0;
        for (i, c) in candidates.iter().enumerate() {
            if c.accuracy > candidates[best].accuracy {
                best = i;
            }
        }

        Ok(TrainingReport {
            classes,
            train_size: train.len(),
            test_size: test.len(),
            candidates,
            best,
        })
    }

    /// Per class: shuffle with the seeded RNG, then hold out `round(test_size * n)`
    /// repetitions, at least one and leaving at least one for training.
    fn stratified_split(&self, per_class: &[Vec<usize>]) -> (Vec<usize>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(self.random_state);
        let mut train = Vec::new();
        let mut test = Vec::new();
        for members in per_class {
            let mut shuffled = members.clone();
            shuffled.shuffle(&mut rng);
            let n = shuffled.len();
            let n_test = ((self.test_size * n as f64).round() as usize).clamp(1, n - 1);
            test.extend_from_slice(&shuffled[..n_test]);
            train.extend_from_slice(&shuffled[n_test..]);
        }
        train.sort_unstable();
        test.sort_unstable();
        (train, test)
    }

    /// Stratified k-fold assignment: each class is shuffled with the seeded RNG, then its
    /// j-th member goes to fold `j % folds`.
    fn fold_assignment(&self, per_class: &[Vec<usize>], n_samples: usize, folds: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.random_state);
        let mut fold_of = vec![0; n_samples];
        for members in per_class {
            let mut shuffled = members.clone();
            shuffled.shuffle(&mut rng);
            for (j, &i) in shuffled.iter().enumerate() {
                fold_of[i] = j % folds;
            }
        }
        fold_of
    }

    fn cross_validate(
        &self,
        candidate: &NamedAlgorithm,
        classes: &[String],
        rows: &[Vec<f64>],
        y: &[usize],
        per_class: &[Vec<usize>],
        folds: usize,
    ) -> AppResult<Vec<f64>> {
        let fold_of = self.fold_assignment(per_class, y.len(), folds);

        let mut scores = Vec::with_capacity(folds);
        for fold in 0..folds {
            let (held_out, kept): (Vec<usize>, Vec<usize>) =
                (0..y.len()).partition(|&i| fold_of[i] == fold);
            if held_out.is_empty() || kept.is_empty() {
                warn!(fold, "Skipping degenerate cross-validation fold");
                continue;
            }
            let model = Model::fit(
                &candidate.name,
                &candidate.algorithm,
                classes.to_vec(),
                &select(rows, &kept),
                &select(y, &kept),
            )?;
            let correct = held_out
                .iter()
                .filter(|&&i| predict_index(&model, &rows[i]) == y[i])
                .count();
            scores.push(correct as f64 / held_out.len() as f64);
        }
        Ok(scores)
    }
}

fn class_members(y: &[usize], n_classes: usize) -> Vec<Vec<usize>> {
    let mut members = vec![Vec::new(); n_classes];
    for (i, &class) in y.iter().enumerate() {
        members[class].push(i);
    }
    members
}

fn select<T: Clone>(items: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| items[i].clone()).collect()
}

fn predict_index(model: &Model, row: &[f64]) -> usize {
    super::argmax(&model.predict_row(row)).unwrap_or(0)
}

/// Trains on `dataset`, saves the best model to `model_path`, and returns the report.
pub fn train_and_save(
    pipeline: &TrainingPipeline,
    dataset: &Dataset,
    model_path: &Path,
) -> AppResult<TrainingReport> {
    let report = pipeline.run(dataset)?;
    let best = report
        .best_candidate()
        .ok_or_else(|| DaqError::Training("no candidate was evaluated".to_string()))?;
    best.model.save(model_path)?;
    info!(
        algorithm = %best.name,
        accuracy = best.accuracy,
        classes = ?best.model.classes(),
        "Best model saved"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Algorithm;

    fn segment(rep_id: u64, label: &str, amplitude: f64) -> Segment {
        let readings = (0..20)
            .map(|i| {
                let t = i as f64 * 10.0;
                let x = (i as f64 * 0.5).sin() * amplitude + rep_id as f64 * 0.01;
                Reading::new("imu1", t, x, x * 0.5, -x)
            })
            .collect();
        Segment::new(rep_id, label, readings)
    }

    fn dataset() -> Dataset {
        let mut segments = Vec::new();
        for rep in 1..=8 {
            segments.push(segment(rep, "correcto", 5.0));
        }
        for rep in 9..=16 {
            segments.push(segment(rep, "incorrecto", 40.0));
        }
        Dataset::from_segments(&segments, &FeatureExtractor::default()).unwrap()
    }

    fn pipeline() -> TrainingPipeline {
        TrainingPipeline::from_config(&TrainingConfig::default())
    }

    #[test]
    fn test_separable_classes_are_learned() {
        let report = pipeline().run(&dataset()).unwrap();
        assert_eq!(report.classes, vec!["correcto", "incorrecto"]);
        assert_eq!(report.candidates.len(), 3);
        assert_eq!(report.train_size + report.test_size, 16);
        assert_eq!(report.test_size, 4);
        let best = report.best_candidate().unwrap();
        assert_eq!(best.accuracy, 1.0);
        assert_eq!(best.folds, 5);
        let total: usize = best.confusion.iter().flatten().sum();
        assert_eq!(total, report.test_size);
    }

    #[test]
    fn test_split_is_reproducible() {
        let data = dataset();
        let a = pipeline().run(&data).unwrap();
        let b = pipeline().run(&data).unwrap();
        for (x, y) in a.candidates.iter().zip(&b.candidates) {
            assert_eq!(x.confusion, y.confusion);
            assert_eq!(x.cv_mean, y.cv_mean);
        }
    }

    #[test]
    fn test_folds_are_shuffled_with_seed() {
        let per_class = vec![(0..10).collect::<Vec<_>>(), (10..20).collect()];
        let folds_for = |seed| TrainingPipeline::new(0.3, seed, Vec::new()).fold_assignment(&per_class, 20, 5);

        let folds = folds_for(42);
        assert_eq!(folds, folds_for(42));
        for class in &per_class {
            for fold in 0..5 {
                assert_eq!(class.iter().filter(|&&i| folds[i] == fold).count(), 2);
            }
        }

        let in_order: Vec<usize> = (0..20).map(|i| (i % 10) % 5).collect();
        assert_ne!(folds, in_order);
        assert!((0..10u64).any(|seed| folds_for(seed) != folds));
    }

    #[test]
    fn test_single_class_is_rejected() {
        let segments = vec![segment(1, "a", 1.0), segment(2, "a", 2.0)];
        let data = Dataset::from_segments(&segments, &FeatureExtractor::default()).unwrap();
        assert!(matches!(pipeline().run(&data), Err(DaqError::Training(_))));
    }

    #[test]
    fn test_class_with_one_sample_is_rejected() {
        let segments = vec![
            segment(1, "a", 1.0),
            segment(2, "a", 2.0),
            segment(3, "b", 30.0),
        ];
        let data = Dataset::from_segments(&segments, &FeatureExtractor::default()).unwrap();
        let err = pipeline().run(&data).unwrap_err();
        assert!(err.to_string().contains("class 'b'"));
    }

    #[test]
    fn test_best_is_first_on_ties() {
        let pipeline = TrainingPipeline::new(
            0.3,
            42,
            vec![
                NamedAlgorithm {
                    name: "knn1".into(),
                    algorithm: Algorithm::Knn { k: 1 },
                },
                NamedAlgorithm {
                    name: "knn3".into(),
                    algorithm: Algorithm::Knn { k: 3 },
                },
            ],
        );
        let report = pipeline.run(&dataset()).unwrap();
        assert_eq!(report.best, 0);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_from_labeled_csv_groups_by_rep_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labeled.csv");
        std::fs::write(
            &path,
            "rep_id,timestamp,sensor_id,yaw,pitch,roll,label\n\
             2,20,imu1,1,0,0,incorrecto\n\
             1,100,imu1,12,0,0,correcto\n\
             1,0,imu1,10,0,0,correcto\n\
             1,200,imu1,11,0,0,correcto\n\
             2,10,imu1,3,0,0,incorrecto\n",
        )
        .unwrap();

        let segments = Dataset::segments_from_csv(&path).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].rep_id, 1);
        assert_eq!(segments[0].readings[0].timestamp, 0.0);
        assert_eq!(segments[1].label, "incorrecto");

        let data = Dataset::from_labeled_csv(&path, &FeatureExtractor::default()).unwrap();
        assert!((data.samples[0].features.duration - 0.2).abs() < 1e-12);
        assert_eq!(data.samples[0].features.yaw.mean, 11.0);
    }
}
