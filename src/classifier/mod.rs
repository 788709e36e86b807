//! Repetition classification.
//!
//! A [`Model`] bundles a [`StandardScaler`] with one fitted algorithm and the list of
//! class labels it was trained on. Models are produced by the [`TrainingPipeline`],
//! saved as JSON, and used at acquisition time through the [`Classifier`] trait.

pub mod knn;
pub mod model;
pub mod naive_bayes;
pub mod scaler;
pub mod training;
pub mod tree;

pub use model::{Algorithm, FittedClassifier, Model};
pub use scaler::StandardScaler;
pub use training::{CandidateReport, Dataset, Sample, TrainingPipeline, TrainingReport};

use crate::data::features::FeatureVector;
use crate::error::{AppResult, DaqError};

/// Outcome of classifying one repetition.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Most probable class label
    pub label: String,
    /// Probability of `label`
    pub probability: f64,
    /// Probability of every class, in [`Classifier::classes`] order
    pub probabilities: Vec<f64>,
}

/// Predicts repetition labels from feature vectors.
pub trait Classifier: Send + Sync {
    /// Class labels, in probability order.
    fn classes(&self) -> &[String];

    /// Probability of each class. Sums to 1.
    fn predict_proba(&self, features: &FeatureVector) -> AppResult<Vec<f64>>;

    /// Most probable class. Ties go to the class listed first.
    fn predict(&self, features: &FeatureVector) -> AppResult<Prediction> {
        let probabilities = self.predict_proba(features)?;
        let best = argmax(&probabilities)
            .ok_or_else(|| DaqError::Model("classifier has no classes".to_string()))?;
        let label = self
            .classes()
            .get(best)
            .cloned()
            .ok_or_else(|| DaqError::Model("class index out of range".to_string()))?;
        Ok(Prediction {
            label,
            probability: probabilities[best],
            probabilities,
        })
    }
}

/// Index of the largest value, first one on ties. NaN never wins.
pub(crate) fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some(b) if values[b] >= *v => {}
            _ => best = Some(i),
        }
    }
    best
}
