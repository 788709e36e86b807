//! Trained model artifact.
//!
//! The artifact is a single JSON document holding the feature layout it was trained
//! on, the class labels, the scaler parameters and the fitted algorithm:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "feature_names": ["duration", "yaw_mean", "..."],
//!   "classes": ["correcto", "incorrecto"],
//!   "scaler": { "mean": [...], "scale": [...] },
//!   "algorithm_name": "KNN",
//!   "algorithm": { "kind": "knn", "k": 5 },
//!   "classifier": { "kind": "knn", ... },
//!   "trained_at": "2025-01-01T12:00:00Z"
//! }
//! ```
//!
//! Loading refuses artifacts whose feature layout differs from the running build.

use super::knn::KnnClassifier;
use super::naive_bayes::GaussianNb;
use super::scaler::StandardScaler;
use super::tree::DecisionTree;
use super::Classifier;
use crate::data::features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES, FEATURE_SCHEMA_VERSION};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// A classification algorithm and its hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Algorithm {
    /// k-nearest neighbours, uniform weights
    Knn {
        /// Number of neighbours
        #[serde(default = "default_k")]
        k: usize,
    },
    /// Gaussian naive Bayes
    GaussianNb {
        /// Fraction of the largest feature variance added to every variance
        #[serde(default = "default_var_smoothing")]
        var_smoothing: f64,
    },
    /// CART decision tree (Gini)
    DecisionTree {
        /// Maximum depth, unlimited when absent
        #[serde(default)]
        max_depth: Option<usize>,
        /// Minimum samples required to split a node
        #[serde(default = "default_min_samples_split")]
        min_samples_split: usize,
    },
}

fn default_k() -> usize {
    5
}

fn default_var_smoothing() -> f64 {
    1e-9
}

fn default_min_samples_split() -> usize {
    2
}

impl Algorithm {
    /// Checks hyper-parameter ranges.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Algorithm::Knn { k } if *k == 0 => Err("k must be >= 1".to_string()),
            Algorithm::GaussianNb { var_smoothing }
                if !(var_smoothing.is_finite() && *var_smoothing >= 0.0) =>
            {
                Err("var_smoothing must be a non-negative number".to_string())
            }
            Algorithm::DecisionTree { max_depth, .. } if *max_depth == Some(0) => {
                Err("max_depth must be >= 1".to_string())
            }
            Algorithm::DecisionTree {
                min_samples_split, ..
            } if *min_samples_split < 2 => Err("min_samples_split must be >= 2".to_string()),
            _ => Ok(()),
        }
    }

    /// Fits the algorithm on scaled rows with class indices `y`.
    pub fn fit(&self, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> FittedClassifier {
        match self {
            Algorithm::Knn { k } => FittedClassifier::Knn(KnnClassifier::fit(*k, x, y, n_classes)),
            Algorithm::GaussianNb { var_smoothing } => {
                FittedClassifier::GaussianNb(GaussianNb::fit(*var_smoothing, x, y, n_classes))
            }
            Algorithm::DecisionTree {
                max_depth,
                min_samples_split,
            } => FittedClassifier::DecisionTree(DecisionTree::fit(
                *max_depth,
                *min_samples_split,
                x,
                y,
                n_classes,
            )),
        }
    }
}

/// A fitted algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedClassifier {
    /// k-nearest neighbours
    Knn(KnnClassifier),
    /// Gaussian naive Bayes
    GaussianNb(GaussianNb),
    /// Decision tree
    DecisionTree(DecisionTree),
}

impl FittedClassifier {
    /// Class probabilities for one scaled row.
    pub fn predict_proba(&self, x: &[f64]) -> Vec<f64> {
        match self {
            FittedClassifier::Knn(m) => m.predict_proba(x),
            FittedClassifier::GaussianNb(m) => m.predict_proba(x),
            FittedClassifier::DecisionTree(m) => m.predict_proba(x),
        }
    }
}

/// Scaler, fitted algorithm and class labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Feature layout version
    pub schema_version: u32,
    /// Feature names in column order
    pub feature_names: Vec<String>,
    /// Class labels in probability order
    pub classes: Vec<String>,
    /// Feature standardization
    pub scaler: StandardScaler,
    /// Display name of the algorithm
    pub algorithm_name: String,
    /// Algorithm and hyper-parameters
    pub algorithm: Algorithm,
    /// Fitted parameters
    pub classifier: FittedClassifier,
    /// Training time
    pub trained_at: DateTime<Utc>,
}

impl Model {
    /// Fits scaler and algorithm on raw feature rows.
    ///
    /// `y` holds indices into `classes`.
    pub fn fit(
        algorithm_name: &str,
        algorithm: &Algorithm,
        classes: Vec<String>,
        rows: &[Vec<f64>],
        y: &[usize],
    ) -> AppResult<Self> {
        if rows.is_empty() {
            return Err(DaqError::Training("no training samples".to_string()));
        }
        if classes.is_empty() || y.iter().any(|&c| c >= classes.len()) {
            return Err(DaqError::Training("class index out of range".to_string()));
        }
        algorithm.validate().map_err(DaqError::Training)?;

        let scaler = StandardScaler::fit(rows, FEATURE_COUNT);
        let scaled = scaler.transform_all(rows);
        let classifier = algorithm.fit(&scaled, y, classes.len());

        Ok(Self {
            schema_version: FEATURE_SCHEMA_VERSION,
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            classes,
            scaler,
            algorithm_name: algorithm_name.to_string(),
            algorithm: algorithm.clone(),
            classifier,
            trained_at: Utc::now(),
        })
    }

    /// Class probabilities for an unscaled feature row.
    pub fn predict_row(&self, row: &[f64]) -> Vec<f64> {
        self.classifier.predict_proba(&self.scaler.transform(row))
    }

    /// Writes the artifact as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), algorithm = %self.algorithm_name, "Model saved");
        Ok(())
    }

    /// Reads an artifact and checks it matches the current feature layout.
    pub fn load(path: &Path) -> AppResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Model(format!("cannot read model '{}': {}", path.display(), e))
        })?;
        let model: Self = serde_json::from_str(&json)?;
        model.check_layout()?;
        info!(
            path = %path.display(),
            algorithm = %model.algorithm_name,
            classes = ?model.classes,
            "Model loaded"
        );
        Ok(model)
    }

    fn check_layout(&self) -> AppResult<()> {
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(DaqError::Model(format!(
                "feature schema version {} does not match {}",
                self.schema_version, FEATURE_SCHEMA_VERSION
            )));
        }
        if self.feature_names.iter().map(String::as_str).ne(FEATURE_NAMES) {
            return Err(DaqError::Model("feature names do not match".to_string()));
        }
        if self.scaler.width() != FEATURE_COUNT {
            return Err(DaqError::Model("scaler width does not match".to_string()));
        }
        if self.classes.is_empty() {
            return Err(DaqError::Model("model has no classes".to_string()));
        }
        Ok(())
    }
}

impl Classifier for Model {
    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict_proba(&self, features: &FeatureVector) -> AppResult<Vec<f64>> {
        let proba = self.predict_row(&features.to_array());
        if proba.len() != self.classes.len() {
            return Err(DaqError::Model(format!(
                "classifier returned {} probabilities for {} classes",
                proba.len(),
                self.classes.len()
            )));
        }
        Ok(proba)
    }
}
