//! k-nearest neighbours with uniform voting.

use serde::{Deserialize, Serialize};

/// Fitted k-NN model. Keeps the (scaled) training set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnClassifier {
    k: usize,
    n_classes: usize,
    points: Vec<Vec<f64>>,
    targets: Vec<usize>,
}

impl KnnClassifier {
    /// Stores the training set. `k` is capped at the number of samples.
    pub fn fit(k: usize, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Self {
        Self {
            k: k.clamp(1, x.len().max(1)),
            n_classes,
            points: x.to_vec(),
            targets: y.to_vec(),
        }
    }

    /// Effective number of neighbours.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Share of the `k` nearest neighbours in each class.
    pub fn predict_proba(&self, x: &[f64]) -> Vec<f64> {
        let mut proba = vec![0.0; self.n_classes];
        if self.points.is_empty() {
            return proba;
        }

        let mut ranked: Vec<(f64, usize)> = self
            .points
            .iter()
            .zip(&self.targets)
            .map(|(p, &t)| (squared_distance(p, x), t))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        let k = self.k.min(ranked.len());
        for &(_, target) in ranked.iter().take(k) {
            if let Some(slot) = proba.get_mut(target) {
                *slot += 1.0;
            }
        }
        proba.iter_mut().for_each(|p| *p /= k as f64);
        proba
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}
