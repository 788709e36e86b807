//! Gaussian naive Bayes.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Smallest variance used when every feature is constant.
const VARIANCE_FLOOR: f64 = 1e-12;

/// Fitted Gaussian naive Bayes model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNb {
    log_priors: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
}

impl GaussianNb {
    /// Estimates per-class means and variances.
    ///
    /// `var_smoothing` times the largest feature variance is added to every variance.
    /// Every class in `0..n_classes` must have at least one sample.
    pub fn fit(var_smoothing: f64, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Self {
        let width = x.first().map_or(0, Vec::len);
        let n = x.len().max(1) as f64;

        let overall_max_var = (0..width)
            .map(|col| {
                let m = x.iter().map(|row| row[col]).sum::<f64>() / n;
                x.iter().map(|row| (row[col] - m).powi(2)).sum::<f64>() / n
            })
            .fold(0.0, f64::max);
        let epsilon = (var_smoothing * overall_max_var).max(VARIANCE_FLOOR);

        let mut log_priors = Vec::with_capacity(n_classes);
        let mut means = Vec::with_capacity(n_classes);
        let mut variances = Vec::with_capacity(n_classes);
        for class in 0..n_classes {
            let members: Vec<&Vec<f64>> = x
                .iter()
                .zip(y)
                .filter(|&(_, &c)| c == class)
                .map(|(row, _)| row)
                .collect();
            let count = members.len().max(1) as f64;

            let mean: Vec<f64> = (0..width)
                .map(|col| members.iter().map(|row| row[col]).sum::<f64>() / count)
                .collect();
            let variance: Vec<f64> = (0..width)
                .map(|col| {
                    members
                        .iter()
                        .map(|row| (row[col] - mean[col]).powi(2))
                        .sum::<f64>()
                        / count
                        + epsilon
                })
                .collect();

            log_priors.push((members.len() as f64 / n).max(f64::MIN_POSITIVE).ln());
            means.push(mean);
            variances.push(variance);
        }

        Self {
            log_priors,
            means,
            variances,
        }
    }

    /// Posterior class probabilities.
    pub fn predict_proba(&self, x: &[f64]) -> Vec<f64> {
        let joint: Vec<f64> = self
            .log_priors
            .iter()
            .zip(self.means.iter().zip(&self.variances))
            .map(|(prior, (mean, var))| {
                let log_likelihood: f64 = x
                    .iter()
                    .zip(mean.iter().zip(var))
                    .map(|(v, (m, s2))| -0.5 * (2.0 * PI * s2).ln() - (v - m).powi(2) / (2.0 * s2))
                    .sum();
                prior + log_likelihood
            })
            .collect();

        let max = joint.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            let n = joint.len().max(1) as f64;
            return vec![1.0 / n; joint.len()];
        }
        let exp: Vec<f64> = joint.iter().map(|j| (j - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        exp.into_iter().map(|e| e / total).collect()
    }
}
