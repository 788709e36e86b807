//! Per-feature standardization.

use serde::{Deserialize, Serialize};

/// Centers each column on its training mean and divides by its training standard
/// deviation.
///
/// NaN inputs (undefined correlations) are ignored when fitting and become 0, the
/// column mean, after transforming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    /// Column means
    pub mean: Vec<f64>,
    /// Column scales (population std, 1 for constant columns)
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Fits the scaler to `rows`, which must all have `width` columns.
    pub fn fit(rows: &[Vec<f64>], width: usize) -> Self {
        let mut mean = vec![0.0; width];
        let mut scale = vec![1.0; width];
        for col in 0..width {
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|row| row.get(col).copied())
                .filter(|v| !v.is_nan())
                .collect();
            if values.is_empty() {
                continue;
            }
            let m = values.iter().sum::<f64>() / values.len() as f64;
            let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
            let std = var.sqrt();
            mean[col] = m;
            scale[col] = if std > 0.0 && std.is_finite() { std } else { 1.0 };
        }
        Self { mean, scale }
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.mean.len()
    }

    /// Standardizes one row.
    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| {
                let z = (x - m) / s;
                if z.is_nan() {
                    0.0
                } else {
                    z
                }
            })
            .collect()
    }

    /// Standardizes every row.
    pub fn transform_all(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|row| self.transform(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_transform() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = StandardScaler::fit(&rows, 2);
        assert_eq!(scaler.mean, vec![2.0, 5.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);
        assert_eq!(scaler.transform(&[3.0, 7.0]), vec![1.0, 2.0]);
    }

    #[test]
    fn test_nan_is_ignored_and_imputed() {
        let rows = vec![vec![f64::NAN], vec![2.0], vec![4.0]];
        let scaler = StandardScaler::fit(&rows, 1);
        assert_eq!(scaler.mean, vec![3.0]);
        assert_eq!(scaler.transform(&[f64::NAN]), vec![0.0]);
    }

    #[test]
    fn test_all_nan_column() {
        let rows = vec![vec![f64::NAN], vec![f64::NAN]];
        let scaler = StandardScaler::fit(&rows, 1);
        assert_eq!(scaler.transform(&[f64::NAN]), vec![0.0]);
        assert_eq!(scaler.transform(&[2.0]), vec![2.0]);
    }
}
