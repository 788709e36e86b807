//! CART decision tree with Gini impurity.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
enum Node {
    Leaf {
        proba: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Fitted decision tree. Nodes live in an arena; index 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

struct Builder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [usize],
    n_classes: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    nodes: Vec<Node>,
}

impl DecisionTree {
    /// Grows a tree until leaves are pure, too small to split, or `max_depth` is reached.
    pub fn fit(
        max_depth: Option<usize>,
        min_samples_split: usize,
        x: &[Vec<f64>],
        y: &[usize],
        n_classes: usize,
    ) -> Self {
        let mut builder = Builder {
            x,
            y,
            n_classes,
            max_depth,
            min_samples_split: min_samples_split.max(2),
            nodes: Vec::new(),
        };
        let all: Vec<usize> = (0..x.len()).collect();
        builder.grow(&all, 0);
        Self {
            nodes: builder.nodes,
        }
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Class distribution of the leaf `x` falls into.
    pub fn predict_proba(&self, x: &[f64]) -> Vec<f64> {
        let mut index = 0;
        loop {
            match self.nodes.get(index) {
                Some(Node::Leaf { proba }) => return proba.clone(),
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = x.get(*feature).copied().unwrap_or(0.0);
                    index = if value <= *threshold { *left } else { *right };
                }
                None => return Vec::new(),
            }
        }
    }
}

impl Builder<'_> {
    fn grow(&mut self, samples: &[usize], depth: usize) -> usize {
        let counts = self.class_counts(samples);
        let index = self.nodes.len();
        self.nodes.push(leaf(&counts, samples.len()));

        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
        let depth_reached = self.max_depth.is_some_and(|max| depth >= max);
        if pure || depth_reached || samples.len() < self.min_samples_split {
            return index;
        }

        let Some((feature, threshold)) = self.best_split(samples) else {
            return index;
        };
        let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&i| self.x[i][feature] <= threshold);

        let left = self.grow(&left_samples, depth + 1);
        let right = self.grow(&right_samples, depth + 1);
        self.nodes[index] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        index
    }

    fn class_counts(&self, samples: &[usize]) -> Vec<usize> {
        let mut counts = vec![0; self.n_classes];
        for &i in samples {
            if let Some(c) = counts.get_mut(self.y[i]) {
                *c += 1;
            }
        }
        counts
    }

    /// Lowest weighted Gini impurity over all features and midpoints between distinct
    /// consecutive values. Earlier features win ties.
    fn best_split(&self, samples: &[usize]) -> Option<(usize, f64)> {
        let width = self.x.first().map_or(0, Vec::len);
        let total = samples.len() as f64;
        let mut best: Option<(f64, usize, f64)> = None;

        for feature in 0..width {
            let mut order = samples.to_vec();
            order.sort_by(|&a, &b| self.x[a][feature].total_cmp(&self.x[b][feature]));

            let mut left = vec![0usize; self.n_classes];
            let mut right = self.class_counts(&order);
            for pos in 0..order.len().saturating_sub(1) {
                let sample = order[pos];
                left[self.y[sample]] += 1;
                right[self.y[sample]] -= 1;

                let here = self.x[sample][feature];
                let next = self.x[order[pos + 1]][feature];
                if here == next {
                    continue;
                }
                let n_left = (pos + 1) as f64;
                let n_right = total - n_left;
                let impurity =
                    (n_left * gini(&left, n_left) + n_right * gini(&right, n_right)) / total;
                if best.map_or(true, |(b, _, _)| impurity < b) {
                    best = Some((impurity, feature, here + (next - here) / 2.0));
                }
            }
        }
        best.map(|(_, feature, threshold)| (feature, threshold))
    }
}

fn leaf(counts: &[usize], n: usize) -> Node {
    let n = n.max(1) as f64;
    Node::Leaf {
        proba: counts.iter().map(|&c| c as f64 / n).collect(),
    }
}

fn gini(counts: &[usize], n: f64) -> f64 {
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / n;
            p * p
        })
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learns_threshold() {
        let x = vec![vec![0.0, 9.0], vec![1.0, 9.0], vec![2.0, 9.0], vec![3.0, 9.0]];
        let y = vec![0, 0, 1, 1];
        let tree = DecisionTree::fit(None, 2, &x, &y, 2);
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.predict_proba(&[0.5, 9.0]), vec![1.0, 0.0]);
        assert_eq!(tree.predict_proba(&[2.6, 9.0]), vec![0.0, 1.0]);
    }

    #[test]
    fn test_max_depth_limits_growth() {
        let x = vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]];
        let y = vec![0, 1, 0, 1];
        let tree = DecisionTree::fit(Some(0), 2, &x, &y, 2);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.predict_proba(&[1.0]), vec![0.5, 0.5]);
    }

    #[test]
    fn test_identical_points_make_a_leaf() {
        let x = vec![vec![1.0], vec![1.0]];
        let y = vec![0, 1];
        let tree = DecisionTree::fit(None, 2, &x, &y, 2);
        assert_eq!(tree.node_count(), 1);
    }
}
