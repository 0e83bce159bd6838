//! # Gradient-Boosted Trees
//!
//! $$
//! F_0 = \bar y,\qquad F_m(x) = F_{m-1}(x) + \eta\, h_m(x),\qquad
//! h_m = \arg\min_h \sum_i \big(y_i - F_{m-1}(x_i) - h(x_i)\big)^2
//! $$
//!
//! Squared-loss boosting of depth-limited regression trees over the engineered features in
//! [`super::features`]. The vote is the prediction at the mean feature row, annualized and
//! clipped.

use anyhow::Result;
use anyhow::bail;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use rayon::prelude::*;
use tracing::debug;

use super::Forecaster;
use super::ModelOutcome;
use super::TRADING_DAYS;
use super::features::engineer;
use crate::config::BoostedConfig;
use crate::scheduler::numeric_threads;
use crate::stats::valid_prices;

#[derive(Clone, Debug)]
enum Node {
  Leaf {
    value: f64,
  },
  Split {
    feature: usize,
    threshold: f64,
    left: usize,
    right: usize,
  },
}

/// A single regression tree stored as a node arena rooted at index 0.
#[derive(Clone, Debug)]
pub struct RegressionTree {
  nodes: Vec<Node>,
}

#[derive(Clone, Copy, Debug)]
struct SplitCandidate {
  feature: usize,
  threshold: f64,
  gain: f64,
}

impl RegressionTree {
  pub fn predict(&self, row: ArrayView1<f64>) -> f64 {
    let mut idx = 0;
    loop {
      match &self.nodes[idx] {
        Node::Leaf { value } => return *value,
        Node::Split {
          feature,
          threshold,
          left,
          right,
        } => {
          idx = if row[*feature] <= *threshold {
            *left
          } else {
            *right
          };
        }
      }
    }
  }

  pub fn depth(&self) -> usize {
    fn walk(nodes: &[Node], idx: usize) -> usize {
      match &nodes[idx] {
        Node::Leaf { .. } => 0,
        Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
      }
    }
    walk(&self.nodes, 0)
  }

  fn fit(x: &Array2<f64>, residuals: &[f64], max_depth: usize, min_leaf: usize) -> Self {
    let mut tree = Self { nodes: Vec::new() };
    let rows: Vec<usize> = (0..x.nrows()).collect();
    tree.grow(x, residuals, rows, 0, max_depth, min_leaf.max(1));
    tree
  }

  fn grow(
    &mut self,
    x: &Array2<f64>,
    residuals: &[f64],
    rows: Vec<usize>,
    depth: usize,
    max_depth: usize,
    min_leaf: usize,
  ) -> usize {
    let idx = self.nodes.len();
    let value = rows.iter().map(|&r| residuals[r]).sum::<f64>() / rows.len().max(1) as f64;
    self.nodes.push(Node::Leaf { value });

    if depth >= max_depth || rows.len() < 2 * min_leaf {
      return idx;
    }

    let Some(split) = best_split(x, residuals, &rows, min_leaf) else {
      return idx;
    };

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
      .iter()
      .partition(|&&r| x[[r, split.feature]] <= split.threshold);

    let left = self.grow(x, residuals, left_rows, depth + 1, max_depth, min_leaf);
    let right = self.grow(x, residuals, right_rows, depth + 1, max_depth, min_leaf);
    self.nodes[idx] = Node::Split {
      feature: split.feature,
      threshold: split.threshold,
      left,
      right,
    };
    idx
  }
}

fn best_split_on_feature(
  x: &Array2<f64>,
  residuals: &[f64],
  rows: &[usize],
  feature: usize,
  min_leaf: usize,
) -> Option<SplitCandidate> {
  let mut order: Vec<(f64, f64)> = rows
    .iter()
    .map(|&r| (x[[r, feature]], residuals[r]))
    .collect();
  order.sort_by(|a, b| a.0.total_cmp(&b.0));

  let n = order.len();
  let total: f64 = order.iter().map(|(_, g)| g).sum();
  let parent_score = total * total / n as f64;

  let mut best: Option<SplitCandidate> = None;
  let mut left_sum = 0.0;
  for i in 0..n - 1 {
    left_sum += order[i].1;
    let n_left = i + 1;
    let n_right = n - n_left;
    if n_left < min_leaf || n_right < min_leaf || order[i].0 == order[i + 1].0 {
      continue;
    }

    let right_sum = total - left_sum;
    let gain = left_sum * left_sum / n_left as f64 + right_sum * right_sum / n_right as f64
      - parent_score;
    if gain > best.map_or(1e-15, |b| b.gain) {
      best = Some(SplitCandidate {
        feature,
        threshold: 0.5 * (order[i].0 + order[i + 1].0),
        gain,
      });
    }
  }
  best
}

fn best_split(
  x: &Array2<f64>,
  residuals: &[f64],
  rows: &[usize],
  min_leaf: usize,
) -> Option<SplitCandidate> {
  let pick = |a: Option<SplitCandidate>, b: Option<SplitCandidate>| match (a, b) {
    (Some(a), Some(b)) => Some(if b.gain > a.gain { b } else { a }),
    (a, None) => a,
    (None, b) => b,
  };

  if numeric_threads() > 1 {
    (0..x.ncols())
      .into_par_iter()
      .map(|f| best_split_on_feature(x, residuals, rows, f, min_leaf))
      .reduce(|| None, pick)
  } else {
    (0..x.ncols())
      .map(|f| best_split_on_feature(x, residuals, rows, f, min_leaf))
      .fold(None, pick)
  }
}

/// Fitted boosting ensemble.
#[derive(Clone, Debug)]
pub struct BoostedTrees {
  base: f64,
  learning_rate: f64,
  trees: Vec<RegressionTree>,
}

impl BoostedTrees {
  pub fn fit(x: &Array2<f64>, y: &Array1<f64>, cfg: &BoostedConfig) -> Result<Self> {
    if x.nrows() != y.len() {
      bail!("feature rows and targets must have the same length");
    }
    if x.nrows() == 0 {
      bail!("cannot fit boosted trees on an empty design");
    }

    let base = y.mean().unwrap_or(0.0);
    let mut pred = vec![base; y.len()];
    let mut trees = Vec::with_capacity(cfg.n_estimators);

    for _ in 0..cfg.n_estimators {
      let residuals: Vec<f64> = y.iter().zip(pred.iter()).map(|(t, p)| t - p).collect();
      let tree = RegressionTree::fit(x, &residuals, cfg.max_depth, cfg.min_samples_leaf);
      for (i, p) in pred.iter_mut().enumerate() {
        *p += cfg.learning_rate * tree.predict(x.row(i));
      }
      trees.push(tree);
    }

    if pred.iter().any(|p| !p.is_finite()) {
      bail!("boosting diverged");
    }

    Ok(Self {
      base,
      learning_rate: cfg.learning_rate,
      trees,
    })
  }

  pub fn predict(&self, row: ArrayView1<f64>) -> f64 {
    self.base
      + self
        .trees
        .iter()
        .map(|t| self.learning_rate * t.predict(row))
        .sum::<f64>()
  }

  pub fn n_trees(&self) -> usize {
    self.trees.len()
  }
}

/// Ensemble member wrapping [`BoostedTrees`].
#[derive(Clone, Debug)]
pub struct BoostedForecaster {
  cfg: BoostedConfig,
}

impl BoostedForecaster {
  pub fn new(cfg: BoostedConfig) -> Self {
    Self { cfg }
  }
}

impl Forecaster for BoostedForecaster {
  fn name(&self) -> &'static str {
    "boosted_trees"
  }

  fn forecast(&self, prices: &[f64]) -> ModelOutcome {
    if !self.cfg.enabled {
      return ModelOutcome::OptedOut {
        reason: "disabled".into(),
      };
    }

    let prices = valid_prices(prices);
    if prices.len() < self.cfg.min_history {
      return ModelOutcome::OptedOut {
        reason: format!("insufficient history ({} prices)", prices.len()),
      };
    }

    let set = engineer(&prices);
    if set.rows() < self.cfg.min_valid_rows {
      return ModelOutcome::OptedOut {
        reason: format!("insufficient valid rows ({})", set.rows()),
      };
    }

    match BoostedTrees::fit(&set.x, &set.y, &self.cfg) {
      Ok(model) => {
        let daily = model.predict(set.mean_row().view());
        let annual = (daily * TRADING_DAYS).clamp(-self.cfg.clip, self.cfg.clip);
        debug!(daily, annual, trees = model.n_trees(), "boosted trees vote");
        ModelOutcome::Fitted { value: annual }
      }
      Err(err) => ModelOutcome::OptedOut {
        reason: format!("training failed: {err}"),
      },
    }
  }
}
