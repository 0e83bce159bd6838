//! # Engineered Features
//!
//! $$
//! \mathrm{RSI}_{14} = 100 - \frac{100}{1 + \bar g_{14} / (\bar l_{14} + 10^{-10})}
//! $$
//!
//! Per-period feature rows for the boosted-tree model.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;

pub const FEATURE_NAMES: [&str; 9] = [
  "log_ret_1d",
  "log_ret_5d",
  "log_ret_20d",
  "ma_5",
  "ma_20",
  "ma_50",
  "volatility_10d",
  "volatility_20d",
  "rsi",
];

const RSI_GUARD: f64 = 1e-10;

/// Design matrix and next-period log-return target, restricted to fully defined rows.
#[derive(Clone, Debug)]
pub struct FeatureSet {
  pub x: Array2<f64>,
  pub y: Array1<f64>,
}

impl FeatureSet {
  pub fn rows(&self) -> usize {
    self.x.nrows()
  }

  /// Column means of the design matrix.
  pub fn mean_row(&self) -> Array1<f64> {
    self
      .x
      .mean_axis(Axis(0))
      .unwrap_or_else(|| Array1::zeros(FEATURE_NAMES.len()))
  }
}

fn rolling<F>(xs: &[f64], window: usize, f: F) -> Vec<f64>
where
  F: Fn(&[f64]) -> f64,
{
  let mut out = vec![f64::NAN; xs.len()];
  if window == 0 {
    return out;
  }
  for t in (window - 1)..xs.len() {
    let slice = &xs[t + 1 - window..=t];
    if slice.iter().all(|v| v.is_finite()) {
      out[t] = f(slice);
    }
  }
  out
}

fn window_mean(xs: &[f64]) -> f64 {
  xs.iter().sum::<f64>() / xs.len() as f64
}

fn window_std(xs: &[f64]) -> f64 {
  if xs.len() < 2 {
    return f64::NAN;
  }
  let m = window_mean(xs);
  let ss: f64 = xs.iter().map(|v| (v - m) * (v - m)).sum();
  (ss / (xs.len() - 1) as f64).sqrt()
}

/// Raw per-period feature columns, aligned with `prices` and padded with NaN.
pub fn feature_columns(prices: &[f64]) -> Vec<Vec<f64>> {
  let n = prices.len();
  let mut log_ret = vec![f64::NAN; n];
  let mut gains = vec![f64::NAN; n];
  let mut losses = vec![f64::NAN; n];
  for t in 1..n {
    log_ret[t] = (prices[t] / prices[t - 1]).ln();
    let delta = prices[t] - prices[t - 1];
    gains[t] = delta.max(0.0);
    losses[t] = (-delta).max(0.0);
  }

  let ratio_to_price = |ma: Vec<f64>| -> Vec<f64> {
    ma.iter()
      .zip(prices.iter())
      .map(|(m, p)| m / p)
      .collect()
  };

  let avg_gain = rolling(&gains, 14, window_mean);
  let avg_loss = rolling(&losses, 14, window_mean);
  let rsi: Vec<f64> = avg_gain
    .iter()
    .zip(avg_loss.iter())
    .map(|(g, l)| {
      let rs = g / (l + RSI_GUARD);
      100.0 - 100.0 / (1.0 + rs)
    })
    .collect();

  vec![
    log_ret.clone(),
    rolling(&log_ret, 5, |w| w.iter().sum()),
    rolling(&log_ret, 20, |w| w.iter().sum()),
    ratio_to_price(rolling(prices, 5, window_mean)),
    ratio_to_price(rolling(prices, 20, window_mean)),
    ratio_to_price(rolling(prices, 50, window_mean)),
    rolling(&log_ret, 10, window_std),
    rolling(&log_ret, 20, window_std),
    rsi,
  ]
}

/// Build the training set: rows where every feature and the next-period target are finite.
pub fn engineer(prices: &[f64]) -> FeatureSet {
  let columns = feature_columns(prices);
  let n = prices.len();
  let k = columns.len();

  let mut flat = Vec::new();
  let mut target = Vec::new();
  for t in 0..n.saturating_sub(1) {
    let next = columns[0][t + 1];
    if !next.is_finite() || columns.iter().any(|c| !c[t].is_finite()) {
      continue;
    }
    flat.extend(columns.iter().map(|c| c[t]));
    target.push(next);
  }

  let rows = target.len();
  let x = Array2::from_shape_vec((rows, k), flat).unwrap_or_else(|_| Array2::zeros((0, k)));
  FeatureSet {
    x,
    y: Array1::from(target),
  }
}
