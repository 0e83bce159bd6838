//! # Progress Staging
//!
//! Maps per-stage `(current, total)` counters onto one `0..=100` stream: fetching covers
//! 0-30, forecasting 30-90 and optimization 90-100. Emitted values never decrease.

/// External progress sink: `(current, total, message)`.
pub type ProgressCallback<'a> = dyn FnMut(f64, f64, &str) + 'a;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
  Fetch,
  Forecast,
  Optimize,
}

impl Stage {
  pub fn range(&self) -> (f64, f64) {
    match self {
      Self::Fetch => (0.0, 30.0),
      Self::Forecast => (30.0, 90.0),
      Self::Optimize => (90.0, 100.0),
    }
  }
}

pub struct Progress<'a, 's> {
  sink: Option<&'a mut ProgressCallback<'s>>,
  last: f64,
}

impl<'a, 's> Progress<'a, 's> {
  pub fn new(sink: Option<&'a mut ProgressCallback<'s>>) -> Self {
    Self { sink, last: 0.0 }
  }

  pub fn silent() -> Self {
    Self::new(None)
  }

  /// Report `current` of `total` units done inside `stage`.
  pub fn report(&mut self, stage: Stage, current: usize, total: usize, message: &str) {
    if total == 0 {
      return;
    }
    let (lo, hi) = stage.range();
    let fraction = (current as f64 / total as f64).clamp(0.0, 1.0);
    let global = (lo + fraction * (hi - lo)).max(self.last);
    self.last = global;
    if let Some(sink) = self.sink.as_mut() {
      sink(global, 100.0, message);
    }
  }

  pub fn last(&self) -> f64 {
    self.last
  }
}
