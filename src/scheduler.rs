//! # Scheduler
//!
//! $$
//! \text{assets} \to \lceil N/B \rceil \text{ batches} \to \text{pool}(\min(\text{cpus}-1, W_{\max}))
//! $$
//!
//! Fans per-asset forecasting out over a bounded worker pool in fixed-size batches, with a
//! memory governor run between batches. Worker threads pin their numeric parallelism to one
//! on start-up so nested data-parallel kernels do not oversubscribe the machine.

pub mod memory;
pub mod pool;

use std::cell::Cell;
use std::sync::Arc;

use tracing::error;

use crate::config::ForecastConfig;
use crate::forecast::ForecastEngine;
use crate::forecast::ForecastResult;
use crate::forecast::lightweight;

pub use memory::MemoryGovernor;
pub use memory::MemoryProbe;
pub use memory::ProcMeminfo;
pub use pool::BatchScheduler;

thread_local! {
  static NUMERIC_THREADS: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Threads numeric kernels may use on the current thread.
///
/// The pin governs kernels in this crate (the boosted-tree split search). Candle's CPU
/// backend sizes its own parallelism and does not read it.
pub fn numeric_threads() -> usize {
  NUMERIC_THREADS
    .with(|n| n.get())
    .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
}

/// Pin [`numeric_threads`] for the current thread.
pub fn pin_numeric_threads(n: usize) {
  NUMERIC_THREADS.with(|c| c.set(Some(n.max(1))));
}

/// Lightweight estimate for every series, used when the worker pool cannot start.
pub fn lightweight_all<S: AsRef<[f64]>>(series: &[S], cfg: &ForecastConfig) -> Vec<ForecastResult> {
  series
    .iter()
    .map(|prices| lightweight::forecast(prices.as_ref(), cfg))
    .collect()
}

impl BatchScheduler {
  /// Forecast every series through `engine`. Output order matches `series`.
  ///
  /// Failed or timed-out assets get the neutral forecast; if the pool itself cannot be
  /// built every asset falls back to the lightweight estimator.
  pub fn forecast_assets<P>(
    &self,
    engine: Arc<ForecastEngine>,
    series: Vec<Vec<f64>>,
    progress: P,
  ) -> Vec<ForecastResult>
  where
    P: FnMut(usize, usize),
  {
    let cfg = engine.config().clone();
    let neutral = ForecastResult::neutral(&cfg);
    let series: Vec<Arc<[f64]>> = series.into_iter().map(Arc::from).collect();
    let task_engine = Arc::clone(&engine);

    match self.run(
      series.clone(),
      move |prices: Arc<[f64]>| task_engine.forecast(&prices),
      neutral,
      progress,
    ) {
      Ok(results) => results,
      Err(err) => {
        error!(error = %err, "scheduler unavailable, using lightweight forecasts for every asset");
        lightweight_all(&series, &cfg)
      }
    }
  }
}
