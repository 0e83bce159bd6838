//! # Acquisition
//!
//! Chunked retrieval from a [`MarketDataSource`]. Every call runs on its own thread and is
//! abandoned once its deadline passes; a chunk that fails, times out or comes back empty is
//! retried asset by asset on a bounded pool with a shorter deadline.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use anyhow::anyhow;
use chrono::NaiveDate;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::matrix::PriceMatrix;
use super::source::MarketDataSource;
use crate::config::AcquisitionConfig;

/// Run `source.fetch` on a detached thread and wait at most `timeout` for it.
pub fn fetch_with_timeout(
  source: &Arc<dyn MarketDataSource>,
  assets: Vec<String>,
  start: NaiveDate,
  end: NaiveDate,
  timeout: Duration,
) -> Result<PriceMatrix> {
  let (tx, rx) = mpsc::channel();
  let source = Arc::clone(source);
  thread::Builder::new()
    .name("market-fetch".into())
    .spawn(move || {
      let _ = tx.send(source.fetch(&assets, start, end));
    })?;

  match rx.recv_timeout(timeout) {
    Ok(res) => res,
    Err(mpsc::RecvTimeoutError::Timeout) => Err(anyhow!("fetch timed out after {timeout:?}")),
    Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("fetch worker exited early")),
  }
}

/// Chunked fetcher with per-asset fallback.
#[derive(Clone)]
pub struct Acquirer {
  source: Arc<dyn MarketDataSource>,
  cfg: AcquisitionConfig,
}

impl Acquirer {
  pub fn new(source: Arc<dyn MarketDataSource>, cfg: AcquisitionConfig) -> Self {
    Self { source, cfg }
  }

  fn fetch_single_assets(&self, chunk: &[String], start: NaiveDate, end: NaiveDate) -> PriceMatrix {
    let workers = self.cfg.max_fallback_workers.min(chunk.len()).max(1);
    let fetch_one = |asset: &String| -> Option<PriceMatrix> {
      match fetch_with_timeout(
        &self.source,
        vec![asset.clone()],
        start,
        end,
        self.cfg.single_timeout(),
      ) {
        Ok(m) if !m.is_empty() => Some(m),
        Ok(_) => {
          debug!(asset = %asset, "no data for asset");
          None
        }
        Err(err) => {
          warn!(asset = %asset, error = %err, "single-asset fetch failed");
          None
        }
      }
    };

    let frames: Vec<PriceMatrix> = match ThreadPoolBuilder::new().num_threads(workers).build() {
      Ok(pool) => pool.install(|| chunk.par_iter().filter_map(fetch_one).collect()),
      Err(err) => {
        warn!(error = %err, "fallback pool unavailable, fetching sequentially");
        chunk.iter().filter_map(fetch_one).collect()
      }
    };

    frames
      .iter()
      .fold(PriceMatrix::empty(), |acc, m| acc.merge(m))
  }

  fn fetch_chunk(&self, chunk: &[String], start: NaiveDate, end: NaiveDate) -> PriceMatrix {
    match fetch_with_timeout(
      &self.source,
      chunk.to_vec(),
      start,
      end,
      self.cfg.chunk_timeout(),
    ) {
      Ok(m) if !m.is_empty() => m,
      Ok(_) => {
        warn!(size = chunk.len(), "empty chunk result, retrying per asset");
        self.fetch_single_assets(chunk, start, end)
      }
      Err(err) => {
        warn!(size = chunk.len(), error = %err, "chunk fetch failed, retrying per asset");
        self.fetch_single_assets(chunk, start, end)
      }
    }
  }

  /// Fetch `assets` over `[start, end]`, merge, forward-fill and drop empty columns and rows.
  pub fn fetch(&self, assets: &[String], start: NaiveDate, end: NaiveDate) -> PriceMatrix {
    let chunk_size = self.cfg.chunk_size.max(1);
    let mut merged = PriceMatrix::empty();
    for (i, chunk) in assets.chunks(chunk_size).enumerate() {
      let frame = self.fetch_chunk(chunk, start, end);
      debug!(chunk = i, assets = frame.n_assets(), rows = frame.n_dates(), "chunk fetched");
      merged = merged.merge(&frame);
    }

    merged.forward_fill();
    let dropped = merged.retain_columns(|_, col| col.iter().any(|v| !v.is_nan()));
    if !dropped.is_empty() {
      warn!(?dropped, "dropped assets with no history");
    }
    merged.drop_empty_rows();

    let order: Vec<String> = assets
      .iter()
      .filter(|a| merged.position(a).is_some())
      .cloned()
      .collect();
    let merged = merged.select(&order);
    info!(
      requested = assets.len(),
      fetched = merged.n_assets(),
      rows = merged.n_dates(),
      "price acquisition complete"
    );
    merged
  }
}
