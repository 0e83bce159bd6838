//! # Market Collaborators
//!
//! Interfaces to the outside world: historical prices, market capitalizations and latest
//! quotes. [`StaticSource`] serves a fixed in-memory matrix and is what tests and offline
//! runs use.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use ndarray::Axis;

use super::matrix::PriceMatrix;

/// Historical price provider. Results may be partial: missing assets are simply absent.
pub trait MarketDataSource: Send + Sync {
  fn fetch(&self, assets: &[String], start: NaiveDate, end: NaiveDate) -> Result<PriceMatrix>;

  /// Most recent traded close, if the provider can quote one.
  fn latest_close(&self, _asset: &str) -> Option<f64> {
    None
  }
}

/// Market capitalization provider.
pub trait MarketCapSource: Send + Sync {
  fn fetch_caps(&self, assets: &[String]) -> Result<HashMap<String, f64>>;
}

/// In-memory price provider over a fixed matrix.
#[derive(Clone, Debug)]
pub struct StaticSource {
  prices: PriceMatrix,
}

impl StaticSource {
  pub fn new(prices: PriceMatrix) -> Self {
    Self { prices }
  }
}

impl MarketDataSource for StaticSource {
  fn fetch(&self, assets: &[String], start: NaiveDate, end: NaiveDate) -> Result<PriceMatrix> {
    let selected = self.prices.select(assets);
    let rows: Vec<usize> = selected
      .dates()
      .iter()
      .enumerate()
      .filter(|(_, d)| **d >= start && **d <= end)
      .map(|(i, _)| i)
      .collect();

    PriceMatrix::new(
      rows.iter().map(|&i| selected.dates()[i]).collect(),
      selected.assets().to_vec(),
      selected.values().select(Axis(0), &rows),
    )
  }
}

/// Fixed capitalization table.
#[derive(Clone, Debug, Default)]
pub struct StaticCaps {
  caps: HashMap<String, f64>,
}

impl StaticCaps {
  pub fn new(caps: HashMap<String, f64>) -> Self {
    Self { caps }
  }
}

impl MarketCapSource for StaticCaps {
  fn fetch_caps(&self, assets: &[String]) -> Result<HashMap<String, f64>> {
    Ok(
      assets
        .iter()
        .filter_map(|a| self.caps.get(a).map(|c| (a.clone(), *c)))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array2;

  #[test]
  fn static_source_filters_dates_and_assets() {
    let dates: Vec<NaiveDate> = (1..=5)
      .map(|d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap())
      .collect();
    let values = Array2::from_shape_fn((5, 2), |(i, j)| (i * 10 + j) as f64);
    let m = PriceMatrix::new(dates.clone(), vec!["A".into(), "B".into()], values).unwrap();
    let src = StaticSource::new(m);

    let out = src.fetch(&["B".into()], dates[1], dates[3]).unwrap();
    assert_eq!(out.n_dates(), 3);
    assert_eq!(out.column("B").unwrap(), vec![11.0, 21.0, 31.0]);
    assert!(src.latest_close("B").is_none());
  }
}
