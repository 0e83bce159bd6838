//! # Price Matrix
//!
//! $$
//! P \in \mathbb R^{T\times N},\qquad P_{t,j} = \text{adjusted close of asset } j \text{ on date } t
//! $$

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;

use anyhow::Result;
use anyhow::bail;
use chrono::NaiveDate;
use ndarray::Array2;
use ndarray::Axis;
use serde::Deserialize;
use serde::Serialize;

/// Date-ordered rows by unique asset columns. Missing observations are `NaN`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceMatrix {
  dates: Vec<NaiveDate>,
  assets: Vec<String>,
  values: Array2<f64>,
}

impl PriceMatrix {
  pub fn new(dates: Vec<NaiveDate>, assets: Vec<String>, values: Array2<f64>) -> Result<Self> {
    if values.nrows() != dates.len() || values.ncols() != assets.len() {
      bail!(
        "price matrix shape {:?} does not match {} dates x {} assets",
        values.dim(),
        dates.len(),
        assets.len()
      );
    }
    let unique: HashSet<&String> = assets.iter().collect();
    if unique.len() != assets.len() {
      bail!("price matrix columns must be unique");
    }
    if dates.windows(2).any(|w| w[0] >= w[1]) {
      bail!("price matrix dates must be strictly increasing");
    }

    Ok(Self {
      dates,
      assets,
      values,
    })
  }

  pub fn empty() -> Self {
    Self {
      dates: Vec::new(),
      assets: Vec::new(),
      values: Array2::zeros((0, 0)),
    }
  }

  /// Build from per-asset `(date, price)` observations; dates are the union of all series.
  pub fn from_series(series: BTreeMap<String, Vec<(NaiveDate, f64)>>) -> Self {
    let dates: Vec<NaiveDate> = series
      .values()
      .flat_map(|s| s.iter().map(|(d, _)| *d))
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();
    let index: BTreeMap<NaiveDate, usize> =
      dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

    let assets: Vec<String> = series.keys().cloned().collect();
    let mut values = Array2::from_elem((dates.len(), assets.len()), f64::NAN);
    for (j, obs) in series.values().enumerate() {
      for (d, p) in obs {
        values[[index[d], j]] = *p;
      }
    }

    Self {
      dates,
      assets,
      values,
    }
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn values(&self) -> &Array2<f64> {
    &self.values
  }

  pub fn n_dates(&self) -> usize {
    self.dates.len()
  }

  pub fn n_assets(&self) -> usize {
    self.assets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.dates.is_empty() || self.assets.is_empty()
  }

  pub fn position(&self, asset: &str) -> Option<usize> {
    self.assets.iter().position(|a| a == asset)
  }

  pub fn column(&self, asset: &str) -> Option<Vec<f64>> {
    self
      .position(asset)
      .map(|j| self.values.column(j).to_vec())
  }

  pub fn columns(&self) -> Vec<Vec<f64>> {
    self
      .values
      .axis_iter(Axis(1))
      .map(|c| c.to_vec())
      .collect()
  }

  /// Last finite observation of `asset`.
  pub fn latest(&self, asset: &str) -> Option<f64> {
    let j = self.position(asset)?;
    self
      .values
      .column(j)
      .iter()
      .rev()
      .copied()
      .find(|v| v.is_finite())
  }

  /// Keep only `assets`, in the given order; unknown names are skipped.
  pub fn select(&self, assets: &[String]) -> Self {
    let picked: Vec<(usize, String)> = assets
      .iter()
      .filter_map(|a| self.position(a).map(|j| (j, a.clone())))
      .collect();
    let idx: Vec<usize> = picked.iter().map(|(j, _)| *j).collect();

    Self {
      dates: self.dates.clone(),
      assets: picked.into_iter().map(|(_, a)| a).collect(),
      values: self.values.select(Axis(1), &idx),
    }
  }

  /// Carry the last observation forward over gaps, per column.
  pub fn forward_fill(&mut self) {
    for mut col in self.values.axis_iter_mut(Axis(1)) {
      let mut last = f64::NAN;
      for v in col.iter_mut() {
        if v.is_nan() {
          *v = last;
        } else {
          last = *v;
        }
      }
    }
  }

  /// Fill leading gaps with the first observation, per column.
  pub fn backward_fill(&mut self) {
    for mut col in self.values.axis_iter_mut(Axis(1)) {
      let mut next = f64::NAN;
      for v in col.iter_mut().rev() {
        if v.is_nan() {
          *v = next;
        } else {
          next = *v;
        }
      }
    }
  }

  pub fn map_inplace<F: FnMut(&mut f64)>(&mut self, f: F) {
    self.values.map_inplace(f);
  }

  /// Drop columns for which `keep` returns false.
  pub fn retain_columns<F>(&mut self, mut keep: F) -> Vec<String>
  where
    F: FnMut(&str, &[f64]) -> bool,
  {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (j, asset) in self.assets.iter().enumerate() {
      let col = self.values.column(j).to_vec();
      if keep(asset, &col) {
        kept.push(j);
      } else {
        dropped.push(asset.clone());
      }
    }

    if !dropped.is_empty() {
      self.values = self.values.select(Axis(1), &kept);
      self.assets = kept.iter().map(|&j| self.assets[j].clone()).collect();
    }
    dropped
  }

  /// Drop rows where every column is missing.
  pub fn drop_empty_rows(&mut self) {
    let kept: Vec<usize> = (0..self.n_dates())
      .filter(|&i| self.values.row(i).iter().any(|v| !v.is_nan()))
      .collect();
    if kept.len() != self.n_dates() {
      self.values = self.values.select(Axis(0), &kept);
      self.dates = kept.iter().map(|&i| self.dates[i]).collect();
    }
  }

  /// Outer join on dates; on duplicate assets the left column wins.
  pub fn merge(&self, other: &PriceMatrix) -> PriceMatrix {
    let mut series: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
    for m in [other, self] {
      for (j, asset) in m.assets.iter().enumerate() {
        let obs: Vec<(NaiveDate, f64)> = m
          .dates
          .iter()
          .zip(m.values.column(j).iter())
          .filter(|(_, v)| !v.is_nan())
          .map(|(d, v)| (*d, *v))
          .collect();
        series.insert(asset.clone(), obs);
      }
    }
    PriceMatrix::from_series(series)
  }
}
