//! # Requests and Results

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

use crate::forecast::ForecastMethod;
use crate::portfolio::Constraints;
use crate::portfolio::Objective;
use crate::portfolio::PriorMethod;

/// One optimization call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationRequest {
  pub start: NaiveDate,
  pub end: NaiveDate,
  pub risk_free: f64,
  /// Explicit universe; takes precedence over `group`.
  pub tickers: Option<Vec<String>>,
  /// Named universe from the configuration.
  pub group: Option<String>,
  /// Mutually exclusive with `target_risk`; wins when both are set.
  pub target_return: Option<f64>,
  pub target_risk: Option<f64>,
  pub max_weight: f64,
  pub l2_gamma: f64,
  pub forecast_method: ForecastMethod,
  pub prior: PriorMethod,
  pub portfolio_id: Option<String>,
  pub persist: bool,
  pub load_if_available: bool,
}

impl Default for OptimizationRequest {
  fn default() -> Self {
    let today = chrono::Local::now().date_naive();
    Self {
      start: today - chrono::Duration::days(365),
      end: today,
      risk_free: 0.02,
      tickers: None,
      group: None,
      target_return: None,
      target_risk: None,
      max_weight: 0.2,
      l2_gamma: 0.05,
      forecast_method: ForecastMethod::default(),
      prior: PriorMethod::default(),
      portfolio_id: None,
      persist: false,
      load_if_available: false,
    }
  }
}

impl OptimizationRequest {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
    Self {
      start,
      end,
      ..Self::default()
    }
  }

  pub fn with_tickers<S: AsRef<str>>(mut self, tickers: &[S]) -> Self {
    self.tickers = Some(tickers.iter().map(|t| t.as_ref().to_string()).collect());
    self
  }

  pub fn constraints(&self) -> Constraints {
    Constraints {
      max_weight: self.max_weight,
      l2_gamma: self.l2_gamma,
    }
  }

  pub fn objective(&self) -> Objective {
    Objective::select(self.target_return, self.target_risk)
  }
}

/// Weights and performance of one successful run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
  /// Non-trivial weights only; not renormalized after dropping.
  pub weights: BTreeMap<String, f64>,
  #[serde(rename = "return")]
  pub expected_return: f64,
  pub risk: f64,
  pub sharpe_ratio: f64,
  #[serde(rename = "prices")]
  pub latest_prices: BTreeMap<String, f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub portfolio_id: Option<String>,
}

impl OptimizationResult {
  pub fn total_weight(&self) -> f64 {
    self.weights.values().sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_defaults_and_payload_names() {
    let req: OptimizationRequest =
      serde_json::from_str(r#"{"start":"2024-01-02","end":"2024-06-28","tickers":["AAPL"]}"#).unwrap();
    assert_eq!(req.max_weight, 0.2);
    assert_eq!(req.l2_gamma, 0.05);
    assert_eq!(req.forecast_method, ForecastMethod::Lightweight);
    assert_eq!(req.prior, PriorMethod::Bayesian);
    assert_eq!(req.objective(), Objective::MaxSharpe);

    let mut res = OptimizationResult::default();
    res.weights.insert("AAPL".into(), 1.0);
    let json = serde_json::to_value(&res).unwrap();
    assert!(json.get("return").is_some());
    assert!(json.get("prices").is_some());
    assert!(json.get("portfolio_id").is_none());
  }
}
