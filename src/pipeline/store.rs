//! # Portfolio Store
//!
//! Named snapshots of optimization results. [`JsonFileStore`] keeps one pretty-printed JSON
//! document per identifier under a root directory.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use super::request::OptimizationRequest;
use super::request::OptimizationResult;
use crate::error::PipelineError;

/// Request parameters recorded next to a saved result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetadata {
  pub start_date: NaiveDate,
  pub end_date: NaiveDate,
  pub risk_free_rate: f64,
  pub ticker_group: Option<String>,
  pub tickers: Vec<String>,
  pub target_return: Option<f64>,
  pub target_risk: Option<f64>,
  pub l2_gamma: f64,
  pub max_asset_weight: f64,
}

impl PortfolioMetadata {
  pub fn from_request(request: &OptimizationRequest, tickers: &[String]) -> Self {
    Self {
      start_date: request.start,
      end_date: request.end,
      risk_free_rate: request.risk_free,
      ticker_group: request.group.clone(),
      tickers: tickers.to_vec(),
      target_return: request.target_return,
      target_risk: request.target_risk,
      l2_gamma: request.l2_gamma,
      max_asset_weight: request.max_weight,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedPortfolio {
  pub portfolio_id: String,
  pub result: OptimizationResult,
  pub metadata: PortfolioMetadata,
  pub saved_at: DateTime<Utc>,
}

pub trait PortfolioStore: Send + Sync {
  fn save(
    &self,
    id: &str,
    result: &OptimizationResult,
    metadata: &PortfolioMetadata,
  ) -> Result<(), PipelineError>;

  fn load(&self, id: &str) -> Result<Option<SavedPortfolio>, PipelineError>;

  /// Saved identifiers, sorted.
  fn list(&self) -> Result<Vec<String>, PipelineError>;
}

fn validate_id(id: &str) -> Result<&str, PipelineError> {
  let id = id.trim();
  if id.is_empty() {
    return Err(PipelineError::Persistence("portfolio id must not be empty".into()));
  }
  if id.contains(['/', '\\']) || id.starts_with('.') {
    return Err(PipelineError::Persistence(format!("invalid portfolio id '{id}'")));
  }
  Ok(id)
}

#[derive(Clone, Debug)]
pub struct JsonFileStore {
  root: PathBuf,
}

impl JsonFileStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn path_for(&self, id: &str) -> PathBuf {
    self.root.join(format!("{id}.json"))
  }
}

impl PortfolioStore for JsonFileStore {
  fn save(
    &self,
    id: &str,
    result: &OptimizationResult,
    metadata: &PortfolioMetadata,
  ) -> Result<(), PipelineError> {
    let id = validate_id(id)?;
    let snapshot = SavedPortfolio {
      portfolio_id: id.to_string(),
      result: result.clone(),
      metadata: metadata.clone(),
      saved_at: Utc::now(),
    };
    let body = serde_json::to_string_pretty(&snapshot)
      .map_err(|e| PipelineError::Persistence(e.to_string()))?;

    fs::create_dir_all(&self.root)
      .map_err(|e| PipelineError::Persistence(format!("{}: {e}", self.root.display())))?;
    let path = self.path_for(id);
    fs::write(&path, body)
      .map_err(|e| PipelineError::Persistence(format!("{}: {e}", path.display())))?;
    info!(id, path = %path.display(), "saved portfolio");
    Ok(())
  }

  fn load(&self, id: &str) -> Result<Option<SavedPortfolio>, PipelineError> {
    let id = validate_id(id)?;
    let path = self.path_for(id);
    let raw = match fs::read_to_string(&path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(PipelineError::Persistence(format!("{}: {e}", path.display()))),
    };
    serde_json::from_str(&raw)
      .map(Some)
      .map_err(|e| PipelineError::Persistence(format!("{}: {e}", path.display())))
  }

  fn list(&self) -> Result<Vec<String>, PipelineError> {
    let entries = match fs::read_dir(&self.root) {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => {
        return Err(PipelineError::Persistence(format!("{}: {e}", self.root.display())));
      }
    };

    let mut ids: Vec<String> = entries
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
      .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
      .collect();
    ids.sort();
    Ok(ids)
  }
}
