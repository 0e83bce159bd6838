//! # Universe Resolution
//!
//! Turns an explicit ticker list or a named group into a clean, de-duplicated list of asset
//! identifiers. Malformed entries are dropped with a warning.

use std::collections::BTreeMap;
use std::collections::HashSet;

use tracing::warn;

use crate::error::PipelineError;

const MAX_TICKER_LEN: usize = 20;

fn is_valid_ticker(t: &str) -> bool {
  !t.is_empty()
    && t.len() <= MAX_TICKER_LEN
    && t
      .chars()
      .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '^'))
}

/// Strip formatting artifacts and upper-case a single ticker.
pub fn clean_ticker(raw: &str) -> String {
  raw
    .trim()
    .chars()
    .filter(|c| !matches!(c, '"' | '\'' | '[' | ']' | ',' | '(' | ')'))
    .collect::<String>()
    .trim()
    .to_uppercase()
}

/// Clean, validate and de-duplicate tickers, preserving first-seen order.
pub fn sanitize_tickers<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
  let mut seen = HashSet::new();
  let mut out = Vec::with_capacity(raw.len());
  for r in raw {
    let t = clean_ticker(r.as_ref());
    if !is_valid_ticker(&t) {
      warn!(ticker = r.as_ref(), "dropping invalid ticker");
      continue;
    }
    if seen.insert(t.clone()) {
      out.push(t);
    }
  }
  out
}

/// Resolve an explicit list (preferred) or a named group into sanitized tickers.
pub fn resolve(
  tickers: Option<&[String]>,
  group: Option<&str>,
  groups: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<String>, PipelineError> {
  let raw: &[String] = match (tickers, group) {
    (Some(list), _) if !list.is_empty() => list,
    (_, Some(name)) => groups
      .get(name)
      .map(|v| v.as_slice())
      .ok_or_else(|| PipelineError::InvalidUniverse(format!("unknown ticker group '{name}'")))?,
    _ => {
      return Err(PipelineError::InvalidUniverse(
        "either a ticker list or a ticker group is required".into(),
      ));
    }
  };

  let clean = sanitize_tickers(raw);
  if clean.is_empty() {
    return Err(PipelineError::InvalidUniverse(
      "no valid tickers after sanitization".into(),
    ));
  }
  Ok(clean)
}
