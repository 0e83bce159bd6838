//! # Sanitization
//!
//! Removes numerical pathologies before prices reach the estimators: infinities and
//! non-positive prices become gaps, gaps are filled forward then backward, and any column that
//! still has a gap or a price above the ceiling is dropped. Applying it twice is a no-op.

use tracing::warn;

use super::matrix::PriceMatrix;

/// Cleaned matrix plus the assets removed along the way.
#[derive(Clone, Debug)]
pub struct Sanitized {
  pub prices: PriceMatrix,
  pub dropped: Vec<String>,
}

pub fn sanitize(prices: &PriceMatrix, price_ceiling: f64) -> Sanitized {
  let mut m = prices.clone();
  m.map_inplace(|v| {
    if !v.is_finite() || *v <= 0.0 {
      *v = f64::NAN;
    }
  });
  m.forward_fill();
  m.backward_fill();

  let dropped = m.retain_columns(|_, col| col.iter().all(|v| !v.is_nan() && *v <= price_ceiling));
  if !dropped.is_empty() {
    warn!(?dropped, "dropped assets with missing or corrupt prices");
  }
  m.drop_empty_rows();

  Sanitized { prices: m, dropped }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::NaiveDate;
  use ndarray::array;

  fn matrix() -> PriceMatrix {
    let dates: Vec<NaiveDate> = (1..=4)
      .map(|d| NaiveDate::from_ymd_opt(2024, 2, d).unwrap())
      .collect();
    let values = array![
      [f64::NAN, 10.0, 1.0, f64::NAN],
      [100.0, f64::INFINITY, 2.0, f64::NAN],
      [-5.0, 11.0, 2e8, f64::NAN],
      [102.0, 12.0, 3.0, f64::NAN],
    ];
    PriceMatrix::new(
      dates,
      vec!["A".into(), "B".into(), "C".into(), "D".into()],
      values,
    )
    .unwrap()
  }

  #[test]
  fn fills_gaps_and_drops_corrupt_columns() {
    let out = sanitize(&matrix(), 1e8);
    assert_eq!(out.prices.assets(), &["A".to_string(), "B".to_string()]);
    assert_eq!(out.dropped, vec!["C".to_string(), "D".to_string()]);
    assert_eq!(out.prices.column("A").unwrap(), vec![100.0, 100.0, 100.0, 102.0]);
    assert_eq!(out.prices.column("B").unwrap(), vec![10.0, 10.0, 11.0, 12.0]);
  }

  #[test]
  fn sanitize_is_idempotent() {
    let once = sanitize(&matrix(), 1e8);
    let twice = sanitize(&once.prices, 1e8);
    assert_eq!(once.prices, twice.prices);
    assert!(twice.dropped.is_empty());
  }
}
