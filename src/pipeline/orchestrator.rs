//! # Orchestrator
//!
//! $$
//! P \xrightarrow{\text{forecast}} (\hat\mu, \hat u) \xrightarrow{\text{prior}} (\mu, \Sigma)
//! \xrightarrow{\text{frontier}} \mathbf w^\*
//! $$
//!
//! Resolves the universe, applies the ex-post guard, fetches and sanitizes prices, forecasts
//! every asset, builds the return prior and covariance, and solves. Any failure comes back as
//! a [`PipelineError`]; panics are caught at [`Pipeline::optimize`].

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::cache::NoCache;
use super::cache::ResultCache;
use super::cache::cache_key;
use super::cache::get_json;
use super::cache::put_json;
use super::progress::Progress;
use super::progress::ProgressCallback;
use super::progress::Stage;
use super::request::OptimizationRequest;
use super::request::OptimizationResult;
use super::store::JsonFileStore;
use super::store::PortfolioMetadata;
use super::store::PortfolioStore;
use super::store::SavedPortfolio;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::forecast::ForecastEngine;
use crate::forecast::ForecastMethod;
use crate::forecast::ForecastResult;
use crate::forecast::ForecastSource;
use crate::forecast::historical;
use crate::forecast::lightweight;
use crate::market::Acquirer;
use crate::market::MarketCapSource;
use crate::market::MarketDataSource;
use crate::market::PriceMatrix;
use crate::market::acquisition::fetch_with_timeout;
use crate::market::resolve;
use crate::market::sanitize;
use crate::portfolio::CovarianceEstimate;
use crate::portfolio::PortfolioEngine;
use crate::portfolio::PortfolioEngineConfig;
use crate::portfolio::PriorMethod;
use crate::portfolio::black_litterman::market_prior;
use crate::portfolio::black_litterman::market_risk_aversion;
use crate::portfolio::black_litterman::posterior;
use crate::scheduler::BatchScheduler;
use crate::stats::valid_prices;

#[derive(Serialize)]
struct PipelineKey<'a> {
  start: NaiveDate,
  end: NaiveDate,
  risk_free: f64,
  universe: &'a [String],
  target_return: Option<f64>,
  target_risk: Option<f64>,
  max_weight: f64,
  l2_gamma: f64,
  method: ForecastMethod,
  prior: PriorMethod,
}

/// Forecast-and-optimize pipeline over explicit collaborators.
pub struct Pipeline {
  config: PipelineConfig,
  source: Arc<dyn MarketDataSource>,
  caps: Arc<dyn MarketCapSource>,
  cache: Arc<dyn ResultCache>,
  store: Arc<dyn PortfolioStore>,
  scheduler: BatchScheduler,
  engine: Arc<ForecastEngine>,
}

impl Pipeline {
  /// Pipeline with caching disabled and a JSON store under `config.results_dir`.
  pub fn new(
    config: PipelineConfig,
    source: Arc<dyn MarketDataSource>,
    caps: Arc<dyn MarketCapSource>,
  ) -> Self {
    let store = Arc::new(JsonFileStore::new(config.results_dir.clone()));
    let scheduler = BatchScheduler::new(config.scheduler.clone());
    let engine = Arc::new(ForecastEngine::new(config.forecast.clone()));
    Self {
      config,
      source,
      caps,
      cache: Arc::new(NoCache),
      store,
      scheduler,
      engine,
    }
  }

  pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
    self.cache = cache;
    self
  }

  pub fn with_store(mut self, store: Arc<dyn PortfolioStore>) -> Self {
    self.store = store;
    self
  }

  pub fn with_scheduler(mut self, scheduler: BatchScheduler) -> Self {
    self.scheduler = scheduler;
    self
  }

  pub fn with_forecast_engine(mut self, engine: ForecastEngine) -> Self {
    self.engine = Arc::new(engine);
    self
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn saved_portfolios(&self) -> Result<Vec<String>, PipelineError> {
    self.store.list()
  }

  pub fn load_saved(&self, id: &str) -> Result<Option<SavedPortfolio>, PipelineError> {
    self.store.load(id)
  }

  /// Forecast method and prior actually used for `request`.
  ///
  /// End dates older than `ex_post_days` force historical CAGR forecasts without any market
  /// prior.
  pub fn effective_axes(&self, request: &OptimizationRequest) -> (ForecastMethod, PriorMethod) {
    let cutoff = self.config.today() - chrono::Duration::days(self.config.optimizer.ex_post_days);
    if request.end < cutoff {
      if request.forecast_method != ForecastMethod::Historical
        || request.prior != PriorMethod::HistoricalMpt
      {
        info!(
          end = %request.end,
          requested_method = %request.forecast_method,
          requested_prior = ?request.prior,
          "end date is more than {} days old, switching to ex-post historical optimization",
          self.config.optimizer.ex_post_days
        );
      }
      (ForecastMethod::Historical, PriorMethod::HistoricalMpt)
    } else {
      (request.forecast_method, request.prior)
    }
  }

  /// Run one optimization. Never panics; every failure is a [`PipelineError`].
  pub fn optimize(
    &self,
    request: &OptimizationRequest,
    progress: Option<&mut ProgressCallback<'_>>,
  ) -> Result<OptimizationResult, PipelineError> {
    let mut progress = Progress::new(progress);
    match catch_unwind(AssertUnwindSafe(|| self.run(request, &mut progress))) {
      Ok(result) => result,
      Err(panic) => {
        let msg = panic
          .downcast_ref::<&str>()
          .map(|s| s.to_string())
          .or_else(|| panic.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "unknown panic".to_string());
        error!(error = %msg, "optimization aborted unexpectedly");
        Err(PipelineError::Unexpected(msg))
      }
    }
  }

  fn run(
    &self,
    request: &OptimizationRequest,
    progress: &mut Progress<'_, '_>,
  ) -> Result<OptimizationResult, PipelineError> {
    let stats = self.cache.stats();
    info!(
      hits = stats.hits,
      misses = stats.misses,
      entries = stats.entries,
      hit_ratio = stats.hit_ratio(),
      bytes = stats.bytes,
      capacity_bytes = stats.capacity_bytes,
      "cache performance"
    );

    if request.load_if_available {
      if let Some(id) = request.portfolio_id.as_deref() {
        match self.store.load(id) {
          Ok(Some(saved)) => {
            info!(id, "returning previously saved result");
            progress.report(Stage::Optimize, 1, 1, "loaded saved portfolio");
            return Ok(saved.result);
          }
          Ok(None) => debug!(id, "no saved result, computing"),
          Err(err) => warn!(id, error = %err, "could not load saved result, computing"),
        }
      }
    }

    let universe = resolve(
      request.tickers.as_deref(),
      request.group.as_deref(),
      &self.config.ticker_groups,
    )?;
    let (method, prior) = self.effective_axes(request);

    let key = cache_key(
      "pipeline",
      &PipelineKey {
        start: request.start,
        end: request.end,
        risk_free: request.risk_free,
        universe: &universe,
        target_return: request.target_return,
        target_risk: request.target_risk,
        max_weight: request.max_weight,
        l2_gamma: request.l2_gamma,
        method,
        prior,
      },
    );

    let cached = key
      .as_deref()
      .and_then(|k| get_json::<OptimizationResult>(self.cache.as_ref(), k));
    let result = match cached {
      Some(hit) => {
        info!("pipeline cache hit");
        progress.report(Stage::Optimize, 1, 1, "cached result");
        hit
      }
      None => {
        let computed = self.compute(request, &universe, method, prior, progress)?;
        if let Some(k) = key.as_deref() {
          put_json(
            self.cache.as_ref(),
            k,
            &computed,
            Duration::from_secs(self.config.cache.pipeline_ttl_secs),
          );
        }
        computed
      }
    };

    Ok(self.persist(request, &universe, result))
  }

  fn compute(
    &self,
    request: &OptimizationRequest,
    universe: &[String],
    method: ForecastMethod,
    prior: PriorMethod,
    progress: &mut Progress<'_, '_>,
  ) -> Result<OptimizationResult, PipelineError> {
    info!(assets = universe.len(), %method, ?prior, "optimization started");

    progress.report(Stage::Fetch, 0, 1, "fetching prices");
    let prices = self.prices(universe, request.start, request.end);
    progress.report(Stage::Fetch, 1, 1, "prices fetched");
    if prices.is_empty() {
      warn!("no valid data for the requested tickers and date range");
      return Err(PipelineError::NoData(
        "could not fetch any valid data for the given tickers and date range".into(),
      ));
    }
    let assets = prices.assets().to_vec();

    let forecasts = self.forecasts(&prices, method, progress);
    let views: Vec<f64> = forecasts.iter().map(|f| f.expected_return).collect();
    let uncertainties: Vec<f64> = forecasts.iter().map(|f| f.uncertainty).collect();

    let covariance = CovarianceEstimate::from_prices(&prices, self.config.optimizer.trading_days);
    debug!(shrinkage = covariance.shrinkage, "shrinkage covariance");
    let (mu, cov) = match prior {
      PriorMethod::HistoricalMpt => (views, covariance.matrix),
      PriorMethod::Bayesian => self.blend(request, &assets, &views, &uncertainties, covariance.matrix),
    };

    progress.report(Stage::Optimize, 0, 1, "optimizing");
    let engine = PortfolioEngine::new(PortfolioEngineConfig {
      objective: request.objective(),
      risk_free: request.risk_free,
      constraints: request.constraints(),
      weight_epsilon: self.config.optimizer.weight_epsilon,
    });
    let solved = engine.optimize(&mu, &cov).map_err(|err| {
      warn!(error = %err, objective = request.objective().name(), "solver failed");
      PipelineError::from(err)
    })?;

    let weights: BTreeMap<String, f64> = assets
      .iter()
      .zip(solved.weights.iter())
      .filter(|(_, w)| **w > 0.0)
      .map(|(a, w)| (a.clone(), *w))
      .collect();

    let latest_prices: BTreeMap<String, f64> = weights
      .keys()
      .filter_map(|asset| {
        let quote = self
          .source
          .latest_close(asset)
          .filter(|p| p.is_finite() && *p > 0.0)
          .or_else(|| prices.latest(asset));
        if quote.is_none() {
          warn!(asset = %asset, "latest price unavailable");
        }
        quote.map(|p| (asset.clone(), p))
      })
      .collect();

    info!(
      holdings = weights.len(),
      expected_return = solved.expected_return,
      risk = solved.volatility,
      sharpe = solved.sharpe,
      "optimization complete"
    );
    progress.report(Stage::Optimize, 1, 1, "optimization complete");

    Ok(OptimizationResult {
      weights,
      expected_return: solved.expected_return,
      risk: solved.volatility,
      sharpe_ratio: solved.sharpe,
      latest_prices,
      portfolio_id: None,
    })
  }

  fn prices(&self, universe: &[String], start: NaiveDate, end: NaiveDate) -> PriceMatrix {
    let key = cache_key("prices", &(start, end, universe));
    if let Some(hit) = key
      .as_deref()
      .and_then(|k| get_json::<PriceMatrix>(self.cache.as_ref(), k))
    {
      info!(assets = hit.n_assets(), rows = hit.n_dates(), "price cache hit");
      return hit;
    }

    let acquirer = Acquirer::new(Arc::clone(&self.source), self.config.acquisition.clone());
    let raw = acquirer.fetch(universe, start, end);
    info!(assets = raw.n_assets(), rows = raw.n_dates(), "fetched price matrix");

    let clean = sanitize(&raw, self.config.acquisition.price_ceiling);
    let prices = clean.prices;
    info!(
      assets = prices.n_assets(),
      dropped = clean.dropped.len(),
      "sanitized price matrix"
    );

    if !prices.is_empty() {
      if let Some(k) = key.as_deref() {
        put_json(
          self.cache.as_ref(),
          k,
          &prices,
          Duration::from_secs(self.config.cache.prices_ttl_secs),
        );
      }
    }
    prices
  }

  fn forecasts(
    &self,
    prices: &PriceMatrix,
    method: ForecastMethod,
    progress: &mut Progress<'_, '_>,
  ) -> Vec<ForecastResult> {
    let cfg = self.engine.config();
    let series = prices.columns();
    let n = series.len();

    let out: Vec<ForecastResult> = match method {
      ForecastMethod::Historical => series.iter().map(|s| historical::forecast(s, cfg)).collect(),
      ForecastMethod::Lightweight => series.iter().map(|s| lightweight::forecast(s, cfg)).collect(),
      ForecastMethod::Ensemble => self.ensemble_forecasts(prices.assets(), series, progress),
    };
    progress.report(Stage::Forecast, n, n, "forecasts complete");
    out
  }

  fn ensemble_forecasts(
    &self,
    assets: &[String],
    series: Vec<Vec<f64>>,
    progress: &mut Progress<'_, '_>,
  ) -> Vec<ForecastResult> {
    let cache = self.cache.as_ref();
    let keys: Vec<Option<String>> = assets
      .iter()
      .zip(series.iter())
      .map(|(asset, s)| cache_key("forecast", &(asset, ForecastMethod::Ensemble, s)))
      .collect();

    let mut results: Vec<Option<ForecastResult>> = keys
      .iter()
      .map(|k| k.as_deref().and_then(|k| get_json(cache, k)))
      .collect();
    let missing: Vec<usize> = (0..results.len()).filter(|&i| results[i].is_none()).collect();
    info!(
      cached = results.len() - missing.len(),
      to_forecast = missing.len(),
      "ensemble forecasting"
    );

    let todo: Vec<Vec<f64>> = missing.iter().map(|&i| series[i].clone()).collect();
    let fresh = self
      .scheduler
      .forecast_assets(Arc::clone(&self.engine), todo, |done, total| {
        progress.report(Stage::Forecast, done, total, "forecasting assets")
      });

    let ttl = Duration::from_secs(self.config.cache.forecast_ttl_secs);
    for (&i, result) in missing.iter().zip(fresh) {
      if result.source != ForecastSource::Default {
        if let Some(k) = keys[i].as_deref() {
          put_json(cache, k, &result, ttl);
        }
      }
      results[i] = Some(result);
    }

    let neutral = ForecastResult::neutral(self.engine.config());
    results
      .into_iter()
      .map(|r| r.unwrap_or(neutral))
      .collect()
  }

  fn risk_aversion(&self, request: &OptimizationRequest) -> f64 {
    let opt = &self.config.optimizer;
    let index = fetch_with_timeout(
      &self.source,
      vec![opt.market_index.clone()],
      request.start,
      request.end,
      self.config.acquisition.single_timeout(),
    );
    let delta = index
      .ok()
      .and_then(|m| m.column(&opt.market_index))
      .and_then(|col| market_risk_aversion(&valid_prices(&col), request.risk_free, opt.trading_days));

    match delta {
      Some(delta) => {
        info!(delta, "market-implied risk aversion");
        delta
      }
      None => {
        warn!(
          delta = opt.default_risk_aversion,
          "market index unavailable, using default risk aversion"
        );
        opt.default_risk_aversion
      }
    }
  }

  /// Black-Litterman posterior, or the raw forecasts when blending is not possible.
  fn blend(
    &self,
    request: &OptimizationRequest,
    assets: &[String],
    views: &[f64],
    uncertainties: &[f64],
    cov: Vec<Vec<f64>>,
  ) -> (Vec<f64>, Vec<Vec<f64>>) {
    let caps = match self.caps.fetch_caps(assets) {
      Ok(caps) => caps,
      Err(err) => {
        warn!(error = %err, "market caps unavailable, using forecasts without market prior");
        return (views.to_vec(), cov);
      }
    };
    let caps: Option<Vec<f64>> = assets
      .iter()
      .map(|a| caps.get(a).copied().filter(|c| c.is_finite() && *c > 0.0))
      .collect();
    let Some(caps) = caps else {
      warn!("market caps missing for some assets, using forecasts without market prior");
      return (views.to_vec(), cov);
    };

    let delta = self.risk_aversion(request);
    let opt = &self.config.optimizer;
    let blended = market_prior(&caps, &cov, delta, request.risk_free).and_then(|pi| {
      posterior(
        &pi,
        &cov,
        views,
        uncertainties,
        opt.tau,
        self.engine.config().uncertainty_floor,
      )
    });

    match blended {
      Ok(post) => {
        info!(delta, tau = opt.tau, "applied Black-Litterman market prior");
        (post.mu, post.cov)
      }
      Err(err) => {
        warn!(error = %err, "Black-Litterman failed, using forecasts without market prior");
        (views.to_vec(), cov)
      }
    }
  }

  fn persist(
    &self,
    request: &OptimizationRequest,
    universe: &[String],
    mut result: OptimizationResult,
  ) -> OptimizationResult {
    if !request.persist {
      return result;
    }
    match request.portfolio_id.as_deref() {
      Some(id) => {
        let metadata = PortfolioMetadata::from_request(request, universe);
        match self.store.save(id, &result, &metadata) {
          Ok(()) => result.portfolio_id = Some(id.to_string()),
          Err(err) => error!(id, error = %err, "failed to persist portfolio"),
        }
      }
      None => warn!("persist requested without a portfolio id, skipping save"),
    }
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ForecastConfig;
  use crate::forecast::EnsembleMember;
  use crate::forecast::autoregressive::AutoregressiveForecaster;
  use crate::market::StaticSource;
  use crate::pipeline::MemoryCache;
  use anyhow::Result;
  use chrono::Datelike;
  use chrono::Weekday;
  use std::collections::HashMap;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use tracing_test::traced_test;

  struct CountingSource {
    inner: StaticSource,
    fetches: AtomicUsize,
  }

  impl MarketDataSource for CountingSource {
    fn fetch(&self, assets: &[String], start: NaiveDate, end: NaiveDate) -> Result<PriceMatrix> {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      self.inner.fetch(assets, start, end)
    }

    fn latest_close(&self, asset: &str) -> Option<f64> {
      (asset == "AAPL").then_some(250.0)
    }
  }

  struct CountingCaps {
    caps: HashMap<String, f64>,
    calls: AtomicUsize,
  }

  impl MarketCapSource for CountingCaps {
    fn fetch_caps(&self, assets: &[String]) -> Result<HashMap<String, f64>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(
        assets
          .iter()
          .filter_map(|a| self.caps.get(a).map(|c| (a.clone(), *c)))
          .collect(),
      )
    }
  }

  struct PanickingCaps;

  impl MarketCapSource for PanickingCaps {
    fn fetch_caps(&self, _assets: &[String]) -> Result<HashMap<String, f64>> {
      panic!("caps backend exploded")
    }
  }

  struct FailingCaps;

  impl MarketCapSource for FailingCaps {
    fn fetch_caps(&self, _assets: &[String]) -> Result<HashMap<String, f64>> {
      anyhow::bail!("caps service unreachable")
    }
  }

  fn business_days(n: usize) -> Vec<NaiveDate> {
    let mut d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
      if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
        out.push(d);
      }
      d = d.succ_opt().unwrap();
    }
    out
  }

  fn market() -> PriceMatrix {
    let dates = business_days(200);
    let mut series = std::collections::BTreeMap::new();
    let aapl: Vec<(NaiveDate, f64)> = dates
      .iter()
      .enumerate()
      .map(|(i, d)| (*d, 100.0 + 0.3 * i as f64 + 2.0 * (0.7 * i as f64).sin()))
      .collect();
    let goog: Vec<(NaiveDate, f64)> = dates
      .iter()
      .enumerate()
      .map(|(i, d)| (*d, 100.0 - 0.1 * i as f64 + 3.0 * (0.45 * i as f64).cos()))
      .collect();
    let index: Vec<(NaiveDate, f64)> = dates
      .iter()
      .enumerate()
      .map(|(i, d)| (*d, 4000.0 + 2.0 * i as f64 + 25.0 * (0.3 * i as f64).sin()))
      .collect();
    series.insert("AAPL".to_string(), aapl);
    series.insert("GOOG".to_string(), goog);
    series.insert("^GSPC".to_string(), index);
    PriceMatrix::from_series(series)
  }

  struct Fixture {
    source: Arc<CountingSource>,
    caps: Arc<CountingCaps>,
    config: PipelineConfig,
    start: NaiveDate,
    end: NaiveDate,
  }

  fn fixture(as_of_offset_days: i64) -> Fixture {
    let prices = market();
    let start = prices.dates()[0];
    let end = *prices.dates().last().unwrap();
    let mut caps = HashMap::new();
    caps.insert("AAPL".to_string(), 3.0e12);
    caps.insert("GOOG".to_string(), 2.0e12);
    let dir = std::env::temp_dir().join("portfolio-rs-orchestrator-tests");
    Fixture {
      source: Arc::new(CountingSource {
        inner: StaticSource::new(prices),
        fetches: AtomicUsize::new(0),
      }),
      caps: Arc::new(CountingCaps {
        caps,
        calls: AtomicUsize::new(0),
      }),
      config: PipelineConfig {
        as_of: Some(end + chrono::Duration::days(as_of_offset_days)),
        results_dir: dir,
        ..PipelineConfig::default()
      },
      start,
      end,
    }
  }

  impl Fixture {
    fn pipeline(&self) -> Pipeline {
      Pipeline::new(self.config.clone(), self.source.clone(), self.caps.clone())
    }

    fn request(&self, method: ForecastMethod, prior: PriorMethod) -> OptimizationRequest {
      OptimizationRequest {
        forecast_method: method,
        prior,
        max_weight: 0.6,
        ..OptimizationRequest::new(self.start, self.end).with_tickers(&["AAPL", "GOOG"])
      }
    }
  }

  #[test]
  fn lightweight_mpt_respects_bounds() {
    let fx = fixture(1);
    let res = fx
      .pipeline()
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::HistoricalMpt), None)
      .unwrap();

    assert!(res.total_weight() <= 1.0 + 1e-9);
    assert!(res.weights.values().all(|w| *w >= 0.0 && *w <= 0.6 + 1e-9));
    assert!(res.risk.is_finite() && res.sharpe_ratio.is_finite());
    assert_eq!(fx.caps.calls.load(Ordering::SeqCst), 0);
    for asset in res.weights.keys() {
      assert!(res.latest_prices.contains_key(asset));
    }
    if res.weights.contains_key("AAPL") {
      assert_eq!(res.latest_prices["AAPL"], 250.0);
    }
  }

  #[test]
  fn bayesian_prior_changes_values_not_schema() {
    let fx = fixture(1);
    let pipeline = fx.pipeline();
    let mpt = pipeline
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::HistoricalMpt), None)
      .unwrap();
    let bl = pipeline
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::Bayesian), None)
      .unwrap();

    assert_eq!(fx.caps.calls.load(Ordering::SeqCst), 1);
    assert!(
      (mpt.expected_return - bl.expected_return).abs() > 1e-9 || (mpt.risk - bl.risk).abs() > 1e-9
    );

    let keys = |r: &OptimizationResult| -> Vec<String> {
      serde_json::to_value(r)
        .unwrap()
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect()
    };
    assert_eq!(keys(&mpt), keys(&bl));
  }

  #[test]
  #[traced_test]
  fn missing_cap_for_any_asset_uses_raw_forecasts() {
    let fx = fixture(1);
    let partial = Arc::new(CountingCaps {
      caps: HashMap::from([("AAPL".to_string(), 3.0e12)]),
      calls: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::new(fx.config.clone(), fx.source.clone(), partial.clone());

    let mpt = pipeline
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::HistoricalMpt), None)
      .unwrap();
    let bayesian = pipeline
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::Bayesian), None)
      .unwrap();

    assert_eq!(partial.calls.load(Ordering::SeqCst), 1);
    assert_eq!(bayesian, mpt);
    assert!(logs_contain("market caps missing for some assets"));
    assert!(!logs_contain("applied Black-Litterman market prior"));
  }

  #[test]
  #[traced_test]
  fn caps_error_uses_raw_forecasts() {
    let fx = fixture(1);
    let pipeline = Pipeline::new(fx.config.clone(), fx.source.clone(), Arc::new(FailingCaps));

    let mpt = pipeline
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::HistoricalMpt), None)
      .unwrap();
    let bayesian = pipeline
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::Bayesian), None)
      .unwrap();

    assert_eq!(bayesian, mpt);
    assert!(logs_contain("market caps unavailable"));
    assert!(logs_contain("caps service unreachable"));
    assert!(!logs_contain("applied Black-Litterman market prior"));
  }

  #[test]
  #[traced_test]
  fn missing_market_index_uses_default_risk_aversion() {
    let fx = fixture(1);
    let without_index = market().select(&["AAPL".to_string(), "GOOG".to_string()]);
    let pipeline = Pipeline::new(
      fx.config.clone(),
      Arc::new(StaticSource::new(without_index)),
      fx.caps.clone(),
    );

    let res = pipeline
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::Bayesian), None)
      .unwrap();

    assert!(!res.weights.is_empty());
    assert!(logs_contain("market index unavailable, using default risk aversion"));
    assert!(logs_contain("delta=2.5"));
    assert!(logs_contain("applied Black-Litterman market prior"));
  }

  #[test]
  #[traced_test]
  fn ex_post_request_skips_market_prior() {
    let fx = fixture(200);
    let res = fx
      .pipeline()
      .optimize(&fx.request(ForecastMethod::Ensemble, PriorMethod::Bayesian), None)
      .unwrap();

    assert_eq!(fx.caps.calls.load(Ordering::SeqCst), 0);
    assert!(!res.weights.is_empty());
    assert!(logs_contain("ex-post historical optimization"));
    assert!(!logs_contain("Black-Litterman"));
  }

  #[test]
  fn unreachable_target_return_is_infeasible() {
    let fx = fixture(1);
    let request = OptimizationRequest {
      target_return: Some(5.0),
      ..fx.request(ForecastMethod::Historical, PriorMethod::HistoricalMpt)
    };
    let err = fx.pipeline().optimize(&request, None).unwrap_err();
    assert_eq!(err.kind(), "infeasible");
    assert!(err.is_user_facing());
  }

  #[test]
  fn cached_rerun_is_bit_identical_without_refetch() {
    let fx = fixture(1);
    let pipeline = fx.pipeline().with_cache(Arc::new(MemoryCache::new()));
    let request = fx.request(ForecastMethod::Lightweight, PriorMethod::Bayesian);

    let first = pipeline.optimize(&request, None).unwrap();
    let fetches = fx.source.fetches.load(Ordering::SeqCst);
    assert!(fetches > 0);

    let second = pipeline.optimize(&request, None).unwrap();
    assert_eq!(fx.source.fetches.load(Ordering::SeqCst), fetches);
    assert_eq!(first, second);
    assert_eq!(first.expected_return.to_bits(), second.expected_return.to_bits());
    assert_eq!(first.risk.to_bits(), second.risk.to_bits());
  }

  #[test]
  fn ensemble_forecasts_are_cached_per_asset() {
    let fx = fixture(1);
    let cfg = ForecastConfig::default();
    let engine = ForecastEngine::with_members(
      cfg.clone(),
      vec![EnsembleMember::Autoregressive(AutoregressiveForecaster::new(
        cfg.autoregressive.clone(),
        cfg.horizon,
      ))],
    );
    let cache = Arc::new(MemoryCache::new());
    let pipeline = fx
      .pipeline()
      .with_cache(cache.clone())
      .with_forecast_engine(engine);

    let mut ticks: Vec<f64> = Vec::new();
    let mut sink = |current: f64, _total: f64, _msg: &str| ticks.push(current);
    let request = fx.request(ForecastMethod::Ensemble, PriorMethod::HistoricalMpt);
    pipeline
      .optimize(&request, Some(&mut sink as &mut ProgressCallback<'_>))
      .unwrap();

    let hits_before = cache.stats().hits;
    let other = OptimizationRequest {
      risk_free: 0.01,
      ..request
    };
    pipeline.optimize(&other, None).unwrap();
    // prices plus both assets' forecasts
    assert_eq!(cache.stats().hits - hits_before, 3);

    assert!(ticks.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(ticks.last().copied(), Some(100.0));
  }

  #[test]
  #[traced_test]
  fn persistence_round_trip_and_short_circuit() {
    let fx = fixture(1);
    let dir = tempfile::tempdir().unwrap();
    let pipeline = fx
      .pipeline()
      .with_store(Arc::new(JsonFileStore::new(dir.path())));

    let request = OptimizationRequest {
      portfolio_id: Some("core".into()),
      persist: true,
      ..fx.request(ForecastMethod::Lightweight, PriorMethod::HistoricalMpt)
    };
    let saved = pipeline.optimize(&request, None).unwrap();
    assert_eq!(saved.portfolio_id.as_deref(), Some("core"));
    assert_eq!(pipeline.saved_portfolios().unwrap(), vec!["core"]);

    let fetches = fx.source.fetches.load(Ordering::SeqCst);
    let reload = OptimizationRequest {
      persist: false,
      load_if_available: true,
      ..request.clone()
    };
    let loaded = pipeline.optimize(&reload, None).unwrap();
    assert_eq!(fx.source.fetches.load(Ordering::SeqCst), fetches);
    assert_eq!(loaded.weights, saved.weights);

    let anonymous = OptimizationRequest {
      portfolio_id: None,
      ..request
    };
    pipeline.optimize(&anonymous, None).unwrap();
    assert!(logs_contain("persist requested without a portfolio id"));
  }

  #[test]
  fn structured_errors_for_bad_universe_missing_data_and_panics() {
    let fx = fixture(1);
    let pipeline = fx.pipeline();

    let no_universe = OptimizationRequest::new(fx.start, fx.end);
    assert_eq!(
      pipeline.optimize(&no_universe, None).unwrap_err().kind(),
      "invalid_universe"
    );

    let unknown = OptimizationRequest::new(fx.start, fx.end).with_tickers(&["ZZZZ"]);
    assert_eq!(pipeline.optimize(&unknown, None).unwrap_err().kind(), "no_data");

    let exploding = Pipeline::new(fx.config.clone(), fx.source.clone(), Arc::new(PanickingCaps));
    let err = exploding
      .optimize(&fx.request(ForecastMethod::Lightweight, PriorMethod::Bayesian), None)
      .unwrap_err();
    assert_eq!(err.kind(), "unexpected");
    assert!(err.to_string().contains("caps backend exploded"));
  }
}
