//! # Recurrent Forecast
//!
//! $$
//! z_t = \frac{r_t - \bar r}{s_r},\qquad
//! \hat z_{T+1} = f_\theta(z_{T-L+1}, \dots, z_T),\qquad
//! \hat\mu = \operatorname{clip}\big(252\,(\bar r + s_r \hat z_{T+1}),\ \pm c\big)
//! $$
//!
//! Stacked LSTM trained on standardized log-returns with a sliding window. The trained
//! network owns a [`VarMap`] that must be released explicitly with
//! [`RecurrentModel::release`]; `Drop` releases it as well.

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use candle_core::DType;
use candle_core::Device;
use candle_core::Tensor;
use candle_nn::AdamW;
use candle_nn::LSTM;
use candle_nn::LSTMConfig;
use candle_nn::Linear;
use candle_nn::Module;
use candle_nn::Optimizer;
use candle_nn::ParamsAdamW;
use candle_nn::RNN;
use candle_nn::VarBuilder;
use candle_nn::VarMap;
use candle_nn::linear;
use candle_nn::lstm;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;
use tracing::info;

use super::Forecaster;
use super::ModelOutcome;
use super::TRADING_DAYS;
use crate::config::RecurrentConfig;
use crate::stats::log_returns;
use crate::stats::valid_prices;

#[derive(Clone, Copy, Debug)]
struct ReturnScaler {
  mean: f32,
  std: f32,
}

impl ReturnScaler {
  fn fit(xs: &[f32]) -> Result<Self> {
    if xs.is_empty() {
      bail!("cannot fit scaler on an empty series");
    }
    let n = xs.len() as f32;
    let mean = xs.iter().sum::<f32>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    Ok(Self {
      mean,
      std: var.sqrt().max(1e-6),
    })
  }

  fn transform(&self, xs: &[f32]) -> Vec<f32> {
    xs.iter().map(|x| (x - self.mean) / self.std).collect()
  }

  fn inverse(&self, z: f32) -> f32 {
    z * self.std + self.mean
  }
}

struct LstmNet {
  layers: Vec<LSTM>,
  head: Linear,
  dropout: f32,
}

impl LstmNet {
  fn new(vs: VarBuilder, cfg: &RecurrentConfig) -> Result<Self> {
    if cfg.layers == 0 || cfg.units == 0 {
      bail!("recurrent network needs at least one layer and one unit");
    }

    let mut layers = Vec::with_capacity(cfg.layers);
    for i in 0..cfg.layers {
      let in_dim = if i == 0 { 1 } else { cfg.units };
      layers.push(lstm(
        in_dim,
        cfg.units,
        LSTMConfig::default(),
        vs.pp(format!("lstm_{i}")),
      )?);
    }
    let head = linear(cfg.units, 1, vs.pp("dense"))?;

    Ok(Self {
      layers,
      head,
      dropout: cfg.dropout,
    })
  }

  /// `xs` is `(batch, window, 1)`; returns `(batch, 1)`.
  fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
    let mut x = xs.clone();
    let last = self.layers.len() - 1;
    let mut h = None;

    for (i, layer) in self.layers.iter().enumerate() {
      let states = layer.seq(&x)?;
      if i == last {
        let state = states
          .last()
          .ok_or_else(|| candle_core::Error::Msg("empty input sequence".into()))?;
        h = Some(state.h().clone());
      } else {
        x = layer.states_to_tensor(&states)?;
        if train && self.dropout > 0.0 {
          x = candle_nn::ops::dropout(&x, self.dropout)?;
        }
      }
    }

    let mut h = h.ok_or_else(|| candle_core::Error::Msg("no recurrent layers".into()))?;
    if train && self.dropout > 0.0 {
      h = candle_nn::ops::dropout(&h, self.dropout)?;
    }
    self.head.forward(&h)
  }
}

/// Trained network plus the state needed to produce a vote.
pub struct RecurrentModel {
  device: Device,
  varmap: Option<VarMap>,
  net: Option<LstmNet>,
  scaler: ReturnScaler,
  window: usize,
  last_window: Vec<f32>,
}

impl RecurrentModel {
  /// Train on a price series.
  pub fn train(prices: &[f64], cfg: &RecurrentConfig) -> Result<Self> {
    if prices.len() < cfg.min_history {
      bail!("insufficient history ({} prices)", prices.len());
    }
    if cfg.batch_size == 0 {
      bail!("batch_size must be > 0");
    }

    let returns: Vec<f32> = log_returns(prices).iter().map(|&r| r as f32).collect();
    let scaler = ReturnScaler::fit(&returns)?;
    let scaled = scaler.transform(&returns);

    let window = cfg.max_window.min(scaled.len() / 3);
    if window == 0 {
      bail!("window collapsed to zero");
    }
    let n_seq = scaled.len() - window;
    if n_seq < cfg.min_sequences {
      bail!("insufficient sequences ({n_seq})");
    }

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let net = LstmNet::new(vs, cfg).context("failed to build recurrent network")?;

    let mut opt = AdamW::new(
      varmap.all_vars(),
      ParamsAdamW {
        lr: cfg.learning_rate,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-7,
        weight_decay: 0.0,
      },
    )?;

    let mut order: Vec<usize> = (0..n_seq).collect();
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut last_loss = f32::NAN;

    for _ in 0..cfg.epochs {
      order.shuffle(&mut rng);
      for batch in order.chunks(cfg.batch_size) {
        let mut xb = Vec::with_capacity(batch.len() * window);
        let mut yb = Vec::with_capacity(batch.len());
        for &start in batch {
          xb.extend_from_slice(&scaled[start..start + window]);
          yb.push(scaled[start + window]);
        }
        let xb = Tensor::from_vec(xb, (batch.len(), window, 1), &device)?;
        let yb = Tensor::from_vec(yb, (batch.len(), 1), &device)?;

        let pred = net.forward(&xb, true)?;
        let loss = candle_nn::loss::mse(&pred, &yb)?;
        opt.backward_step(&loss)?;
        last_loss = loss.to_scalar::<f32>()?;
      }
    }

    if !last_loss.is_finite() {
      bail!("training diverged");
    }
    debug!(window, sequences = n_seq, loss = last_loss, "recurrent model trained");

    Ok(Self {
      device,
      varmap: Some(varmap),
      net: Some(net),
      scaler,
      window,
      last_window: scaled[scaled.len() - window..].to_vec(),
    })
  }

  pub fn window(&self) -> usize {
    self.window
  }

  pub fn is_released(&self) -> bool {
    self.net.is_none() && self.varmap.is_none()
  }

  /// One-step-ahead daily log-return from the final observed window.
  pub fn predict_next(&self) -> Result<f64> {
    let net = self
      .net
      .as_ref()
      .ok_or_else(|| anyhow!("recurrent model was released"))?;
    let xt = Tensor::from_vec(self.last_window.clone(), (1, self.window, 1), &self.device)?;
    let z = net.forward(&xt, false)?.flatten_all()?.to_vec1::<f32>()?;
    let z = *z.first().ok_or_else(|| anyhow!("empty prediction"))?;
    Ok(self.scaler.inverse(z) as f64)
  }

  /// Drop every tensor and variable held by the model.
  pub fn release(&mut self) {
    let net = self.net.take();
    let varmap = self.varmap.take();
    if net.is_some() || varmap.is_some() {
      drop(net);
      drop(varmap);
      self.last_window = Vec::new();
      debug!("recurrent model released");
    }
  }
}

impl Drop for RecurrentModel {
  fn drop(&mut self) {
    self.release();
  }
}

/// Ensemble member wrapping [`RecurrentModel`].
#[derive(Clone, Debug)]
pub struct RecurrentForecaster {
  cfg: RecurrentConfig,
}

impl RecurrentForecaster {
  pub fn new(cfg: RecurrentConfig) -> Self {
    Self { cfg }
  }
}

impl Forecaster for RecurrentForecaster {
  fn name(&self) -> &'static str {
    "recurrent"
  }

  fn forecast(&self, prices: &[f64]) -> ModelOutcome {
    if !self.cfg.enabled {
      return ModelOutcome::OptedOut {
        reason: "disabled".into(),
      };
    }

    let prices = valid_prices(prices);
    let mut model = match RecurrentModel::train(&prices, &self.cfg) {
      Ok(model) => model,
      Err(err) => {
        info!(error = %err, "recurrent model opted out");
        return ModelOutcome::OptedOut {
          reason: err.to_string(),
        };
      }
    };

    let prediction = model.predict_next();
    model.release();

    match prediction {
      Ok(daily) => ModelOutcome::Fitted {
        value: (daily * TRADING_DAYS).clamp(-self.cfg.clip, self.cfg.clip),
      },
      Err(err) => ModelOutcome::OptedOut {
        reason: format!("prediction failed: {err}"),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn small_cfg() -> RecurrentConfig {
    RecurrentConfig {
      layers: 2,
      units: 4,
      epochs: 2,
      batch_size: 16,
      ..RecurrentConfig::default()
    }
  }

  fn noisy_prices(n: usize) -> Vec<f64> {
    (0..n)
      .map(|i| 100.0 * (1.0 + 0.02 * (i as f64 * 0.37).sin()) * 1.0005_f64.powi(i as i32))
      .collect()
  }

  #[test]
  fn window_is_a_third_of_short_histories() {
    let model = RecurrentModel::train(&noisy_prices(121), &small_cfg()).unwrap();
    assert_eq!(model.window(), 40);
  }

  #[test]
  fn release_frees_the_network() {
    let mut model = RecurrentModel::train(&noisy_prices(150), &small_cfg()).unwrap();
    assert!(model.predict_next().unwrap().is_finite());
    model.release();
    assert!(model.is_released());
    assert!(model.predict_next().is_err());
  }

  #[test]
  fn vote_is_finite_and_clipped() {
    let f = RecurrentForecaster::new(small_cfg());
    let vote = f.forecast(&noisy_prices(200)).vote().unwrap();
    assert!(vote.abs() <= 0.69 + 1e-9);
  }

  #[test]
  fn short_history_opts_out() {
    let f = RecurrentForecaster::new(small_cfg());
    assert!(matches!(
      f.forecast(&noisy_prices(50)),
      ModelOutcome::OptedOut { .. }
    ));
  }
}
