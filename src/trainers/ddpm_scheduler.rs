//! DDPM noise schedule used for training: forward diffusion, velocity targets and SNR.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::EngineError;

/// What the denoiser is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

impl PredictionType {
    pub fn parse(name: &str) -> std::result::Result<Self, EngineError> {
        match name {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" | "v-prediction" => Ok(Self::VPrediction),
            other => Err(EngineError::UnknownPredictionType(other.to_string())),
        }
    }
}

/// Mirrors the `scheduler/scheduler_config.json` of a diffusers checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdpmSchedulerConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
    /// Kept as written; checked every time a target is computed.
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.012
}

fn default_beta_schedule() -> String {
    "scaled_linear".to_string()
}

fn default_prediction_type() -> String {
    "epsilon".to_string()
}

impl Default for DdpmSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
        }
    }
}

impl DdpmSchedulerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scheduler config: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse scheduler config: {}", path.display()))
    }
}

pub struct DdpmScheduler {
    config: DdpmSchedulerConfig,
    alphas_cumprod_host: Vec<f64>,
    alphas_cumprod: Tensor,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DdpmScheduler {
    pub fn new(config: DdpmSchedulerConfig, device: &Device) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            anyhow::bail!("num_train_timesteps must be at least 2, got {}", n);
        }
        let betas = match config.beta_schedule.as_str() {
            "linear" => linear_betas(n, config.beta_start, config.beta_end),
            "scaled_linear" => scaled_linear_betas(n, config.beta_start, config.beta_end),
            "squaredcos_cap_v2" => cosine_betas(n),
            other => anyhow::bail!("Unsupported beta schedule: {}", other),
        };

        let mut alphas_cumprod_host = Vec::with_capacity(n);
        let mut acc = 1.0f64;
        for beta in &betas {
            acc *= 1.0 - beta;
            alphas_cumprod_host.push(acc);
        }

        let to_tensor = |values: Vec<f64>| -> Result<Tensor> {
            let values: Vec<f32> = values.into_iter().map(|v| v as f32).collect();
            Ok(Tensor::from_vec(values, n, device)?)
        };
        let sqrt_alphas_cumprod = to_tensor(alphas_cumprod_host.iter().map(|a| a.sqrt()).collect())?;
        let sqrt_one_minus_alphas_cumprod =
            to_tensor(alphas_cumprod_host.iter().map(|a| (1.0 - a).sqrt()).collect())?;
        let alphas_cumprod = to_tensor(alphas_cumprod_host.clone())?;

        Ok(Self {
            config,
            alphas_cumprod_host,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        })
    }

    pub fn config(&self) -> &DdpmSchedulerConfig {
        &self.config
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.config.num_train_timesteps
    }

    /// Fails with [`EngineError::UnknownPredictionType`] for anything but epsilon / v-prediction.
    pub fn prediction_type(&self) -> std::result::Result<PredictionType, EngineError> {
        PredictionType::parse(&self.config.prediction_type)
    }

    pub fn alphas_cumprod(&self) -> &Tensor {
        &self.alphas_cumprod
    }

    /// Cumulative alpha product at one timestep; `None` indexes the "previous" step of
    /// timestep 0, which is 1.
    pub fn alpha_cumprod_at(&self, timestep: Option<usize>) -> f64 {
        match timestep {
            Some(t) => self.alphas_cumprod_host[t.min(self.alphas_cumprod_host.len() - 1)],
            None => 1.0,
        }
    }

    fn gather(&self, table: &Tensor, timesteps: &Tensor, like: &Tensor) -> Result<Tensor> {
        let b = timesteps.dim(0)?;
        let idx = timesteps.to_dtype(DType::U32)?;
        let mut shape = vec![b];
        shape.extend(std::iter::repeat(1).take(like.rank().saturating_sub(1)));
        Ok(table.index_select(&idx, 0)?.reshape(shape)?.to_dtype(like.dtype())?)
    }

    /// `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise`
    pub fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let sqrt_alpha = self.gather(&self.sqrt_alphas_cumprod, timesteps, original_samples)?;
        let sqrt_one_minus = self.gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, original_samples)?;
        Ok((original_samples.broadcast_mul(&sqrt_alpha)? + noise.broadcast_mul(&sqrt_one_minus)?)?)
    }

    /// `sqrt(a_t) * noise - sqrt(1 - a_t) * x0`
    pub fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let sqrt_alpha = self.gather(&self.sqrt_alphas_cumprod, timesteps, sample)?;
        let sqrt_one_minus = self.gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, sample)?;
        Ok((noise.broadcast_mul(&sqrt_alpha)? - sample.broadcast_mul(&sqrt_one_minus)?)?)
    }
}

/// `a_t / (1 - a_t)` for each timestep, `[B]`.
pub fn compute_snr(timesteps: &Tensor, alphas_cumprod: &Tensor) -> Result<Tensor> {
    let idx = timesteps.to_dtype(DType::U32)?;
    let alphas = alphas_cumprod.index_select(&idx, 0)?.to_dtype(DType::F32)?;
    Ok((&alphas / (1.0 - &alphas)?)?)
}

fn linear_betas(n: usize, start: f64, end: f64) -> Vec<f64> {
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n as f64 - 1.0))
        .collect()
}

fn scaled_linear_betas(n: usize, start: f64, end: f64) -> Vec<f64> {
    let (start, end) = (start.sqrt(), end.sqrt());
    (0..n)
        .map(|i| {
            let t = start + (end - start) * i as f64 / (n as f64 - 1.0);
            t * t
        })
        .collect()
}

fn cosine_betas(n: usize) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
        })
        .collect()
}
