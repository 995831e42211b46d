//! Deterministic DDIM sampling over the training noise schedule, with classifier-free
//! guidance.

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::ddpm_scheduler::{DdpmScheduler, PredictionType};

fn default_num_inference_steps() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: default_num_inference_steps(),
        }
    }
}

/// DDIM with `eta = 0`: every step is a deterministic function of the model output.
pub struct DdimSampler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    prediction_type: PredictionType,
}

impl DdimSampler {
    /// Evenly spaced timesteps from the noisiest down to 0. Fails on an unknown
    /// prediction type before any denoising happens.
    pub fn new(scheduler: &DdpmScheduler, num_inference_steps: usize) -> Result<Self> {
        let prediction_type = scheduler.prediction_type()?;
        let train_steps = scheduler.num_train_timesteps();
        let steps = num_inference_steps.clamp(1, train_steps);
        let step_ratio = train_steps / steps;
        let timesteps: Vec<usize> = (0..steps).rev().map(|i| i * step_ratio).collect();
        let alphas_cumprod = (0..train_steps)
            .map(|t| scheduler.alpha_cumprod_at(Some(t)))
            .collect();
        Ok(Self {
            timesteps,
            alphas_cumprod,
            prediction_type,
        })
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Move `sample` from `timesteps()[index]` to the next (less noisy) timestep.
    pub fn step(&self, model_output: &Tensor, index: usize, sample: &Tensor) -> Result<Tensor> {
        let t = self.timesteps[index];
        let alpha_prod_t = self.alphas_cumprod[t];
        let alpha_prod_t_prev = self
            .timesteps
            .get(index + 1)
            .map(|&prev| self.alphas_cumprod[prev])
            .unwrap_or(1.0);
        let (sqrt_a, sqrt_b) = (alpha_prod_t.sqrt(), (1.0 - alpha_prod_t).sqrt());

        let (pred_original, pred_epsilon) = match self.prediction_type {
            PredictionType::Epsilon => {
                let x0 = ((sample - (model_output * sqrt_b)?)? / sqrt_a)?;
                (x0, model_output.clone())
            }
            PredictionType::VPrediction => {
                let x0 = ((sample * sqrt_a)? - (model_output * sqrt_b)?)?;
                let eps = ((model_output * sqrt_a)? + (sample * sqrt_b)?)?;
                (x0, eps)
            }
        };

        let direction = (pred_epsilon * (1.0 - alpha_prod_t_prev).sqrt())?;
        Ok(((pred_original * alpha_prod_t_prev.sqrt())? + direction)?)
    }
}

/// `uncond + scale * (cond - uncond)` on a prediction batched as `[uncond; cond]`.
pub fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, cond) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((cond - uncond)? * guidance_scale)?)?)
}
