//! Diffusion training losses.
//!
//! The loss is chosen once from configuration. Both variants compute in f32 whatever the
//! compute precision of the networks, and accept an optional per-example weight (the
//! prior-preservation split).

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use super::ddpm_scheduler::compute_snr;

fn default_loss_weight() -> f64 {
    1.0
}

fn default_snr_gamma() -> f64 {
    5.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiffusionLoss {
    /// Mean squared error.
    L2 {
        #[serde(default = "default_loss_weight")]
        loss_weight: f64,
    },
    /// Min-SNR-gamma reweighted squared error: each example's error is scaled by
    /// `min(snr_t, gamma) / snr_t`.
    SnrL2 {
        #[serde(default = "default_snr_gamma")]
        snr_gamma: f64,
        #[serde(default = "default_loss_weight")]
        loss_weight: f64,
    },
}

impl Default for DiffusionLoss {
    fn default() -> Self {
        Self::L2 { loss_weight: 1.0 }
    }
}

/// Everything a loss may look at for one step.
pub struct LossInputs<'a> {
    pub pred: &'a Tensor,
    pub target: &'a Tensor,
    /// `[B]` or `[B, 1, 1, 1]`.
    pub weight: Option<&'a Tensor>,
    pub timesteps: &'a Tensor,
    pub alphas_cumprod: &'a Tensor,
}

/// Per-example mean of `(pred - target)^2`, `[B]`.
fn per_example_mse(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let b = pred.dim(0)?;
    let sq = pred.to_dtype(DType::F32)?.sub(&target.to_dtype(DType::F32)?)?.sqr()?;
    Ok(sq.reshape((b, ()))?.mean(1)?)
}

fn apply_weight(loss: Tensor, weight: Option<&Tensor>) -> Result<Tensor> {
    match weight {
        Some(w) => Ok(loss.mul(&w.to_dtype(DType::F32)?.flatten_all()?)?),
        None => Ok(loss),
    }
}

impl DiffusionLoss {
    pub fn name(&self) -> &'static str {
        match self {
            Self::L2 { .. } => "l2",
            Self::SnrL2 { .. } => "snr_l2",
        }
    }

    /// Scalar (zero-dimensional) f32 loss.
    pub fn compute(&self, inputs: &LossInputs<'_>) -> Result<Tensor> {
        let per_example = per_example_mse(inputs.pred, inputs.target)?;
        let (loss, loss_weight) = match self {
            Self::L2 { loss_weight } => (apply_weight(per_example, inputs.weight)?, *loss_weight),
            Self::SnrL2 {
                snr_gamma,
                loss_weight,
            } => {
                let snr = compute_snr(inputs.timesteps, inputs.alphas_cumprod)?;
                let snr_weights = (snr.clamp(0f32, *snr_gamma as f32)? / &snr)?;
                let loss = per_example.mul(&snr_weights)?;
                (apply_weight(loss, inputs.weight)?, *loss_weight)
            }
        };
        Ok((loss.mean_all()? * loss_weight)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::ddpm_scheduler::{DdpmScheduler, DdpmSchedulerConfig};
    use candle_core::Device;

    fn fixtures(device: &Device) -> Result<(Tensor, Tensor, Tensor, DdpmScheduler)> {
        let pred = Tensor::new(&[[1f32, 1.0], [3.0, 3.0]], device)?;
        let target = Tensor::zeros((2, 2), DType::F32, device)?;
        let timesteps = Tensor::new(&[10i64, 900], device)?;
        let scheduler = DdpmScheduler::new(DdpmSchedulerConfig::default(), device)?;
        Ok((pred, target, timesteps, scheduler))
    }

    #[test]
    fn l2_unweighted_is_plain_mse() -> Result<()> {
        let device = Device::Cpu;
        let (pred, target, timesteps, scheduler) = fixtures(&device)?;
        let loss = DiffusionLoss::default().compute(&LossInputs {
            pred: &pred,
            target: &target,
            weight: None,
            timesteps: &timesteps,
            alphas_cumprod: scheduler.alphas_cumprod(),
        })?;
        assert_eq!(loss.dims(), &[] as &[usize]);
        assert!((loss.to_scalar::<f32>()? - 5.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn l2_prior_weight_scales_second_half() -> Result<()> {
        let device = Device::Cpu;
        let (pred, target, timesteps, scheduler) = fixtures(&device)?;
        let weight = Tensor::new(&[1f32, 0.5], &device)?.reshape((2, 1, 1, 1))?;
        let loss = DiffusionLoss::L2 { loss_weight: 2.0 }.compute(&LossInputs {
            pred: &pred,
            target: &target,
            weight: Some(&weight),
            timesteps: &timesteps,
            alphas_cumprod: scheduler.alphas_cumprod(),
        })?;
        // ((1 * 1) + (9 * 0.5)) / 2 * 2
        assert!((loss.to_scalar::<f32>()? - 5.5).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn snr_weighting_caps_low_noise_examples() -> Result<()> {
        let device = Device::Cpu;
        let (pred, target, timesteps, scheduler) = fixtures(&device)?;
        let loss = DiffusionLoss::SnrL2 {
            snr_gamma: 5.0,
            loss_weight: 1.0,
        }
        .compute(&LossInputs {
            pred: &pred,
            target: &target,
            weight: None,
            timesteps: &timesteps,
            alphas_cumprod: scheduler.alphas_cumprod(),
        })?;

        let snr = compute_snr(&timesteps, scheduler.alphas_cumprod())?.to_vec1::<f32>()?;
        let w: Vec<f32> = snr.iter().map(|s| s.min(5.0) / s).collect();
        let expected = (1.0 * w[0] + 9.0 * w[1]) / 2.0;
        assert!((loss.to_scalar::<f32>()? - expected).abs() < 1e-4);
        // t = 10 has snr far above gamma, t = 900 far below.
        assert!(w[0] < 1.0);
        assert!((w[1] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn config_tags() -> Result<()> {
        let loss: DiffusionLoss = serde_yaml::from_str("type: snr_l2\n")?;
        assert_eq!(
            loss,
            DiffusionLoss::SnrL2 {
                snr_gamma: 5.0,
                loss_weight: 1.0
            }
        );
        Ok(())
    }
}
