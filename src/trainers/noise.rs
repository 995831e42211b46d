//! Seeded randomness for a training step: Gaussian noise, latent sampling and timesteps.
//!
//! Every random draw of the engine goes through one [`NoiseSource`], so reseeding it makes
//! a step reproducible on any device.

use anyhow::Result;
use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Standard-normal f32 tensor.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(values, shape, device)?)
    }

    /// `n` draws from `U[0, 1)`.
    pub fn uniform(&mut self, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.rng.gen::<f64>()).collect()
    }

    pub fn gen_range(&mut self, upper: usize) -> usize {
        self.rng.gen_range(0..upper)
    }

    /// Noise shaped like `latents`. With a positive `offset_weight`, a per-example,
    /// per-channel constant scaled by the weight is added over the spatial dims.
    pub fn latent_noise(&mut self, latents: &Tensor, offset_weight: f64) -> Result<Tensor> {
        let device = latents.device();
        let noise = self.randn(latents.shape().clone(), device)?;
        if offset_weight <= 0.0 {
            return Ok(noise);
        }
        let (b, c, _, _) = latents.dims4()?;
        let offset = (self.randn((b, c, 1, 1), device)? * offset_weight)?;
        Ok(noise.broadcast_add(&offset)?)
    }
}

/// How training timesteps are drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSampling {
    /// `t = (1 - u^3) * T`, favouring noisier timesteps.
    #[default]
    Cubic,
    /// `t ~ U{0, .., T - 1}`.
    Uniform,
}

/// Map a uniform draw to a cubic-biased timestep in `[0, T - 1]`.
pub fn cubic_timestep(u: f64, num_train_timesteps: usize) -> i64 {
    let t = ((1.0 - u.powi(3)) * num_train_timesteps as f64) as i64;
    t.clamp(0, num_train_timesteps as i64 - 1)
}

impl TimestepSampling {
    /// `[B]` i64 timesteps.
    pub fn sample(
        self,
        noise: &mut NoiseSource,
        batch_size: usize,
        num_train_timesteps: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let timesteps: Vec<i64> = match self {
            Self::Cubic => noise
                .uniform(batch_size)
                .into_iter()
                .map(|u| cubic_timestep(u, num_train_timesteps))
                .collect(),
            Self::Uniform => (0..batch_size)
                .map(|_| noise.gen_range(num_train_timesteps) as i64)
                .collect(),
        };
        Ok(Tensor::from_vec(timesteps, batch_size, device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn cubic_timesteps_stay_in_range() {
        for i in 0..=1000 {
            let u = i as f64 / 1000.0;
            let t = cubic_timestep(u, 1000);
            assert!((0..=999).contains(&t), "u={u} gave t={t}");
        }
        assert_eq!(cubic_timestep(0.0, 1000), 999);
        assert_eq!(cubic_timestep(1.0, 1000), 0);
    }

    #[test]
    fn cubic_timesteps_fall_as_u_grows() {
        let ts: Vec<i64> = (0..=200).map(|i| cubic_timestep(i as f64 / 200.0, 1000)).collect();
        assert!(ts.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn cubic_sampling_favours_noisy_timesteps() -> Result<()> {
        let mut noise = NoiseSource::new(Some(0));
        let t = TimestepSampling::Cubic.sample(&mut noise, 2000, 1000, &Device::Cpu)?;
        let t = t.to_vec1::<i64>()?;
        let high = t.iter().filter(|&&x| x >= 500).count();
        // P(t >= 500) = P(u^3 <= 0.5) ~ 0.79
        assert!(high > 1400);
        Ok(())
    }

    #[test]
    fn uniform_sampling_covers_range_and_repeats_after_reseed() -> Result<()> {
        let device = Device::Cpu;
        let mut noise = NoiseSource::new(Some(3));
        let t = TimestepSampling::Uniform.sample(&mut noise, 4000, 10, &device)?;
        assert_eq!(t.dims(), &[4000]);
        assert_eq!(t.dtype(), DType::I64);
        let t = t.to_vec1::<i64>()?;
        assert!(t.iter().all(|x| (0..=9).contains(x)));
        // Every bucket is hit, and none is favoured the way the cubic draw favours high t.
        for bucket in 0..10 {
            let count = t.iter().filter(|&&x| x == bucket).count();
            assert!((250..=550).contains(&count), "bucket {bucket} drawn {count} times");
        }

        noise.reseed(11);
        let a = TimestepSampling::Uniform.sample(&mut noise, 16, 1000, &device)?.to_vec1::<i64>()?;
        noise.reseed(11);
        let b = TimestepSampling::Uniform.sample(&mut noise, 16, 1000, &device)?.to_vec1::<i64>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn reseed_repeats_draws() -> Result<()> {
        let device = Device::Cpu;
        let mut noise = NoiseSource::new(None);
        noise.reseed(42);
        let a = noise.randn((2, 3), &device)?.to_vec2::<f32>()?;
        noise.reseed(42);
        let b = noise.randn((2, 3), &device)?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn noise_offset_is_constant_over_space() -> Result<()> {
        let device = Device::Cpu;
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device)?;
        let mut plain = NoiseSource::new(Some(7));
        let mut offset = NoiseSource::new(Some(7));
        let base = plain.latent_noise(&latents, 0.0)?;
        let shifted = offset.latent_noise(&latents, 0.1)?;
        assert_eq!(shifted.dims(), latents.dims());

        // Same base draw, so the difference is the per-channel offset alone.
        let diff = (shifted - base)?;
        let spread = (diff.max_keepdim(3)?.max_keepdim(2)? - diff.min_keepdim(3)?.min_keepdim(2)?)?;
        assert!(spread.abs()?.max_all()?.to_scalar::<f32>()? < 1e-6);
        Ok(())
    }
}
