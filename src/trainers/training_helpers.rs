//! Optimizer-side helpers for the training runner: learning-rate schedules, gradient
//! accumulation and gradient-norm clipping.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};
use std::collections::HashMap;

/// Learning rate as a function of the optimizer step.
pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f64;
}

/// Build a schedule by name: `constant`, `linear`, `cosine` or `polynomial`, each with a
/// linear warmup.
pub fn create_scheduler(
    scheduler_type: &str,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: Option<usize>,
    power: Option<f64>,
) -> Result<Box<dyn LRScheduler>> {
    let warmup = Warmup {
        base_lr,
        warmup_steps,
        total_steps,
    };
    match scheduler_type {
        "constant" => Ok(Box::new(ConstantScheduler { warmup })),
        "linear" => Ok(Box::new(LinearScheduler { warmup })),
        "cosine" => Ok(Box::new(CosineScheduler {
            warmup,
            num_cycles: num_cycles.unwrap_or(1),
        })),
        "polynomial" => Ok(Box::new(PolynomialScheduler {
            warmup,
            power: power.unwrap_or(1.0),
        })),
        other => anyhow::bail!("Unknown lr scheduler: {}", other),
    }
}

struct Warmup {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl Warmup {
    /// `Err(lr)` while warming up, otherwise `Ok(progress)` in `[0, 1]`.
    fn phase(&self, step: usize) -> std::result::Result<f64, f64> {
        if step < self.warmup_steps {
            return Err(self.base_lr * (step + 1) as f64 / self.warmup_steps as f64);
        }
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        Ok(((step - self.warmup_steps) as f64 / span as f64).min(1.0))
    }
}

struct ConstantScheduler {
    warmup: Warmup,
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        match self.warmup.phase(step) {
            Err(lr) => lr,
            Ok(_) => self.warmup.base_lr,
        }
    }
}

struct LinearScheduler {
    warmup: Warmup,
}

impl LRScheduler for LinearScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        match self.warmup.phase(step) {
            Err(lr) => lr,
            Ok(progress) => self.warmup.base_lr * (1.0 - progress),
        }
    }
}

struct CosineScheduler {
    warmup: Warmup,
    num_cycles: usize,
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        match self.warmup.phase(step) {
            Err(lr) => lr,
            Ok(progress) => {
                let cycles = self.num_cycles as f64;
                let cosine = ((progress * cycles * std::f64::consts::PI).cos() + 1.0) / 2.0;
                self.warmup.base_lr * cosine
            }
        }
    }
}

struct PolynomialScheduler {
    warmup: Warmup,
    power: f64,
}

impl LRScheduler for PolynomialScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        match self.warmup.phase(step) {
            Err(lr) => lr,
            Ok(progress) => self.warmup.base_lr * (1.0 - progress).powf(self.power),
        }
    }
}

/// Sums gradients of the trainable variables over `steps` micro-batches.
pub struct GradientAccumulator {
    steps: usize,
    seen: usize,
    accumulated: HashMap<TensorId, Tensor>,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            seen: 0,
            accumulated: HashMap::new(),
        }
    }

    /// Add one micro-batch. Once `steps` micro-batches are in, the given store is rewritten
    /// with the averaged gradients and returned for the optimizer.
    pub fn accumulate(&mut self, mut grads: GradStore, vars: &[Var]) -> Result<Option<GradStore>> {
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let id = var.as_tensor().id();
                let sum = match self.accumulated.remove(&id) {
                    Some(acc) => (acc + grad)?,
                    None => grad.clone(),
                };
                self.accumulated.insert(id, sum);
            }
        }
        self.seen += 1;
        if self.seen < self.steps {
            return Ok(None);
        }

        for var in vars {
            if let Some(sum) = self.accumulated.remove(&var.as_tensor().id()) {
                grads.insert(var.as_tensor(), (sum / self.steps as f64)?);
            }
        }
        self.seen = 0;
        Ok(Some(grads))
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`. Returns the norm before
/// clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * scale)?);
            }
        }
    }
    Ok(norm)
}
