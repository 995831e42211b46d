//! The training loop around [`DiffusionEngine`]: data, optimizer, schedules, sampling and
//! checkpoints.

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use super::engine::{ConditionImage, DiffusionEngine, InferenceRequest};
use super::export::save_trained;
use super::memory_utils::log_memory_usage;
use super::training_helpers::{clip_grad_norm, create_scheduler, GradientAccumulator, LRScheduler};
use super::Config;
use crate::data::FolderDataset;

const DEFAULT_DATA_SEED: u64 = 42;

pub struct TrainingRunner {
    config: Config,
    engine: DiffusionEngine,
    dataset: FolderDataset,
    optimizer: AdamW,
    lr_scheduler: Box<dyn LRScheduler>,
    accumulator: GradientAccumulator,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
    output_dir: PathBuf,
    saved_checkpoints: VecDeque<PathBuf>,
}

impl TrainingRunner {
    pub fn new(config: Config, device: &Device) -> Result<Self> {
        info!("=== Initializing {} ===", config.job);
        let start = Instant::now();
        let engine = DiffusionEngine::from_config(config.model.clone(), device)?;
        let mut dataset_config = config.dataset.clone();
        if let Some(size) = engine.conditioning().and_then(|network| network.condition_size()) {
            if dataset_config.clip_image_size.is_none() {
                info!("Image prompts are cropped at the image encoder size, {}px", size);
                dataset_config.clip_image_size = Some(size);
            }
        }
        let dataset = FolderDataset::open(dataset_config)?;
        if dataset.is_empty() {
            anyhow::bail!("No training images in {}", config.dataset.folder_path.display());
        }
        info!("Dataset items: {}", dataset.len());

        let train = &config.train;
        let optimizer = AdamW::new(
            engine.trainable_vars().to_vec(),
            ParamsAdamW {
                lr: train.lr,
                weight_decay: train.weight_decay,
                ..Default::default()
            },
        )?;
        let lr_scheduler = create_scheduler(
            &train.lr_scheduler,
            train.lr,
            train.lr_warmup_steps,
            train.steps,
            train.lr_scheduler_num_cycles,
            train.lr_scheduler_power,
        )?;
        let accumulator = GradientAccumulator::new(train.gradient_accumulation);

        let output_dir = config.save.output_dir.join(&config.job);
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output dir {}", output_dir.display()))?;
        let config_path = output_dir.join("config.yaml");
        fs::write(&config_path, serde_yaml::to_string(&config)?)?;

        let rng = StdRng::seed_from_u64(config.model.seed.unwrap_or(DEFAULT_DATA_SEED));
        info!("Models loaded in {:.2}s", start.elapsed().as_secs_f32());
        Ok(Self {
            config,
            engine,
            dataset,
            optimizer,
            lr_scheduler,
            accumulator,
            rng,
            order: Vec::new(),
            cursor: 0,
            output_dir,
            saved_checkpoints: VecDeque::new(),
        })
    }

    pub fn engine(&self) -> &DiffusionEngine {
        &self.engine
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Indices of the next batch; the dataset is reshuffled at every epoch boundary.
    fn next_indices(&mut self) -> Vec<usize> {
        let batch_size = self.config.train.batch_size.max(1);
        let mut indices = Vec::with_capacity(batch_size);
        while indices.len() < batch_size {
            if self.cursor >= self.order.len() {
                self.order = (0..self.dataset.len()).collect();
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }
        indices
    }

    /// Run `gradient_accumulation` micro-batches and one optimizer update. Returns the mean
    /// loss and the gradient norm before clipping.
    fn optimizer_step(&mut self, step: usize) -> Result<(f32, Option<f64>)> {
        let micro_batches = self.config.train.gradient_accumulation.max(1);
        let device = self.engine.device().clone();
        let mut loss_sum = 0f32;
        for _ in 0..micro_batches {
            let indices = self.next_indices();
            let raw = self.dataset.batch(&indices, &mut self.rng, &device)?;
            let losses = self.engine.compute_losses(raw)?;
            let loss = losses
                .get("loss")
                .ok_or_else(|| anyhow::anyhow!("loss dict has no `loss` entry"))?;
            loss_sum += loss.to_scalar::<f32>()?;

            let grads = loss.backward()?;
            let vars = self.engine.trainable_vars();
            if let Some(mut grads) = self.accumulator.accumulate(grads, vars)? {
                let norm = match self.config.train.max_grad_norm {
                    Some(max_norm) => Some(clip_grad_norm(&mut grads, vars, max_norm)?),
                    None => None,
                };
                self.optimizer.set_learning_rate(self.lr_scheduler.get_lr(step));
                self.optimizer.step(&grads)?;
                return Ok((loss_sum / micro_batches as f32, norm));
            }
        }
        anyhow::bail!("gradient accumulation did not complete after {} micro-batches", micro_batches)
    }

    pub fn train(&mut self) -> Result<()> {
        let steps = self.config.train.steps;
        info!("=== Starting Training ===");
        info!("Steps: {}", steps);
        info!("Batch size: {}", self.config.train.batch_size);
        info!("Learning rate: {}", self.config.train.lr);
        info!("Gradient accumulation: {}", self.config.train.gradient_accumulation);
        log_memory_usage("Before training", self.engine.device());

        #[cfg(feature = "progress-bar")]
        let progress = {
            let bar = ProgressBar::new(steps as u64);
            if let Ok(style) = ProgressStyle::default_bar().template("{bar:40} {pos}/{len} [{elapsed_precise}] {msg}") {
                bar.set_style(style);
            }
            bar
        };

        let log_every = self.config.train.log_every.max(1);
        for step in 0..steps {
            let (loss, norm) = self.optimizer_step(step)?;
            let done = step + 1;

            #[cfg(feature = "progress-bar")]
            {
                progress.inc(1);
                progress.set_message(format!("loss {:.4}", loss));
            }

            if !loss.is_finite() {
                warn!("Step {}: loss is {}", done, loss);
            }
            if done % log_every == 0 || done == steps {
                let lr = self.lr_scheduler.get_lr(step);
                match norm {
                    Some(norm) => info!("Step {}/{}: loss = {:.6}, lr = {:.2e}, grad_norm = {:.4}", done, steps, loss, lr, norm),
                    None => info!("Step {}/{}: loss = {:.6}, lr = {:.2e}", done, steps, loss, lr),
                }
            }
            if let Some(sample) = &self.config.sample {
                if sample.sample_every > 0 && done % sample.sample_every == 0 {
                    self.generate_samples(done)?;
                }
            }
            if self.config.save.save_every > 0 && done % self.config.save.save_every == 0 && done != steps {
                self.save_checkpoint(done)?;
            }
        }

        #[cfg(feature = "progress-bar")]
        progress.finish();

        let final_dir = self.output_dir.join("final");
        save_trained(&self.engine, &final_dir)?;
        info!("Saved final weights to {}", final_dir.display());
        info!("=== Training Complete ===");
        Ok(())
    }

    /// Write one PNG per sample prompt into `samples/`.
    pub fn generate_samples(&self, step: usize) -> Result<Vec<PathBuf>> {
        let Some(sample) = &self.config.sample else {
            return Ok(Vec::new());
        };
        info!("Generating {} samples at step {}", sample.prompts.len(), step);
        let mut request = InferenceRequest::new(sample.prompts.clone(), sample.height, sample.width)
            .with_steps(sample.sample_steps)
            .with_condition_images(sample.condition_images.iter().cloned().map(ConditionImage::from).collect());
        if let Some(neg) = &sample.neg {
            request = request.with_negative_prompt(neg.clone());
        }
        let images = self.engine.infer(&request)?;

        let sample_dir = self.output_dir.join("samples");
        fs::create_dir_all(&sample_dir)?;
        let mut paths = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let path = sample_dir.join(format!("step_{:06}_{}.png", step, i));
            image
                .save(&path)
                .with_context(|| format!("Failed to save sample {}", path.display()))?;
            paths.push(path);
        }
        info!("Saved {} samples to {}", paths.len(), sample_dir.display());
        Ok(paths)
    }

    /// Save a step checkpoint and drop the oldest ones beyond `max_step_saves_to_keep`.
    pub fn save_checkpoint(&mut self, step: usize) -> Result<PathBuf> {
        let dir = self.output_dir.join(format!("checkpoint-{:06}", step));
        save_trained(&self.engine, &dir)?;
        info!("Saved checkpoint {}", dir.display());
        self.saved_checkpoints.push_back(dir.clone());

        let keep = self.config.save.max_step_saves_to_keep;
        while self.saved_checkpoints.len() > keep {
            if let Some(old) = self.saved_checkpoints.pop_front() {
                fs::remove_dir_all(&old).with_context(|| format!("Failed to remove {}", old.display()))?;
                info!("Removed old checkpoint {}", old.display());
            }
        }
        Ok(dir)
    }
}
