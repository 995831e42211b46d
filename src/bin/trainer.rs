//! Train a diffusion model from a YAML config.
//!
//! Usage: cargo run --bin trainer -- configs/lora_sdxl.yaml

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use difftune::trainers::{load_config, parse_device, TrainingRunner};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fine-tune a text-to-image diffusion model")]
struct Args {
    /// Path to the training configuration YAML file
    config: PathBuf,

    /// Device to use (cpu, cuda, cuda:1); overrides the config
    #[arg(long)]
    device: Option<String>,

    /// Override learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Override number of optimizer steps
    #[arg(long)]
    steps: Option<usize>,

    /// Override batch size
    #[arg(long)]
    batch_size: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    difftune::logging::init_logger();

    let mut config = load_config(&args.config)?;
    if let Some(lr) = args.lr {
        info!("Overriding learning rate: {}", lr);
        config.train.lr = lr;
    }
    if let Some(steps) = args.steps {
        info!("Overriding steps: {}", steps);
        config.train.steps = steps;
    }
    if let Some(batch_size) = args.batch_size {
        info!("Overriding batch size: {}", batch_size);
        config.train.batch_size = batch_size;
    }

    let device = parse_device(args.device.as_deref().or(config.device.as_deref()))
        .context("Failed to open device")?;
    info!("Config: {}", args.config.display());
    info!("Device: {:?}", device);

    let mut runner = TrainingRunner::new(config, &device)?;
    runner.train()?;
    Ok(())
}
