//! Publish trained sub-networks in the model directory layout.
//!
//! Usage: cargo run --bin publish_model -- configs/lora_sdxl.yaml --keys unet text_encoder -o out/

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use difftune::trainers::{load_config, parse_device, save_model, DiffusionEngine, SAVE_KEYS};

#[derive(Parser, Debug)]
#[command(author, version, about = "Save trained sub-networks of a diffusion model")]
struct Args {
    /// Training configuration YAML file; its `model` section describes the bundle
    config: PathBuf,

    /// Model directory to publish from, replacing the configured model source
    #[arg(long)]
    model: Option<PathBuf>,

    /// Sub-networks to save
    #[arg(long, num_args = 1.., default_values_t = SAVE_KEYS.map(String::from))]
    keys: Vec<String>,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Device to use (cpu, cuda, cuda:1)
    #[arg(long, default_value = "cpu")]
    device: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    difftune::logging::init_logger();

    let mut config = load_config(&args.config)?.model;
    if let Some(model) = args.model {
        config.pretrained_model_name_or_path = Some(model);
        config.compact = None;
    }
    let device = parse_device(Some(&args.device))?;

    let engine = DiffusionEngine::from_config(config, &device)?;
    save_model(&engine, &args.keys, &args.output)?;
    info!("Published {:?} to {}", args.keys, args.output.display());
    Ok(())
}
