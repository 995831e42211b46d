//! Config-driven fine-tuning of text-to-image diffusion models.
//!
//! [`trainers::DiffusionEngine`] is the training-step engine shared by plain text-to-image,
//! LoRA, DreamBooth, ControlNet and T2I-Adapter runs. [`trainers::TrainingRunner`] wraps it in
//! a training loop driven by a YAML [`Config`].

pub mod data;
pub mod error;
pub mod loaders;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::EngineError;
pub use trainers::{load_config, Config, DiffusionEngine, InferenceRequest, ModelConfig, TrainingRunner};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped `info` logging, overridable through `RUST_LOG`.
    pub fn init_logger() {
        let _ = Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .try_init();
    }
}
