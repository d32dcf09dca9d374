use std::path::PathBuf;

use burn::config::Config as _;
use clap::Parser;
use plant_disease_burn::{error::TrainingError, Trainer, TrainingConfig, TrainingSummary};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[cfg(not(any(feature = "ndarray", feature = "wgpu")))]
compile_error!("Enable a backend feature: `ndarray` or `wgpu`");

const DEFAULT_TRAIN_DIR: &str = "dataset/plantvillage/train";
const DEFAULT_VALID_DIR: &str = "dataset/plantvillage/val";
const DEFAULT_CHECKPOINT: &str = "model/plant_model.ckpt";

/// Fine-tune MobileNetV2 on a folder of labelled leaf images.
#[derive(Parser, Debug)]
#[command(name = "plant-train", version, about, long_about = None)]
struct Args {
    /// JSON training configuration. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training images, one subdirectory per class.
    #[arg(long, env = "PLANT_TRAIN_DIR")]
    train_dir: Option<String>,

    /// Validation images, same class subdirectories as the training split.
    #[arg(long, env = "PLANT_VALID_DIR")]
    valid_dir: Option<String>,

    /// Output checkpoint.
    #[arg(long, env = "PLANT_CHECKPOINT")]
    checkpoint: Option<String>,

    /// Continue training from an existing checkpoint.
    #[arg(long)]
    resume_from: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Only use the first images of every class.
    #[arg(long)]
    dev_mode: bool,

    /// Images per class kept in dev mode.
    #[arg(long)]
    max_samples_per_class: Option<usize>,

    /// Disable the random horizontal flip.
    #[arg(long)]
    no_flip: bool,

    /// Only train the classification head.
    #[arg(long)]
    freeze_backbone: bool,

    /// Keep the running batch norm statistics of the last training steps.
    #[arg(long)]
    no_recalibrate_norm: bool,

    /// Start from random weights instead of ImageNet weights.
    #[arg(long)]
    no_pretrained: bool,

    #[arg(long)]
    width_mult: Option<f32>,

    /// Tolerated fraction of unreadable images.
    #[arg(long)]
    max_data_error_rate: Option<f64>,

    /// Image decoding threads (0 = one per core).
    #[arg(long)]
    num_workers: Option<usize>,

    /// Also write `class_mapping.json` next to the checkpoint.
    #[arg(long)]
    export_class_mapping: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)
                .map_err(|err| anyhow::anyhow!("Could not read {:?}: {:?}", path, err))?,
            None => TrainingConfig::new(
                DEFAULT_TRAIN_DIR.to_string(),
                DEFAULT_VALID_DIR.to_string(),
                DEFAULT_CHECKPOINT.to_string(),
            ),
        };

        if let Some(train_dir) = self.train_dir {
            config.train_dir = train_dir;
        }
        if let Some(valid_dir) = self.valid_dir {
            config.valid_dir = valid_dir;
        }
        if let Some(checkpoint) = self.checkpoint {
            config.checkpoint_path = checkpoint;
        }
        if self.resume_from.is_some() {
            config.resume_from = self.resume_from;
        }
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(max) = self.max_samples_per_class {
            config.max_samples_per_class = max;
        }
        if let Some(width_mult) = self.width_mult {
            config.width_mult = width_mult;
        }
        if let Some(rate) = self.max_data_error_rate {
            config.max_data_error_rate = rate;
        }
        if let Some(num_workers) = self.num_workers {
            config.num_workers = num_workers;
        }
        config.dev_mode |= self.dev_mode;
        config.augment_flip &= !self.no_flip;
        config.freeze_backbone |= self.freeze_backbone;
        config.recalibrate_norm &= !self.no_recalibrate_norm;
        config.pretrained &= !self.no_pretrained;
        config.export_class_mapping |= self.export_class_mapping;

        Ok(config)
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use super::*;
    use burn::backend::{
        wgpu::{Wgpu, WgpuDevice},
        Autodiff,
    };

    pub fn run(config: TrainingConfig) -> Result<TrainingSummary, TrainingError> {
        let device = WgpuDevice::default();

        Trainer::new(config).run::<Autodiff<Wgpu>>(&device)
    }
}

#[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
mod ndarray {
    use super::*;
    use burn::backend::{
        ndarray::{NdArray, NdArrayDevice},
        Autodiff,
    };

    pub fn run(config: TrainingConfig) -> Result<TrainingSummary, TrainingError> {
        let device = NdArrayDevice::Cpu;

        Trainer::new(config).run::<Autodiff<NdArray>>(&device)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    let config = args.into_config()?;
    info!("Training configuration: {}", config);

    #[cfg(feature = "wgpu")]
    let summary = wgpu::run(config)?;
    #[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
    let summary = ndarray::run(config)?;

    if let Some(last) = summary.epochs.last() {
        info!(
            "Finished after {} epochs, validation accuracy {:.2}%",
            last.epoch, last.valid_accuracy
        );
    }
    info!(
        "Checkpoint with classes {:?} saved to {:?}",
        summary.classes.names(),
        summary.checkpoint_path
    );

    Ok(())
}
