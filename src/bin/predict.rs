use std::path::PathBuf;

use anyhow::{bail, Context};
use burn::tensor::backend::Backend;
use clap::Parser;
use plant_disease_burn::{
    data::{ClassMapping, PreparedImage},
    Prediction, Predictor,
};
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

#[cfg(not(any(feature = "ndarray", feature = "wgpu")))]
compile_error!("Enable a backend feature: `ndarray` or `wgpu`");

/// Classify one leaf image with a trained checkpoint.
#[derive(Parser, Debug)]
#[command(name = "plant-predict", version, about, long_about = None)]
struct Args {
    /// Image to classify.
    image: PathBuf,

    /// Checkpoint produced by plant-train.
    #[arg(long, env = "PLANT_CHECKPOINT", default_value = "model/plant_model.ckpt")]
    checkpoint: PathBuf,

    /// Deprecated: standalone `class_mapping.json`. Only checked against the checkpoint.
    #[arg(long)]
    class_mapping: Option<PathBuf>,
}

fn predict<B: Backend>(args: &Args, device: B::Device) -> anyhow::Result<Prediction> {
    let predictor = Predictor::<B>::from_checkpoint(&args.checkpoint, &device)
        .with_context(|| format!("Could not load {:?}", args.checkpoint))?;

    if let Some(path) = &args.class_mapping {
        warn!("--class-mapping is deprecated, class names are stored in the checkpoint");
        #[allow(deprecated)]
        let legacy = ClassMapping::from_legacy_json(path)
            .with_context(|| format!("Could not read {path:?}"))?;
        if &legacy != predictor.classes() {
            bail!(
                "{:?} lists {:?} but the checkpoint was trained on {:?}",
                path,
                legacy.names(),
                predictor.classes().names()
            );
        }
    }

    let image = PreparedImage::open(&args.image)
        .with_context(|| format!("Could not read image {:?}", args.image))?;
    Ok(predictor.predict_image(&image)?)
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use super::*;
    use burn::backend::wgpu::{Wgpu, WgpuDevice};

    pub fn run(args: &Args) -> anyhow::Result<Prediction> {
        let device = WgpuDevice::default();

        predict::<Wgpu>(args, device)
    }
}

#[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
mod ndarray {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    pub fn run(args: &Args) -> anyhow::Result<Prediction> {
        let device = NdArrayDevice::Cpu;

        predict::<NdArray>(args, device)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_target(false)
        .compact()
        .init();

    #[cfg(feature = "wgpu")]
    let prediction = wgpu::run(&args)?;
    #[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
    let prediction = ndarray::run(&args)?;

    println!(
        "Prediction: {} ({:.2}%)",
        prediction.prediction, prediction.confidence
    );

    Ok(())
}
