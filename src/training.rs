use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    checkpoint,
    data::{epoch_order, BatchLoader, ClassMapping, ClassificationBatcher, ImageFolder, LoadedBatch},
    error::TrainingError,
    model::{MobileNetV2, MobileNetV2Config},
};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Training split, one subdirectory per class.
    pub train_dir: String,

    /// Validation split, labelled with the classes of the training split.
    pub valid_dir: String,

    /// Where the final checkpoint is written.
    pub checkpoint_path: String,

    /// Start from this checkpoint instead of a fresh model.
    pub resume_from: Option<String>,

    #[config(default = 2)]
    pub num_epochs: usize,

    #[config(default = 16)]
    pub batch_size: usize,

    #[config(default = 1e-4)]
    pub learning_rate: f64,

    #[config(default = 42)]
    pub seed: u64,

    /// Cap the number of training images per class for fast iteration.
    #[config(default = false)]
    pub dev_mode: bool,

    #[config(default = 100)]
    pub max_samples_per_class: usize,

    /// Randomly mirror training images left to right.
    #[config(default = true)]
    pub augment_flip: bool,

    /// Only train the classification head.
    #[config(default = false)]
    pub freeze_backbone: bool,

    /// Recompute the batch norm running statistics over the training split before each
    /// validation, so evaluation sees the statistics of the final weights.
    #[config(default = true)]
    pub recalibrate_norm: bool,

    /// Start from ImageNet weights. Requires the `pretrained` feature.
    #[config(default = true)]
    pub pretrained: bool,

    #[config(default = 1.0)]
    pub width_mult: f32,

    /// Highest tolerated fraction of unreadable samples before the run aborts.
    #[config(default = 0.0)]
    pub max_data_error_rate: f64,

    /// Image decoding threads, 0 for one per core.
    #[config(default = 0)]
    pub num_workers: usize,

    /// Also write the standalone `class_mapping.json` next to the checkpoint.
    #[config(default = false)]
    pub export_class_mapping: bool,
}

impl TrainingConfig {
    fn validate(&self) -> Result<(), TrainingError> {
        let invalid = |msg: &str| Err(TrainingError::Config(msg.to_string()));

        if self.num_epochs == 0 {
            return invalid("num_epochs must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return invalid("learning_rate must be positive");
        }
        if self.dev_mode && self.max_samples_per_class == 0 {
            return invalid("max_samples_per_class must be at least 1 in dev mode");
        }
        if !(0.0..=1.0).contains(&self.max_data_error_rate) {
            return invalid("max_data_error_rate must be within [0, 1]");
        }
        if self.width_mult.is_nan() || self.width_mult <= 0.0 {
            return invalid("width_mult must be positive");
        }
        Ok(())
    }

    /// Training configuration saved next to the checkpoint.
    pub fn config_path(&self) -> PathBuf {
        Path::new(&self.checkpoint_path).with_extension("config.json")
    }

    /// Standalone class mapping written when `export_class_mapping` is set.
    pub fn class_mapping_path(&self) -> PathBuf {
        Path::new(&self.checkpoint_path).with_file_name("class_mapping.json")
    }
}

/// Diagnostics of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    /// 1-based.
    pub epoch: usize,
    /// Mean of the batch losses.
    pub train_loss: f64,
    /// Mean of the batch losses.
    pub valid_loss: f64,
    /// Percentage of correctly classified validation images.
    pub valid_accuracy: f64,
    /// Training and validation images that could not be loaded.
    pub skipped_samples: usize,
}

#[derive(Debug)]
pub struct TrainingSummary {
    pub classes: ClassMapping,
    pub epochs: Vec<EpochReport>,
    pub checkpoint_path: PathBuf,
}

/// Running count of unreadable samples against the configured threshold.
#[derive(Debug)]
struct DataErrorBudget {
    max_rate: f64,
    seen: usize,
    failed: usize,
}

impl DataErrorBudget {
    fn new(max_rate: f64) -> Self {
        Self {
            max_rate,
            seen: 0,
            failed: 0,
        }
    }

    fn record(&mut self, batch: &LoadedBatch) -> Result<(), TrainingError> {
        for failure in &batch.failures {
            warn!("Skipping sample: {}", failure);
        }
        self.seen += batch.len() + batch.failures.len();
        self.failed += batch.failures.len();

        if self.failed > 0 && self.failed as f64 / self.seen as f64 > self.max_rate {
            return Err(TrainingError::TooManyDataErrors {
                failed: self.failed,
                seen: self.seen,
                max_rate: self.max_rate,
            });
        }
        Ok(())
    }
}

pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Train, validate after every epoch, then write the checkpoint.
    ///
    /// Nothing is written unless every epoch completes.
    pub fn run<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> Result<TrainingSummary, TrainingError> {
        let config = &self.config;
        config.validate()?;
        B::seed(config.seed);

        // Classes come from the full listing, before any dev mode reduction
        let mut train = ImageFolder::discover(&config.train_dir)?;
        let classes = train.classes.clone();
        let valid = ImageFolder::with_classes(&config.valid_dir, classes.clone())?;
        info!("Classes: {:?}", classes.names());

        if config.dev_mode {
            train = train.cap_per_class(config.max_samples_per_class);
        }
        if train.is_empty() {
            return Err(TrainingError::EmptySplit("training"));
        }
        if valid.is_empty() {
            return Err(TrainingError::EmptySplit("validation"));
        }

        let (mut model, model_config) = self.init_model::<B>(&classes, device)?;
        if config.freeze_backbone {
            info!("Backbone frozen, only the classifier is trained");
            model = model.freeze_backbone();
        }

        let mut optim = AdamConfig::new().init();
        let loader = BatchLoader::new(config.num_workers)
            .map_err(|err| TrainingError::Config(err.to_string()))?;
        let batcher = ClassificationBatcher::<B>::new(device);
        let batcher_valid = ClassificationBatcher::<B::InnerBackend>::new(device);
        let mut budget = DataErrorBudget::new(config.max_data_error_rate);
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

        info!(
            "Training on {} images, validating on {} ({} epochs, batch size {})",
            train.len(),
            valid.len(),
            config.num_epochs,
            config.batch_size
        );

        let mut reports = Vec::with_capacity(config.num_epochs);
        for epoch in 1..=config.num_epochs {
            info!("Starting epoch {}/{}", epoch, config.num_epochs);

            let order = epoch_order(train.len(), Some(&mut rng));
            let num_batches = order.len().div_ceil(config.batch_size);
            let mut loss_sum = 0.0;
            let mut batches = 0usize;
            let mut skipped = 0usize;

            for (batch_idx, indices) in order.chunks(config.batch_size).enumerate() {
                let items = indices.iter().map(|&i| &train.items[i]).collect::<Vec<_>>();
                let loaded = loader.load(&items);
                budget.record(&loaded)?;
                skipped += loaded.failures.len();
                if loaded.is_empty() {
                    continue;
                }

                let items = if config.augment_flip {
                    loaded
                        .items
                        .into_iter()
                        .map(|(image, label)| {
                            if rng.gen_bool(0.5) {
                                (image.flip_horizontal(), label)
                            } else {
                                (image, label)
                            }
                        })
                        .collect::<Vec<_>>()
                } else {
                    loaded.items
                };

                let batch = batcher.batch(items, device);
                let output = model.forward(batch.images);
                let loss = CrossEntropyLossConfig::new()
                    .init(&output.device())
                    .forward(output, batch.targets);
                let loss_value: f64 = loss.clone().into_scalar().elem();

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(config.learning_rate, model, grads);

                loss_sum += loss_value;
                batches += 1;

                if batch_idx == 0 || (batch_idx + 1) % 100 == 0 {
                    debug!(
                        "Batch {}/{}: loss = {:.4}",
                        batch_idx + 1,
                        num_batches,
                        loss_value
                    );
                }
            }

            if batches == 0 {
                return Err(TrainingError::EmptySplit("training"));
            }

            if config.recalibrate_norm {
                let images = train.items.chunks(config.batch_size).filter_map(|chunk| {
                    let items = chunk.iter().collect::<Vec<_>>();
                    // Failures were already counted during the epoch
                    let loaded = loader.load(&items);
                    (!loaded.is_empty()).then(|| batcher.batch(loaded.items, device).images)
                });
                model = recalibrate_norm(model, images);
            }

            let evaluation = evaluate(
                &model.valid(),
                &valid,
                &loader,
                &batcher_valid,
                &mut budget,
                config.batch_size,
                device,
            )?;

            let report = EpochReport {
                epoch,
                train_loss: loss_sum / batches as f64,
                valid_loss: evaluation.loss,
                valid_accuracy: evaluation.accuracy,
                skipped_samples: skipped + evaluation.skipped,
            };
            info!(
                "Epoch [{}/{}] | Train Loss: {:.4} | Val Loss: {:.4} | Val Acc: {:.2}%",
                epoch,
                config.num_epochs,
                report.train_loss,
                report.valid_loss,
                report.valid_accuracy
            );
            reports.push(report);
        }

        // The checkpoint goes last: it only exists once every artifact was written
        let checkpoint_path = PathBuf::from(&config.checkpoint_path);
        if let Some(parent) = checkpoint_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(config.config_path())?;
        if config.export_class_mapping {
            classes.write_legacy_json(config.class_mapping_path())?;
            info!("Wrote class mapping to {:?}", config.class_mapping_path());
        }
        checkpoint::save(&checkpoint_path, &model.valid(), &model_config, &classes)?;

        Ok(TrainingSummary {
            classes,
            epochs: reports,
            checkpoint_path,
        })
    }

    fn init_model<B: AutodiffBackend>(
        &self,
        classes: &ClassMapping,
        device: &B::Device,
    ) -> Result<(MobileNetV2<B>, MobileNetV2Config), TrainingError> {
        let config = &self.config;

        if let Some(resume_from) = &config.resume_from {
            info!("Resuming from {:?}", resume_from);
            let checkpoint = checkpoint::load::<B, _>(resume_from, device)?;
            if &checkpoint.classes != classes {
                return Err(TrainingError::ClassMappingDrift {
                    checkpoint: PathBuf::from(resume_from),
                });
            }
            return Ok((checkpoint.model, checkpoint.config));
        }

        let model_config =
            MobileNetV2Config::new(classes.len()).with_width_mult(config.width_mult);

        if config.pretrained {
            return Ok((pretrained_model(&model_config, device)?, model_config));
        }
        Ok((model_config.init(device), model_config))
    }
}

#[cfg(feature = "pretrained")]
fn pretrained_model<B: Backend>(
    config: &MobileNetV2Config,
    device: &B::Device,
) -> Result<MobileNetV2<B>, TrainingError> {
    use crate::model::weights;

    if config.width_mult != 1.0 {
        warn!(
            "No pretrained weights for width multiplier {}, starting from scratch",
            config.width_mult
        );
        return Ok(config.init(device));
    }

    let model = MobileNetV2::pretrained(weights::MobileNetV2::ImageNet1kV2, device)
        .map_err(|err| TrainingError::Pretrained(err.to_string()))?
        .with_classes(config.num_classes);
    Ok(model)
}

#[cfg(not(feature = "pretrained"))]
fn pretrained_model<B: Backend>(
    config: &MobileNetV2Config,
    device: &B::Device,
) -> Result<MobileNetV2<B>, TrainingError> {
    warn!("Built without the `pretrained` feature, starting from a random initialization");
    Ok(config.init(device))
}

/// Replace the batch norm running statistics with their average over `images`.
///
/// Batch norm layers only update their statistics on an autodiff backend, one momentum step
/// per forward pass. A momentum of `1 / k` on the `k`-th batch turns the updates into an exact
/// average, instead of a lagging estimate of weights that changed during the epoch.
fn recalibrate_norm<B: AutodiffBackend>(
    model: MobileNetV2<B>,
    images: impl IntoIterator<Item = Tensor<B, 4>>,
) -> MobileNetV2<B> {
    let momentum = model.norm_momentum();
    let mut model = model;
    let mut batches = 0usize;

    for batch in images {
        batches += 1;
        model = model.with_norm_momentum(1.0 / batches as f64);
        let _ = model.forward(batch);
    }
    debug!("Recalibrated batch norm statistics over {} batches", batches);

    model.with_norm_momentum(momentum)
}

struct Evaluation {
    loss: f64,
    accuracy: f64,
    skipped: usize,
}

/// Forward-only pass over the validation split.
fn evaluate<B: Backend>(
    model: &MobileNetV2<B>,
    valid: &ImageFolder,
    loader: &BatchLoader,
    batcher: &ClassificationBatcher<B>,
    budget: &mut DataErrorBudget,
    batch_size: usize,
    device: &B::Device,
) -> Result<Evaluation, TrainingError> {
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut loss_sum = 0.0;
    let mut batches = 0usize;
    let mut correct = 0usize;
    let mut total = 0usize;
    let mut skipped = 0usize;

    for chunk in valid.items.chunks(batch_size) {
        let items = chunk.iter().collect::<Vec<_>>();
        let loaded = loader.load(&items);
        budget.record(&loaded)?;
        skipped += loaded.failures.len();
        if loaded.is_empty() {
            continue;
        }

        let num_items = loaded.len();
        let batch = batcher.batch(loaded.items, device);
        let output = model.forward(batch.images);
        let loss = loss_fn.forward(output.clone(), batch.targets.clone());
        loss_sum += loss.into_scalar().elem::<f64>();
        batches += 1;

        let predictions = output.argmax(1).flatten::<1>(0, 1);
        let batch_correct: i64 = predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem();
        correct += batch_correct as usize;
        total += num_items;
    }

    if total == 0 {
        return Err(TrainingError::EmptySplit("validation"));
    }

    Ok(Evaluation {
        loss: loss_sum / batches as f64,
        accuracy: 100.0 * correct as f64 / total as f64,
        skipped,
    })
}
