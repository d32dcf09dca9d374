pub mod checkpoint;
pub mod data;
pub mod error;
pub mod inference;
pub mod model;
pub mod service;
pub mod training;

pub use checkpoint::Checkpoint;
pub use inference::{Prediction, Predictor};
pub use model::{MobileNetV2, MobileNetV2Config};
pub use training::{EpochReport, Trainer, TrainingConfig, TrainingSummary};
