use std::path::PathBuf;

use thiserror::Error;

/// Failure to turn raw bytes into a [`PreparedImage`](crate::data::PreparedImage).
#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Invalid image data: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Unsupported color mode: {0}")]
    UnsupportedMode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single training or validation sample that could not be loaded.
#[derive(Error, Debug)]
#[error("Failed to load sample {path:?}: {source}")]
pub struct DataLoadError {
    pub path: PathBuf,
    #[source]
    pub source: PreprocessError,
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset directory does not exist: {0:?}")]
    MissingRoot(PathBuf),

    #[error("No class directories found in {0:?}")]
    NoClasses(PathBuf),

    #[error("Class directory {class:?} in {root:?} is not part of the class mapping")]
    UnknownClass { root: PathBuf, class: String },

    #[error("Invalid class mapping: {0}")]
    InvalidMapping(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Checkpoint {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint {path:?} has format version {found}, this build reads up to {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error(
        "Checkpoint {path:?} maps {classes} classes but its final layer produces {outputs} scores"
    )]
    DimensionMismatch {
        path: PathBuf,
        classes: usize,
        outputs: usize,
    },

    #[error("Could not encode checkpoint: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("The {0} split contains no images")]
    EmptySplit(&'static str),

    #[error("Class mapping of {checkpoint:?} differs from the training directory")]
    ClassMappingDrift { checkpoint: PathBuf },

    #[error("{failed} of {seen} samples failed to load, above the configured rate {max_rate}")]
    TooManyDataErrors {
        failed: usize,
        seen: usize,
        max_rate: f64,
    },

    #[error("Invalid training configuration: {0}")]
    Config(String),

    #[error("Could not load pretrained weights: {0}")]
    Pretrained(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Model produces {outputs} scores for {classes} classes")]
    DimensionMismatch { classes: usize, outputs: usize },

    #[error("Model output is not a probability distribution: {0}")]
    InvalidOutput(String),
}

/// Errors returned to HTTP clients.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Upload exceeds the limit of {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Model is still loading or busy")]
    ServiceUnavailable,

    #[error("Prediction timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<InferenceError> for ServiceError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Preprocess(PreprocessError::Decode(err)) => {
                ServiceError::BadRequest(format!("Uploaded file is not a valid image: {err}"))
            }
            InferenceError::Preprocess(PreprocessError::UnsupportedMode(mode)) => {
                ServiceError::BadRequest(format!("Unsupported image color mode: {mode}"))
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// The inference service could not become ready.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Failed to load {path:?}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: InferenceError,
    },

    #[error("Could not start inference workers: {0}")]
    Workers(#[from] std::io::Error),

    #[error("Model loading task failed: {0}")]
    Task(String),

    #[error("A model is already installed")]
    AlreadyLoaded,
}
