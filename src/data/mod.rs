mod batcher;
mod dataset;
mod loader;
pub mod preprocess;

pub use batcher::*;
pub use dataset::*;
pub use loader::*;
pub use preprocess::{ImagePreprocessor, Normalizer, PreparedImage, IMAGE_SIZE};
