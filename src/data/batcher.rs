use burn::{data::dataloader::batcher::Batcher, prelude::*};

use super::preprocess::{ImagePreprocessor, PreparedImage};

/// A prepared image and its class index.
pub type ClassificationItem = (PreparedImage, usize);

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// Normalized images, `[batch_size, 3, 224, 224]`.
    pub images: Tensor<B, 4>,
    /// Class indices, `[batch_size]`.
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone, Debug)]
pub struct ClassificationBatcher<B: Backend> {
    preprocessor: ImagePreprocessor<B>,
}

impl<B: Backend> ClassificationBatcher<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            preprocessor: ImagePreprocessor::new(device),
        }
    }
}

impl<B: Backend> Batcher<B, ClassificationItem, ClassificationBatch<B>> for ClassificationBatcher<B> {
    fn batch(&self, items: Vec<ClassificationItem>, device: &B::Device) -> ClassificationBatch<B> {
        let (images, labels): (Vec<_>, Vec<_>) = items.into_iter().unzip();

        let targets = labels
            .into_iter()
            .map(|label| label as i64)
            .collect::<Vec<_>>();
        let num_targets = targets.len();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, [num_targets]).convert::<B::IntElem>(),
            device,
        );
        let images = self.preprocessor.batch(&images, device);

        ClassificationBatch { images, targets }
    }
}
