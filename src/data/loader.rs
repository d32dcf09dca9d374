use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use super::{batcher::ClassificationItem, dataset::ImageItem};
use crate::error::DataLoadError;

/// Samples of one batch that decoded, plus the ones that did not.
#[derive(Debug, Default)]
pub struct LoadedBatch {
    pub items: Vec<ClassificationItem>,
    pub failures: Vec<DataLoadError>,
}

impl LoadedBatch {
    /// Samples that loaded.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Decodes the images of a batch in parallel. Output order follows input order,
/// so the number of worker threads never changes the result.
pub struct BatchLoader {
    pool: ThreadPool,
}

impl BatchLoader {
    /// `num_workers == 0` lets rayon pick one thread per core.
    pub fn new(num_workers: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new().num_threads(num_workers).build()?;
        Ok(Self { pool })
    }

    pub fn load(&self, items: &[&ImageItem]) -> LoadedBatch {
        let results: Vec<_> = self.pool.install(|| {
            items
                .par_iter()
                .map(|item| item.load().map(|image| (image, item.label)))
                .collect()
        });

        let mut batch = LoadedBatch::default();
        for result in results {
            match result {
                Ok(item) => batch.items.push(item),
                Err(err) => batch.failures.push(err),
            }
        }
        batch
    }
}

/// Visiting order of a split for one epoch.
pub fn epoch_order(len: usize, rng: Option<&mut ChaCha8Rng>) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    if let Some(rng) = rng {
        indices.shuffle(rng);
    }
    indices
}
