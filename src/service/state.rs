use std::sync::{Arc, OnceLock};

use super::{config::ServiceConfig, pool::InferencePool};

/// State shared by the request handlers.
///
/// Starts without a model; the pool is installed once the checkpoint has been loaded.
/// Each context is independent, so several services can live in one process.
#[derive(Clone)]
pub struct ServiceContext {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    pool: OnceLock<InferencePool>,
}

impl ServiceContext {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pool: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Make the model available to requests. Only the first pool is kept, a second one is
    /// handed back.
    pub fn install(&self, pool: InferencePool) -> Result<(), InferencePool> {
        self.inner.pool.set(pool)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.pool.get().is_some()
    }

    pub(crate) fn pool(&self) -> Option<&InferencePool> {
        self.inner.pool.get()
    }
}
