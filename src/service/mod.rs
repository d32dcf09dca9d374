//! HTTP inference service.
//!
//! `POST /predict` takes a multipart upload and answers
//! `{"prediction": "<class>", "confidence": <percent>}`; `GET /health` reports whether the
//! model has been loaded. Errors are JSON objects with a single `error` field.

mod config;
mod pool;
mod routes;
mod state;

pub use config::ServiceConfig;
pub use pool::InferencePool;
pub use routes::{router, HealthResponse};
pub use state::ServiceContext;

use burn::tensor::backend::Backend;
use tracing::info;

use crate::{error::ModelLoadError, inference::Predictor};

/// Load the checkpoint of `ctx` on a blocking thread and install the worker pool.
///
/// Requests get `503` until this returns. An error means the service can never become
/// ready and should shut down.
pub async fn load_model<B: Backend>(
    ctx: ServiceContext,
    device: B::Device,
) -> Result<(), ModelLoadError> {
    let path = ctx.config().checkpoint_path.clone();
    let workers = ctx.config().workers;
    let queue_capacity = ctx.config().queue_capacity;
    info!("Loading checkpoint {:?}", path);

    let load_path = path.clone();
    let predictor = tokio::task::spawn_blocking(move || {
        Predictor::<B>::from_checkpoint(&load_path, &device)
    })
    .await
    .map_err(|err| ModelLoadError::Task(err.to_string()))?
    .map_err(|source| ModelLoadError::Checkpoint {
        path: path.clone(),
        source,
    })?;

    let classes = predictor.classes().names().to_vec();
    let pool = InferencePool::start(predictor, workers, queue_capacity)?;
    info!(
        "Model ready with {} classes {:?} on {} workers",
        classes.len(),
        classes,
        pool.workers()
    );

    ctx.install(pool).map_err(|_| ModelLoadError::AlreadyLoaded)
}
