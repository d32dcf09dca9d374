use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use plant_disease_burn::service::{router, ServiceConfig, ServiceContext};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[cfg(not(any(feature = "ndarray", feature = "wgpu")))]
compile_error!("Enable a backend feature: `ndarray` or `wgpu`");

/// Plant disease prediction server
#[derive(Parser, Debug)]
#[command(name = "plant-serve", version, about, long_about = None)]
struct Args {
    /// JSON service configuration. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "PLANT_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PLANT_PORT")]
    port: Option<u16>,

    /// Checkpoint produced by plant-train
    #[arg(long, env = "PLANT_CHECKPOINT")]
    checkpoint: Option<PathBuf>,

    /// Inference threads
    #[arg(long)]
    workers: Option<usize>,

    /// Pending images before requests are turned away
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Largest accepted upload in bytes
    #[arg(long)]
    max_upload_bytes: Option<usize>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)
                .with_context(|| format!("Could not read service configuration {path:?}"))?,
            None => ServiceConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(checkpoint) = self.checkpoint {
            config.checkpoint_path = checkpoint;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(timeout) = self.timeout_secs {
            config.request_timeout_secs = timeout;
        }
        if let Some(max) = self.max_upload_bytes {
            config.max_upload_bytes = max;
        }

        Ok(config)
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use super::*;
    use burn::backend::wgpu::{Wgpu, WgpuDevice};
    use plant_disease_burn::{error::ModelLoadError, service::load_model};

    pub async fn load(ctx: ServiceContext) -> Result<(), ModelLoadError> {
        let device = WgpuDevice::default();

        load_model::<Wgpu>(ctx, device).await
    }
}

#[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
mod ndarray {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use plant_disease_burn::{error::ModelLoadError, service::load_model};

    pub async fn load(ctx: ServiceContext) -> Result<(), ModelLoadError> {
        let device = NdArrayDevice::Cpu;

        load_model::<NdArray>(ctx, device).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let config = args.into_config()?;
    info!("Plant disease server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Checkpoint: {:?}", config.checkpoint_path);
    info!("  Workers:    {}", config.workers);
    info!("  Timeout:    {}s", config.request_timeout_secs);

    let ctx = ServiceContext::new(config.clone());
    let app = router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("Could not bind {}", config.addr()))?;
    info!("Starting server on http://{}", listener.local_addr()?);

    let server = async move { axum::serve(listener, app).await.context("Server error") };

    #[cfg(feature = "wgpu")]
    let loading = wgpu::load(ctx);
    #[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
    let loading = ndarray::load(ctx);
    let loading = async move { loading.await.context("Model could not be loaded") };

    // The server never returns on its own, a loading failure ends the process
    if let Err(err) = tokio::try_join!(server, loading) {
        error!("{:#}", err);
        return Err(err);
    }

    Ok(())
}
