use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Inference server configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Checkpoint loaded at startup
    pub checkpoint_path: PathBuf,
    /// Inference threads, each with its own handle on the model
    pub workers: usize,
    /// Images waiting for a worker before new requests get `503`
    pub queue_capacity: usize,
    /// Upper bound for one prediction, queueing included
    pub request_timeout_secs: u64,
    /// Largest accepted request body
    pub max_upload_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            checkpoint_path: PathBuf::from("model/plant_model.ckpt"),
            workers: 2,
            queue_capacity: 32,
            request_timeout_secs: 30,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    /// Read a JSON configuration. Missing fields keep their default value.
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
