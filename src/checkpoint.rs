//! Single-file checkpoint bundling the trained weights with the class names needed to read
//! the model outputs.
//!
//! Layout: 8 magic bytes, the format version as a little-endian `u32`, then a named
//! MessagePack record holding the class names, the architecture config and the weights.
//! The class count is never stored on its own, it is the length of the class names.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder},
};
use tracing::{debug, info};

use crate::{
    data::ClassMapping,
    error::CheckpointError,
    model::{MobileNetV2, MobileNetV2Config, MobileNetV2Record},
};

/// Latest format written by [`save`], and the newest one [`load`] understands.
pub const FORMAT_VERSION: u32 = 1;

const MAGIC: &[u8; 8] = b"PLNTCKPT";
const HEADER_LEN: usize = MAGIC.len() + 4;

#[derive(Record)]
struct CheckpointRecord<B: Backend> {
    class_names: Vec<String>,
    model_config: String,
    model: MobileNetV2Record<B>,
}

/// A loaded checkpoint. `model` always produces `classes.len()` scores.
#[derive(Debug)]
pub struct Checkpoint<B: Backend> {
    pub model: MobileNetV2<B>,
    pub config: MobileNetV2Config,
    pub classes: ClassMapping,
}

fn recorder() -> NamedMpkBytesRecorder<FullPrecisionSettings> {
    NamedMpkBytesRecorder::default()
}

/// Write `model` and `classes` to `path` as one artifact.
///
/// The file is written next to its destination and renamed into place, so a reader never
/// observes a partial checkpoint.
pub fn save<B: Backend, P: AsRef<Path>>(
    path: P,
    model: &MobileNetV2<B>,
    config: &MobileNetV2Config,
    classes: &ClassMapping,
) -> Result<(), CheckpointError> {
    let path = path.as_ref();

    let outputs = model.num_classes();
    if classes.is_empty() || outputs != classes.len() {
        return Err(CheckpointError::DimensionMismatch {
            path: path.to_path_buf(),
            classes: classes.len(),
            outputs,
        });
    }

    let config = MobileNetV2Config {
        num_classes: classes.len(),
        ..config.clone()
    };
    let record = CheckpointRecord {
        class_names: classes.names().to_vec(),
        model_config: serde_json::to_string(&config)
            .map_err(|err| CheckpointError::Encode(err.to_string()))?,
        model: model.clone().into_record(),
    };

    write_record(path, FORMAT_VERSION, record)?;
    info!(
        "Saved checkpoint with {} classes to {:?}",
        classes.len(),
        path
    );
    Ok(())
}

fn write_record<B: Backend>(
    path: &Path,
    version: u32,
    record: CheckpointRecord<B>,
) -> Result<(), CheckpointError> {
    let payload = recorder()
        .record(record, ())
        .map_err(|err| CheckpointError::Encode(err.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(MAGIC)?;
    file.write_all(&version.to_le_bytes())?;
    file.write_all(&payload)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a checkpoint and rebuild its model on `device`.
///
/// Either everything loads and validates, or an error is returned: the model is only handed
/// out once its output dimension has been checked against the class names.
pub fn load<B: Backend, P: AsRef<Path>>(
    path: P,
    device: &B::Device,
) -> Result<Checkpoint<B>, CheckpointError> {
    let path = path.as_ref();
    let corrupt = |reason: String| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(CheckpointError::NotFound(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };

    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt("missing checkpoint header".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[MAGIC.len()..HEADER_LEN]);
    let version = u32::from_le_bytes(version);
    debug!("Checkpoint {:?} has format version {}", path, version);

    if version == 0 {
        return Err(corrupt("format version 0".to_string()));
    }
    if version > FORMAT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: version,
            supported: FORMAT_VERSION,
        });
    }

    let record: CheckpointRecord<B> = recorder()
        .load(bytes[HEADER_LEN..].to_vec(), device)
        .map_err(|err| corrupt(err.to_string()))?;

    let classes = ClassMapping::new(record.class_names);
    if classes.is_empty() {
        return Err(corrupt("empty class mapping".to_string()));
    }
    let config: MobileNetV2Config = serde_json::from_str(&record.model_config)
        .map_err(|err| corrupt(format!("invalid model config: {err}")))?;
    let config = MobileNetV2Config {
        num_classes: classes.len(),
        ..config
    };

    let model = config.init::<B>(device);
    let expected = model.param_shapes();
    let model = model.load_record(record.model);

    let outputs = model.num_classes();
    if outputs != classes.len() {
        return Err(CheckpointError::DimensionMismatch {
            path: path.to_path_buf(),
            classes: classes.len(),
            outputs,
        });
    }

    // The stored weights must fit the architecture described by the config
    let found = model.param_shapes();
    if found.len() != expected.len() {
        return Err(corrupt(format!(
            "{} stored tensors, the model config describes {}",
            found.len(),
            expected.len()
        )));
    }
    if let Some((index, (found, expected))) = found
        .iter()
        .zip(&expected)
        .enumerate()
        .find(|(_, (found, expected))| found != expected)
    {
        return Err(corrupt(format!(
            "tensor {index} has shape {found:?}, the model config expects {expected:?}"
        )));
    }

    info!(
        "Loaded checkpoint {:?} ({} classes)",
        path,
        classes.len()
    );
    Ok(Checkpoint {
        model,
        config,
        classes,
    })
}
