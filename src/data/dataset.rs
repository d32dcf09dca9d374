use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::preprocess::PreparedImage;
use crate::error::{DataLoadError, DatasetError};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Ordered correspondence between model output indices and class names.
///
/// Index `i` of the classifier output is the class `names()[i]`. The order is the
/// lexicographic order of the class directories found at training time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMapping {
    names: Vec<String>,
}

impl ClassMapping {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Discover the classes of a dataset split: one class per subdirectory, sorted by name.
    pub fn from_directory<P: AsRef<Path>>(root: P) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(DatasetError::MissingRoot(root.to_path_buf()));
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        if names.is_empty() {
            return Err(DatasetError::NoClasses(root.to_path_buf()));
        }

        Ok(Self { names })
    }

    /// Read the legacy standalone mapping, a JSON object such as `{"0": "blighted", "1": "healthy"}`.
    #[deprecated(note = "class names are stored in the checkpoint")]
    pub fn from_legacy_json<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path)?;
        let raw: BTreeMap<String, String> = serde_json::from_str(&content)
            .map_err(|err| DatasetError::InvalidMapping(err.to_string()))?;

        let mut indexed = raw
            .into_iter()
            .map(|(key, name)| {
                key.parse::<usize>()
                    .map(|index| (index, name))
                    .map_err(|_| DatasetError::InvalidMapping(format!("{key:?} is not an index")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        indexed.sort_by_key(|(index, _)| *index);

        if let Some((position, (index, _))) = indexed
            .iter()
            .enumerate()
            .find(|(position, (index, _))| position != index)
        {
            return Err(DatasetError::InvalidMapping(format!(
                "expected index {position}, found {index}"
            )));
        }
        if indexed.is_empty() {
            return Err(DatasetError::InvalidMapping("no classes".to_string()));
        }

        Ok(Self {
            names: indexed.into_iter().map(|(_, name)| name).collect(),
        })
    }

    /// Write the legacy standalone mapping next to a checkpoint for older tooling.
    pub fn write_legacy_json<P: AsRef<Path>>(&self, path: P) -> Result<(), DatasetError> {
        let raw: BTreeMap<usize, &str> = self
            .names
            .iter()
            .enumerate()
            .map(|(index, name)| (index, name.as_str()))
            .collect();
        let content = serde_json::to_string_pretty(&raw)
            .map_err(|err| DatasetError::InvalidMapping(err.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

/// One labelled image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

impl ImageItem {
    pub fn load(&self) -> Result<PreparedImage, DataLoadError> {
        PreparedImage::open(&self.path).map_err(|source| DataLoadError {
            path: self.path.clone(),
            source,
        })
    }
}

/// Images grouped into classes by directory name:
///
/// ```text
/// root/
/// ├── blighted/
/// │   ├── 001.jpg
/// │   └── 002.jpg
/// └── healthy/
///     └── ...
/// ```
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub root: PathBuf,
    pub classes: ClassMapping,
    pub items: Vec<ImageItem>,
}

impl ImageFolder {
    /// Discover the classes and the images of `root`.
    pub fn discover<P: AsRef<Path>>(root: P) -> Result<Self, DatasetError> {
        let classes = ClassMapping::from_directory(&root)?;
        Self::with_classes(root, classes)
    }

    /// List the images of `root` labelled with an existing mapping. Every class directory
    /// must be part of the mapping; classes of the mapping without a directory are allowed.
    pub fn with_classes<P: AsRef<Path>>(
        root: P,
        classes: ClassMapping,
    ) -> Result<Self, DatasetError> {
        let root = root.as_ref().to_path_buf();
        info!("Loading image folder from {:?}", root);

        let found = ClassMapping::from_directory(&root)?;
        if let Some(unknown) = found.names().iter().find(|n| classes.index_of(n).is_none()) {
            return Err(DatasetError::UnknownClass {
                root,
                class: unknown.clone(),
            });
        }

        let mut items = Vec::new();
        for class_name in found.names() {
            let label = classes.index_of(class_name).unwrap_or_default();
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(root.join(class_name))? {
                let path = entry?.path();
                if path.is_file() && has_image_extension(&path) {
                    paths.push(path);
                }
            }
            paths.sort();

            debug!(
                "Class '{}' (label {}): {} images",
                class_name,
                label,
                paths.len()
            );
            items.extend(paths.into_iter().map(|path| ImageItem { path, label }));
        }

        info!(
            "Found {} images in {} classes",
            items.len(),
            found.len()
        );

        Ok(Self {
            root,
            classes,
            items,
        })
    }

    /// Keep at most `max` images per class, in listing order. The class mapping is unchanged.
    pub fn cap_per_class(mut self, max: usize) -> Self {
        let mut counts = vec![0usize; self.classes.len()];
        self.items.retain(|item| {
            let count = &mut counts[item.label];
            *count += 1;
            *count <= max
        });
        info!(
            "Dev mode: kept {} images (at most {} per class)",
            self.items.len(),
            max
        );
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of images per class index.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.classes.len()];
        for item in &self.items {
            counts[item.label] += 1;
        }
        counts
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}
