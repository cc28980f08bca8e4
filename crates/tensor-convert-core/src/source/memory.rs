//! Bundles served from memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ConvertError, ConvertResult};
use crate::tensor::TensorBundle;

use super::BundleSource;

/// Source that returns pre-built bundles keyed by path.
///
/// The file at the path is never opened, so the pipeline's filesystem steps
/// (discovery, size check) still need a real file there.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    bundles: HashMap<PathBuf, TensorBundle>,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bundle` as the contents of `path`.
    pub fn insert(&mut self, path: impl Into<PathBuf>, bundle: TensorBundle) {
        self.bundles.insert(path.into(), bundle);
    }

    #[must_use]
    pub fn with_bundle(mut self, path: impl Into<PathBuf>, bundle: TensorBundle) -> Self {
        self.insert(path, bundle);
        self
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

impl BundleSource for MemorySource {
    fn load_bundle(&self, path: &Path) -> ConvertResult<TensorBundle> {
        self.bundles
            .get(path)
            .cloned()
            .ok_or_else(|| ConvertError::SourceLoadFailed {
                path: path.to_path_buf(),
                reason: "no bundle registered for this path".to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
