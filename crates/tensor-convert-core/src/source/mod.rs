//! Readers that turn a legacy file into a [`TensorBundle`].
//!
//! The pipeline only sees the [`BundleSource`] trait. [`PthSource`] reads
//! PyTorch zip checkpoints from disk; [`MemorySource`] serves bundles built in
//! memory, which is how the pipeline is exercised without pickle fixtures.

mod memory;
mod pickle_index;
mod pth;

use std::path::Path;

use crate::error::ConvertResult;
use crate::tensor::TensorBundle;

pub use memory::MemorySource;
pub use pth::{detect_legacy_format, LegacyFormat, PthSource};

/// Loads one legacy bundle.
///
/// Implementations must yield tensors in the order the file stores them;
/// alias resolution keeps the first name of each group in that order.
pub trait BundleSource {
    /// Read every tensor stored in `path`.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::SourceLoadFailed` if the file cannot be parsed,
    /// or `ConvertError::UnsupportedDType` for an element type with no
    /// safetensors equivalent.
    fn load_bundle(&self, path: &Path) -> ConvertResult<TensorBundle>;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;
}

impl<S: BundleSource + ?Sized> BundleSource for &S {
    fn load_bundle(&self, path: &Path) -> ConvertResult<TensorBundle> {
        (**self).load_bundle(path)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
