//! Configuration for bundle conversion.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `source_extension` | `bin` |
//! | `target_extension` | `safetensors` |
//! | `size_tolerance` | 0.01 (1% growth) |
//! | `metadata_key` / `metadata_value` | `format` / `pt` |
//! | `state_dict_key` | `Some("state_dict")` |
//! | `continue_on_error` | false |
//! | `output_dir` | `None` (write next to each source) |
//!
//! There are no environment-variable overrides; the CLI maps its flags onto
//! this struct.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ConvertError, ConvertResult};

/// Default maximum relative growth of the written file.
pub const DEFAULT_SIZE_TOLERANCE: f64 = 0.01;

/// Configuration for a conversion run.
///
/// # Example
///
/// ```rust
/// use tensor_convert_core::ConvertConfig;
///
/// let config = ConvertConfig::default()
///     .with_output_dir("/tmp/converted")
///     .with_continue_on_error(true);
/// config.validate()?;
/// # Ok::<(), tensor_convert_core::ConvertError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Extension of legacy bundles, without the dot.
    pub source_extension: String,

    /// Extension given to written files, without the dot.
    pub target_extension: String,

    /// Maximum allowed `(new - old) / old` size growth.
    ///
    /// Shrinking is always accepted.
    pub size_tolerance: f64,

    /// Key of the metadata tag written into every output header.
    pub metadata_key: String,

    /// Value of the metadata tag.
    pub metadata_value: String,

    /// Entry unwrapped when a checkpoint nests its tensors under it.
    ///
    /// `None` reads the top-level mapping only.
    pub state_dict_key: Option<String>,

    /// Record per-file failures and keep going instead of aborting the batch.
    pub continue_on_error: bool,

    /// Directory for written files. `None` writes each next to its source.
    pub output_dir: Option<PathBuf>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            source_extension: "bin".to_string(),
            target_extension: "safetensors".to_string(),
            size_tolerance: DEFAULT_SIZE_TOLERANCE,
            metadata_key: "format".to_string(),
            metadata_value: "pt".to_string(),
            state_dict_key: Some("state_dict".to_string()),
            continue_on_error: false,
            output_dir: None,
        }
    }
}

impl ConvertConfig {
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    #[must_use]
    pub fn with_size_tolerance(mut self, tolerance: f64) -> Self {
        self.size_tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_state_dict_key(mut self, key: Option<String>) -> Self {
        self.state_dict_key = key;
        self
    }

    /// Output directory, if one was configured.
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Header metadata written into every output file.
    #[must_use]
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([(self.metadata_key.clone(), self.metadata_value.clone())])
    }

    /// Validate configuration consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::InvalidConfig` if:
    /// - either extension is empty or contains a path separator
    /// - source and target extensions are equal (outputs would overwrite inputs)
    /// - `size_tolerance` is negative or not finite
    /// - `metadata_key` is empty
    pub fn validate(&self) -> ConvertResult<()> {
        for (field, ext) in [
            ("source_extension", &self.source_extension),
            ("target_extension", &self.target_extension),
        ] {
            if ext.is_empty() {
                return Err(ConvertError::InvalidConfig {
                    field: field.into(),
                    reason: "must not be empty".into(),
                });
            }
            if ext.contains(['/', '\\']) || ext.starts_with('.') {
                return Err(ConvertError::InvalidConfig {
                    field: field.into(),
                    reason: format!("must be a bare extension, got {:?}", ext),
                });
            }
        }

        if self.source_extension == self.target_extension {
            return Err(ConvertError::InvalidConfig {
                field: "target_extension".into(),
                reason: format!("must differ from source extension {:?}", self.source_extension),
            });
        }

        if !self.size_tolerance.is_finite() || self.size_tolerance < 0.0 {
            return Err(ConvertError::InvalidConfig {
                field: "size_tolerance".into(),
                reason: format!("must be a finite non-negative ratio, got {}", self.size_tolerance),
            });
        }

        if self.metadata_key.is_empty() {
            return Err(ConvertError::InvalidConfig {
                field: "metadata_key".into(),
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }
}
