//! Error types and exit codes for bundle conversion.
//!
//! # Exit Code Mapping
//!
//! | Exit Code | Error Variant | Description |
//! |-----------|---------------|-------------|
//! | 1 | `InvalidConfig`, `InvalidStateTransition`, `Io` | General failure |
//! | 2 | `ReloadFailed`, `VerificationFailed`, `MetadataMismatch` | Written file does not round-trip |
//! | 3 | `NoInputFiles`, `EmptySourceFile`, `InputDirUnreadable` | Unusable input |
//! | 4 | `SourceLoadFailed`, `UnsupportedDType` | Legacy bundle could not be read |
//! | 5 | `MaterializeFailed` | Tensor layout could not be made contiguous |
//! | 6 | `OutputDirFailed`, `WriteFailed` | Output could not be written |
//! | 7 | `SizeMismatch` | Output grew beyond the size tolerance |
//!
//! Every variant is fatal for the file being converted. Input errors are
//! additionally fatal for the whole batch.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for conversion operations.
#[derive(Debug, Error)]
pub enum ConvertError {
    // === Exit Code 3: Input ===
    /// No file in the input directory carries the legacy extension.
    #[error("[CNV-E001] No files ending with .{extension} found in {dir:?}")]
    NoInputFiles {
        /// Directory that was scanned.
        dir: PathBuf,
        /// Extension that was searched for (without the dot).
        extension: String,
    },

    /// Source file has zero bytes; the size ratio is undefined.
    #[error("[CNV-E002] Source file is empty: {path:?}")]
    EmptySourceFile {
        /// The zero-byte source file.
        path: PathBuf,
    },

    /// The input directory could not be listed.
    #[error("[CNV-E003] Cannot read input directory {dir:?}: {source}")]
    InputDirUnreadable {
        /// Directory that failed to list.
        dir: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    // === Exit Code 4: Load ===
    /// The legacy bundle could not be parsed.
    #[error("[CNV-E004] Failed to load {path:?}: {reason}")]
    SourceLoadFailed {
        /// Legacy bundle path.
        path: PathBuf,
        /// Human-readable parse error.
        reason: String,
    },

    /// A tensor uses an element type the converter cannot represent.
    #[error("[CNV-E005] Tensor '{name}' has unsupported dtype {dtype}")]
    UnsupportedDType {
        /// Tensor name.
        name: String,
        /// Dtype as reported by the loader.
        dtype: String,
    },

    // === Exit Code 5: Materialization ===
    /// A tensor view could not be copied into a contiguous buffer.
    #[error("[CNV-E006] Cannot make tensor '{name}' contiguous: {reason}")]
    MaterializeFailed {
        /// Tensor name.
        name: String,
        /// Why the layout could not be resolved.
        reason: String,
    },

    // === Exit Code 6: Write ===
    /// The output directory could not be created.
    #[error("[CNV-E007] Cannot create output directory {dir:?}: {source}")]
    OutputDirFailed {
        /// Directory that failed to be created.
        dir: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Serializing the surviving tensors failed.
    #[error("[CNV-E008] Failed to write {path:?}: {reason}")]
    WriteFailed {
        /// Output path.
        path: PathBuf,
        /// Writer error message.
        reason: String,
    },

    // === Exit Code 7: Size ===
    /// The written file grew more than the configured tolerance.
    #[error(
        "[CNV-E009] The file size difference is more than {tolerance}: \
         {new_path:?} is {new_size} bytes, {old_path:?} is {old_size} bytes (growth {growth:.4})"
    )]
    SizeMismatch {
        /// Written file.
        new_path: PathBuf,
        /// Written file size in bytes.
        new_size: u64,
        /// Legacy source file.
        old_path: PathBuf,
        /// Legacy file size in bytes.
        old_size: u64,
        /// Relative growth `(new - old) / old`.
        growth: f64,
        /// Maximum allowed relative growth.
        tolerance: f64,
    },

    // === Exit Code 2: Round trip ===
    /// The written file could not be read back.
    #[error("[CNV-E010] Failed to reload {path:?}: {reason}")]
    ReloadFailed {
        /// Written file.
        path: PathBuf,
        /// Reader error message.
        reason: String,
    },

    /// A reloaded tensor differs from the tensor that was written.
    #[error("[CNV-E011] The output tensors do not match for key {key}: {reason}")]
    VerificationFailed {
        /// Written file.
        path: PathBuf,
        /// First key found to differ.
        key: String,
        /// What differed (dtype, shape, or bytes).
        reason: String,
    },

    /// The metadata tag did not survive the round trip.
    #[error("[CNV-E012] Metadata '{key}' in {path:?}: expected {expected:?}, found {actual:?}")]
    MetadataMismatch {
        /// Written file.
        path: PathBuf,
        /// Metadata key.
        key: String,
        /// Value that was written.
        expected: String,
        /// Value read back, if any.
        actual: Option<String>,
    },

    // === Exit Code 1: General ===
    /// Invalid configuration value.
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Pipeline stages were driven out of order.
    #[error("Invalid conversion state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Filesystem error outside the categories above.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    /// Get the process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ReloadFailed { .. }
            | Self::VerificationFailed { .. }
            | Self::MetadataMismatch { .. } => 2,
            Self::NoInputFiles { .. }
            | Self::EmptySourceFile { .. }
            | Self::InputDirUnreadable { .. } => 3,
            Self::SourceLoadFailed { .. } | Self::UnsupportedDType { .. } => 4,
            Self::MaterializeFailed { .. } => 5,
            Self::OutputDirFailed { .. } | Self::WriteFailed { .. } => 6,
            Self::SizeMismatch { .. } => 7,
            Self::InvalidConfig { .. } | Self::InvalidStateTransition { .. } | Self::Io { .. } => {
                1
            }
        }
    }

    /// Input errors abort the whole batch even when per-file isolation is on.
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::NoInputFiles { .. } | Self::EmptySourceFile { .. } | Self::InputDirUnreadable { .. }
        )
    }

    /// Get the error category name for logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::NoInputFiles { .. }
            | Self::EmptySourceFile { .. }
            | Self::InputDirUnreadable { .. } => "INPUT",
            Self::SourceLoadFailed { .. } | Self::UnsupportedDType { .. } => "LOAD",
            Self::MaterializeFailed { .. } => "MATERIALIZE",
            Self::OutputDirFailed { .. } | Self::WriteFailed { .. } => "WRITE",
            Self::SizeMismatch { .. } => "SIZE",
            Self::ReloadFailed { .. }
            | Self::VerificationFailed { .. }
            | Self::MetadataMismatch { .. } => "VERIFY",
            Self::InvalidConfig { .. } => "CONFIG",
            Self::InvalidStateTransition { .. } => "STATE",
            Self::Io { .. } => "IO",
        }
    }

    /// Get the structured error code for logging (e.g., "ERR-CONVERT-SIZE-MISMATCH").
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoInputFiles { .. } => "ERR-CONVERT-NO-INPUT",
            Self::EmptySourceFile { .. } => "ERR-CONVERT-EMPTY-SOURCE",
            Self::InputDirUnreadable { .. } => "ERR-CONVERT-INPUT-DIR",
            Self::SourceLoadFailed { .. } => "ERR-CONVERT-LOAD",
            Self::UnsupportedDType { .. } => "ERR-CONVERT-DTYPE",
            Self::MaterializeFailed { .. } => "ERR-CONVERT-MATERIALIZE",
            Self::OutputDirFailed { .. } => "ERR-CONVERT-OUTPUT-DIR",
            Self::WriteFailed { .. } => "ERR-CONVERT-WRITE",
            Self::SizeMismatch { .. } => "ERR-CONVERT-SIZE-MISMATCH",
            Self::ReloadFailed { .. } => "ERR-CONVERT-RELOAD",
            Self::VerificationFailed { .. } => "ERR-CONVERT-VERIFY",
            Self::MetadataMismatch { .. } => "ERR-CONVERT-METADATA",
            Self::InvalidConfig { .. } => "ERR-CONVERT-CONFIG",
            Self::InvalidStateTransition { .. } => "ERR-CONVERT-STATE",
            Self::Io { .. } => "ERR-CONVERT-IO",
        }
    }
}

/// Result type alias for conversion operations.
pub type ConvertResult<T> = Result<T, ConvertError>;
