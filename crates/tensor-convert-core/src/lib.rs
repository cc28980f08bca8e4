//! Conversion of legacy PyTorch tensor bundles to safetensors.
//!
//! Each `.bin` checkpoint in a directory is loaded, stripped of names that
//! alias another tensor's storage, copied into contiguous buffers, written as
//! `.safetensors`, and then checked: the output may not grow beyond a size
//! tolerance, and reloading it must reproduce every tensor bit for bit.
//!
//! # Architecture
//!
//! - **BundleSource**: Trait for reading a legacy file into a [`TensorBundle`]
//!   ([`PthSource`] for PyTorch zip checkpoints, [`MemorySource`] for bundles
//!   built in memory)
//! - **alias**: Storage-identity grouping and first-wins resolution
//! - **materialize**: Strided views to owned row-major buffers
//! - **safetensors_io** / **verify**: Writing, size check, round-trip check
//! - **pipeline**: [`Converter`] state machine and batch driver
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! let report = tensor_convert_core::convert_directory(Path::new("./model"), None)?;
//! assert!(report.all_succeeded());
//! # Ok::<(), tensor_convert_core::ConvertError>(())
//! ```

pub mod alias;
pub mod config;
pub mod error;
pub mod materialize;
pub mod pipeline;
pub mod safetensors_io;
pub mod source;
pub mod tensor;
pub mod verify;

pub use alias::{find_alias_groups, resolve_aliases, AliasGroup};
pub use config::ConvertConfig;
pub use error::{ConvertError, ConvertResult};
pub use materialize::{materialize, materialize_all, ContiguousTensor};
pub use pipeline::{
    convert_directory, ConversionReport, ConversionState, Converter, FileReport,
};
pub use safetensors_io::save_bundle;
pub use source::{BundleSource, MemorySource, PthSource};
pub use tensor::{DType, Storage, StorageId, TensorBundle, TensorHandle};
pub use verify::{check_file_size, verify_round_trip, RoundTrip, SizeCheck};
