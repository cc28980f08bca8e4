//! Batch conversion pipeline.
//!
//! [`Converter`] owns the configuration and a [`BundleSource`] and drives
//! each file through the stages tracked by [`ConversionState`]. The free
//! function [`convert_directory`] is the default-configured entry point.
//!
//! # Failure policy
//!
//! By default the first failing file aborts the batch. Setting
//! `continue_on_error` records per-file failures in the [`ConversionReport`]
//! instead. Input errors (no matching files, unreadable directory, empty
//! source) abort regardless.
//!
//! [`BundleSource`]: crate::source::BundleSource

mod discovery;
mod engine;
mod report;
mod state;


pub use discovery::{discover_legacy_files, target_path_for};
pub use engine::{convert_directory, Converter};
pub use report::{format_bytes, ConversionReport, FileReport};
pub use state::{ConversionState, FileConversion};
