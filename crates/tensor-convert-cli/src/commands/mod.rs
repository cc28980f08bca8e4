//! CLI command handlers
//!
//! # Modules
//!
//! - `convert`: Directory conversion and report output

pub mod convert;
