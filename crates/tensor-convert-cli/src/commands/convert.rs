//! Convert command: runs a batch and reports it.
//!
//! # Usage
//!
//! ```bash
//! # Convert next to the sources
//! tensor-convert ./bert-base
//!
//! # Write elsewhere, keep going past bad files, print a JSON report
//! tensor-convert ./bert-base --output-path ./converted --continue-on-error --json
//! ```

use std::path::PathBuf;

use clap::Args;
use serde_json::json;
use tracing::{error, info, warn};

use tensor_convert_core::config::DEFAULT_SIZE_TOLERANCE;
use tensor_convert_core::pipeline::format_bytes;
use tensor_convert_core::{ConversionReport, ConvertConfig, ConvertError, Converter};

/// Arguments for the convert command.
#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Directory containing the .bin files to convert
    pub model_path: PathBuf,

    /// Directory for the .safetensors files (default: next to each source)
    #[arg(long, value_name = "DIR")]
    pub output_path: Option<PathBuf>,

    /// Record per-file failures and keep converting the rest
    #[arg(long)]
    pub continue_on_error: bool,

    /// Maximum allowed relative growth of a written file
    #[arg(long, default_value_t = DEFAULT_SIZE_TOLERANCE)]
    pub size_tolerance: f64,

    /// Print the conversion report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl ConvertArgs {
    fn to_config(&self) -> ConvertConfig {
        let mut config = ConvertConfig::default()
            .with_continue_on_error(self.continue_on_error)
            .with_size_tolerance(self.size_tolerance);
        if let Some(dir) = &self.output_path {
            config = config.with_output_dir(dir);
        }
        config
    }
}

/// Execute the convert command.
///
/// # Returns
///
/// Exit code:
/// - 0: every file converted
/// - 1: failures recorded under `--continue-on-error`
/// - otherwise `ConvertError::exit_code()` of the error that stopped the batch
pub fn handle_convert(args: ConvertArgs) -> i32 {
    info!("Converting .bin bundles in {:?}", args.model_path);

    let result = Converter::new(args.to_config()).and_then(|converter| {
        let config = converter.config();
        info!(
            size_tolerance = config.size_tolerance,
            continue_on_error = config.continue_on_error,
            "Converter ready"
        );
        converter.convert_directory(&args.model_path)
    });

    match result {
        Ok(report) => {
            if let Err(code) = print_report(&report, args.json) {
                return code;
            }
            if report.any_failed() {
                warn!("{} of {} files failed", report.failed_count(), report.files.len());
                1
            } else {
                0
            }
        }
        Err(e) => {
            error!(
                exit_code = e.exit_code(),
                category = %e.category(),
                error_code = %e.error_code(),
                "Conversion failed"
            );
            error!("Error details: {}", e);
            if args.json {
                print_error_json(&e);
            }
            e.exit_code()
        }
    }
}

fn print_report(report: &ConversionReport, as_json: bool) -> Result<(), i32> {
    if as_json {
        let out = serde_json::to_string_pretty(report).map_err(|e| {
            error!("Failed to serialize report: {}", e);
            1
        })?;
        println!("{}", out);
        return Ok(());
    }

    for file in &report.files {
        if file.succeeded() {
            println!(
                "converted {} -> {} ({} tensors, {} aliases dropped, {} -> {})",
                file.source.display(),
                file.target.display(),
                file.tensors_written,
                file.dropped.len(),
                format_bytes(file.source_bytes),
                format_bytes(file.target_bytes)
            );
        } else {
            println!("FAILED    {}: {}", file.source.display(), file.state);
        }
    }
    println!("{}", report.summary_line());
    Ok(())
}

fn print_error_json(e: &ConvertError) {
    let value = json!({
        "error": e.to_string(),
        "error_code": e.error_code(),
        "category": e.category(),
        "exit_code": e.exit_code(),
    });
    println!("{}", value);
}
