//! tensor-convert CLI
//!
//! Converts every legacy `.bin` tensor bundle in a directory to
//! `.safetensors`, dropping tied-weight aliases and verifying each written
//! file against the tensors it was written from.
//!
//! # Exit codes
//!
//! - 0: every file converted and verified
//! - 1: general failure, or failures recorded with `--continue-on-error`
//! - 2: a written file did not round-trip
//! - 3: no input files, unreadable directory, or empty source file
//! - 4: a bundle could not be loaded
//! - 5: a tensor could not be made contiguous
//! - 6: output could not be written
//! - 7: output grew beyond the size tolerance

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

/// Convert PyTorch .bin tensor bundles to safetensors
#[derive(Parser)]
#[command(name = "tensor-convert")]
#[command(version)]
#[command(about = "Convert legacy .bin tensor bundles to .safetensors with round-trip verification")]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(flatten)]
    convert: commands::convert::ConvertArgs,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else {
        match cli.verbose {
            0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = commands::convert::handle_convert(cli.convert);
    std::process::exit(exit_code);
}
