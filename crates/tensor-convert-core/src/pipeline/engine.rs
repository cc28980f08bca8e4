//! Converter engine: runs the per-file pipeline and sequences batches.
//!
//! Each file goes load -> alias resolution -> materialize -> write -> size
//! check -> verify, strictly in that order, and finishes before the next file
//! starts. Nothing carries over between files.

use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::alias::{find_alias_groups, resolve_aliases};
use crate::config::ConvertConfig;
use crate::error::{ConvertError, ConvertResult};
use crate::materialize::materialize_all;
use crate::safetensors_io::save_bundle;
use crate::source::{BundleSource, PthSource};
use crate::verify::{check_file_size, verify_round_trip};

use super::discovery::{discover_legacy_files, target_path_for};
use super::report::{format_bytes, ConversionReport, FileReport};
use super::state::{ConversionState, FileConversion};

/// Converts legacy bundles read through `S` into safetensors files.
#[derive(Debug, Clone)]
pub struct Converter<S = PthSource> {
    config: ConvertConfig,
    source: S,
}

impl Converter<PthSource> {
    /// Converter reading PyTorch checkpoints from disk.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::InvalidConfig` if `config` does not validate.
    pub fn new(config: ConvertConfig) -> ConvertResult<Self> {
        let source = PthSource::from_config(&config);
        Self::with_source(config, source)
    }
}

impl<S: BundleSource> Converter<S> {
    /// Converter reading bundles through `source`.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::InvalidConfig` if `config` does not validate.
    pub fn with_source(config: ConvertConfig, source: S) -> ConvertResult<Self> {
        config.validate()?;
        tracing::debug!("Creating Converter ({} source) with config: {:?}", source.name(), config);
        Ok(Self { config, source })
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Convert one legacy file to `target`.
    ///
    /// The target's parent directory is created if needed. Output written
    /// before a failing size check or verification stays on disk.
    ///
    /// # Errors
    ///
    /// Any error from the pipeline stages; see [`ConvertError`].
    pub fn convert_file(&self, source: &Path, target: &Path) -> ConvertResult<FileReport> {
        let (report, result) = self.run_file(source, target);
        result.map(|()| report)
    }

    /// Convert every legacy file in `dir`, in sorted name order.
    ///
    /// With `continue_on_error` off, the first failing file aborts the batch
    /// and its error is returned. With it on, failures are recorded in the
    /// report and the batch continues. Input errors abort either way.
    ///
    /// # Errors
    ///
    /// - `ConvertError::NoInputFiles` / `InputDirUnreadable` before anything
    ///   is written
    /// - the first per-file error, unless `continue_on_error` is set
    pub fn convert_directory(&self, dir: &Path) -> ConvertResult<ConversionReport> {
        let started = Instant::now();
        let files = discover_legacy_files(dir, &self.config.source_extension)?;
        let total = files.len();

        let mut report = ConversionReport::default();
        for (i, source) in files.iter().enumerate() {
            let target = target_path_for(
                source,
                &self.config.target_extension,
                self.config.output_dir(),
            );
            tracing::info!("[{}/{}] Converting {:?} -> {:?}", i + 1, total, source, target);

            let (file_report, result) = self.run_file(source, &target);
            report.files.push(file_report);

            if let Err(e) = result {
                if e.is_input_error() || !self.config.continue_on_error {
                    return Err(e);
                }
                tracing::warn!(
                    "Continuing after failure on {:?} ({} of {} files left)",
                    source,
                    total - i - 1,
                    total
                );
            }
        }

        report.total_duration = started.elapsed();
        tracing::info!("Batch finished: {}", report.summary_line());
        Ok(report)
    }

    /// Run the pipeline for one file, returning the report alongside the
    /// outcome so failed files can still be reported.
    fn run_file(&self, source: &Path, target: &Path) -> (FileReport, ConvertResult<()>) {
        let started = Instant::now();
        let mut report = FileReport::new(source, target);
        let mut tracker = FileConversion::new();

        let result = self.run_stages(source, target, &mut report, &mut tracker);
        if let Err(e) = &result {
            tracker.fail(e);
            tracing::error!(
                exit_code = e.exit_code(),
                category = %e.category(),
                error_code = %e.error_code(),
                "Conversion of {:?} failed: {}",
                source,
                e
            );
        }

        report.state = tracker.into_state();
        report.duration = started.elapsed();
        (report, result)
    }

    fn run_stages(
        &self,
        source: &Path,
        target: &Path,
        report: &mut FileReport,
        tracker: &mut FileConversion,
    ) -> ConvertResult<()> {
        let source_bytes = fs::metadata(source)
            .map_err(|e| ConvertError::Io {
                path: source.to_path_buf(),
                source: e,
            })?
            .len();
        if source_bytes == 0 {
            tracing::error!("[CNV-E002] Source file is empty: {:?}", source);
            return Err(ConvertError::EmptySourceFile {
                path: source.to_path_buf(),
            });
        }
        report.source_bytes = source_bytes;

        let mut bundle = self.source.load_bundle(source)?;
        report.tensors_loaded = bundle.len();
        tracker.advance(ConversionState::Loaded)?;
        tracing::debug!("Loaded {} tensors from {:?}", bundle.len(), source);

        let groups = find_alias_groups(&bundle);
        let dropped = resolve_aliases(&mut bundle, &groups);
        if !dropped.is_empty() {
            tracing::info!(
                "Dropped {} aliased tensors in {} groups from {:?}",
                dropped.len(),
                groups.len(),
                source
            );
        }
        report.alias_groups = groups;
        report.dropped = dropped;
        tracker.advance(ConversionState::AliasesResolved)?;

        let tensors = materialize_all(&bundle)?;
        tracker.advance(ConversionState::Materialized)?;

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                tracing::error!("[CNV-E007] Cannot create output directory {:?}: {}", parent, e);
                ConvertError::OutputDirFailed {
                    dir: parent.to_path_buf(),
                    source: e,
                }
            })?;
        }

        let metadata = self.config.metadata();
        save_bundle(&tensors, target, &metadata)?;
        report.tensors_written = tensors.len();
        tracker.advance(ConversionState::Written)?;

        let size = check_file_size(target, source, self.config.size_tolerance)?;
        report.target_bytes = size.target_bytes;
        report.growth = Some(size.growth);
        tracker.advance(ConversionState::SizeChecked)?;

        let round_trip = verify_round_trip(target, &tensors, &metadata)?;
        report.target_sha256 = Some(round_trip.sha256);
        tracker.advance(ConversionState::Verified)?;
        tracker.advance(ConversionState::Done)?;

        tracing::info!(
            "Converted {:?}: {} tensors, {} -> {}",
            source,
            report.tensors_written,
            format_bytes(report.source_bytes),
            format_bytes(report.target_bytes)
        );
        Ok(())
    }
}

/// Convert every `.bin` bundle in `path` with default settings.
///
/// Outputs land next to their sources, or in `output_path` when given. This
/// touches no process-wide state and never exits; callers map the error to
/// an exit code themselves.
///
/// # Errors
///
/// See [`Converter::convert_directory`].
pub fn convert_directory(path: &Path, output_path: Option<&Path>) -> ConvertResult<ConversionReport> {
    let mut config = ConvertConfig::default();
    config.output_dir = output_path.map(Path::to_path_buf);
    Converter::new(config)?.convert_directory(path)
}
