//! Conversion reports for single files and whole batches.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::alias::AliasGroup;

use super::state::ConversionState;

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// What happened to one legacy file.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Final state; `Done` on success.
    pub state: ConversionState,
    pub tensors_loaded: usize,
    /// Groups of names that shared storage.
    pub alias_groups: Vec<AliasGroup>,
    /// Names removed in favour of their group's first name.
    pub dropped: Vec<String>,
    pub tensors_written: usize,
    pub source_bytes: u64,
    pub target_bytes: u64,
    /// Relative size growth, set once the size check ran.
    pub growth: Option<f64>,
    /// Hex SHA-256 of the written file, set once it verified.
    pub target_sha256: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl FileReport {
    /// Empty report for a conversion that has not started.
    pub fn new(source: &Path, target: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            state: ConversionState::Pending,
            tensors_loaded: 0,
            alias_groups: Vec::new(),
            dropped: Vec::new(),
            tensors_written: 0,
            source_bytes: 0,
            target_bytes: 0,
            growth: None,
            target_sha256: None,
            duration: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == ConversionState::Done
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.state.is_failed()
    }
}

/// Outcome of a batch conversion, files in processing order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionReport {
    pub files: Vec<FileReport>,
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
}

impl ConversionReport {
    #[must_use]
    pub fn converted_count(&self) -> usize {
        self.files.iter().filter(|f| f.succeeded()).count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.files.iter().filter(|f| f.failed()).count()
    }

    #[must_use]
    pub fn any_failed(&self) -> bool {
        self.failed_count() > 0
    }

    /// True when at least one file was converted and none failed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        !self.files.is_empty() && self.converted_count() == self.files.len()
    }

    /// Total number of alias names dropped across all files.
    #[must_use]
    pub fn dropped_count(&self) -> usize {
        self.files.iter().map(|f| f.dropped.len()).sum()
    }

    #[must_use]
    pub fn total_source_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.source_bytes).sum()
    }

    #[must_use]
    pub fn total_target_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.target_bytes).sum()
    }

    /// One-line human-readable summary.
    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "{} converted, {} failed, {} aliases dropped, {} -> {} in {:?}",
            self.converted_count(),
            self.failed_count(),
            self.dropped_count(),
            format_bytes(self.total_source_bytes()),
            format_bytes(self.total_target_bytes()),
            self.total_duration
        )
    }
}
