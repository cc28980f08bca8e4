//! Finding legacy bundles and naming their outputs.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConvertError, ConvertResult};

/// List regular files in `dir` whose name ends with `.<extension>`.
///
/// The result is sorted by path so batches run in the same order on every
/// platform. Subdirectories are not descended into.
///
/// # Errors
///
/// - `ConvertError::InputDirUnreadable` if `dir` cannot be listed
/// - `ConvertError::NoInputFiles` if nothing matches
pub fn discover_legacy_files(dir: &Path, extension: &str) -> ConvertResult<Vec<PathBuf>> {
    let unreadable = |source: std::io::Error| {
        tracing::error!("[CNV-E003] Cannot read input directory {:?}: {}", dir, source);
        ConvertError::InputDirUnreadable {
            dir: dir.to_path_buf(),
            source,
        }
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let path = entry.path();
        // Follows symlinks, so a link to a checkpoint counts.
        if !path.is_file() {
            continue;
        }
        if has_extension(&path, extension) {
            files.push(path);
        }
    }

    if files.is_empty() {
        tracing::error!("[CNV-E001] No files ending with .{} found in {:?}", extension, dir);
        return Err(ConvertError::NoInputFiles {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
        });
    }

    files.sort();
    tracing::info!("Found {} .{} files in {:?}", files.len(), extension, dir);
    Ok(files)
}

// Suffix match on the file name, so a file called exactly `.bin` counts.
// `Path::extension` treats that name as a stem with no extension.
fn has_extension(path: &Path, extension: &str) -> bool {
    let suffix = format!(".{}", extension);
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(&suffix))
}

/// Output path for `source`: the trailing extension swapped for
/// `target_extension`, placed in `output_dir` when given and next to the
/// source otherwise.
///
/// Only the last extension changes, so `model.bin.bak.bin` becomes
/// `model.bin.bak.safetensors` and `.bin` becomes `.safetensors`.
#[must_use]
pub fn target_path_for(source: &Path, target_extension: &str, output_dir: Option<&Path>) -> PathBuf {
    let renamed = match source.file_name().and_then(|name| name.to_str()) {
        Some(name) => {
            let stem = match name.rfind('.') {
                Some(dot) => &name[..dot],
                None => name,
            };
            source.with_file_name(format!("{}.{}", stem, target_extension))
        }
        None => source.with_extension(target_extension),
    };
    match (output_dir, renamed.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => renamed,
    }
}
