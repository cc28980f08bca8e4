//! Post-write checks: file size growth and round-trip equality.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ConvertError, ConvertResult};
use crate::materialize::ContiguousTensor;
use crate::safetensors_io;
use crate::tensor::DType;

/// Outcome of a passing size check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizeCheck {
    pub source_bytes: u64,
    pub target_bytes: u64,
    /// Relative growth `(target - source) / source`; negative when smaller.
    pub growth: f64,
}

/// Compare the written file's size against its source.
///
/// Passes unless the file grew by more than `tolerance` (relative). Shrinking
/// always passes, since dropped aliases legitimately make the output smaller.
///
/// # Errors
///
/// - `ConvertError::EmptySourceFile` if the source has zero bytes
/// - `ConvertError::SizeMismatch` if the growth exceeds `tolerance`
/// - `ConvertError::Io` if either file cannot be stat'ed
pub fn check_file_size(new_path: &Path, old_path: &Path, tolerance: f64) -> ConvertResult<SizeCheck> {
    let new_size = file_len(new_path)?;
    let old_size = file_len(old_path)?;

    if old_size == 0 {
        tracing::error!("[CNV-E002] Source file is empty: {:?}", old_path);
        return Err(ConvertError::EmptySourceFile {
            path: old_path.to_path_buf(),
        });
    }

    let growth = (new_size as f64 - old_size as f64) / old_size as f64;
    if growth > tolerance {
        tracing::error!(
            target: "convert::size",
            code = "CNV-E009",
            new_size,
            old_size,
            growth,
            tolerance,
            "[CNV-E009] {:?} grew beyond tolerance relative to {:?}",
            new_path,
            old_path
        );
        return Err(ConvertError::SizeMismatch {
            new_path: new_path.to_path_buf(),
            new_size,
            old_path: old_path.to_path_buf(),
            old_size,
            growth,
            tolerance,
        });
    }

    tracing::debug!(
        target: "convert::size",
        new_size,
        old_size,
        growth,
        "Size check passed for {:?}",
        new_path
    );
    Ok(SizeCheck {
        source_bytes: old_size,
        target_bytes: new_size,
        growth,
    })
}

fn file_len(path: &Path) -> ConvertResult<u64> {
    fs::metadata(path).map(|m| m.len()).map_err(|e| ConvertError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Outcome of a passing round-trip verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundTrip {
    pub tensors_checked: usize,
    /// Hex-encoded SHA-256 of the written file.
    pub sha256: String,
}

/// Reload `path` and check it against the tensors that were written.
///
/// Tensors are checked in the order of `expected`. Dtype, shape and raw
/// bytes must all match exactly; bytes are compared rather than values so
/// NaN payloads and signed zeros count as equal only when bit-identical. The
/// first mismatch is reported and nothing after it is checked. Every entry of
/// `metadata` must be present in the header with the same value.
///
/// # Errors
///
/// - `ConvertError::ReloadFailed` if the file cannot be read or parsed
/// - `ConvertError::VerificationFailed` naming the first differing key
/// - `ConvertError::MetadataMismatch` if a metadata entry is missing or differs
pub fn verify_round_trip(
    path: &Path,
    expected: &[ContiguousTensor],
    metadata: &HashMap<String, String>,
) -> ConvertResult<RoundTrip> {
    let bytes = safetensors_io::read_written(path)?;
    let reloaded = safetensors_io::parse(path, &bytes)?;

    for tensor in expected {
        compare_tensor(path, tensor, &reloaded)?;
    }

    if reloaded.len() != expected.len() {
        let extra = reloaded
            .names()
            .into_iter()
            .find(|name| !expected.iter().any(|t| t.name() == name.as_str()))
            .cloned()
            .unwrap_or_default();
        return Err(mismatch(
            path,
            &extra,
            format!(
                "file holds {} tensors, {} were written",
                reloaded.len(),
                expected.len()
            ),
        ));
    }

    let header = safetensors_io::read_metadata(path, &bytes)?;
    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();
    for key in keys {
        let want = &metadata[key];
        let found = header.get(key);
        if found != Some(want) {
            tracing::error!(
                "[CNV-E012] Metadata '{}' in {:?}: expected {:?}, found {:?}",
                key,
                path,
                want,
                found
            );
            return Err(ConvertError::MetadataMismatch {
                path: path.to_path_buf(),
                key: key.clone(),
                expected: want.clone(),
                actual: found.cloned(),
            });
        }
    }

    let sha256 = hex::encode(Sha256::digest(&bytes));
    tracing::info!(
        target: "convert::verify",
        tensors = expected.len(),
        sha256 = %sha256,
        "Verified {:?}",
        path
    );

    Ok(RoundTrip {
        tensors_checked: expected.len(),
        sha256,
    })
}

fn compare_tensor(
    path: &Path,
    expected: &ContiguousTensor,
    reloaded: &safetensors::SafeTensors<'_>,
) -> ConvertResult<()> {
    let name = expected.name();
    let view = reloaded
        .tensor(name)
        .map_err(|_| mismatch(path, name, "missing from written file".to_string()))?;

    if DType::from_safetensors(view.dtype()) != Some(expected.dtype()) {
        return Err(mismatch(
            path,
            name,
            format!("dtype {:?} != {}", view.dtype(), expected.dtype()),
        ));
    }

    if view.shape() != expected.shape() {
        return Err(mismatch(
            path,
            name,
            format!("shape {:?} != {:?}", view.shape(), expected.shape()),
        ));
    }

    let actual = view.data();
    if actual != expected.data() {
        let reason = match actual.iter().zip(expected.data()).position(|(a, b)| a != b) {
            Some(offset) => format!("first differing byte at offset {}", offset),
            None => format!("{} bytes != {} bytes", actual.len(), expected.data().len()),
        };
        return Err(mismatch(path, name, reason));
    }

    Ok(())
}

fn mismatch(path: &Path, key: &str, reason: String) -> ConvertError {
    tracing::error!(
        target: "convert::verify",
        code = "CNV-E011",
        key = %key,
        "[CNV-E011] The output tensors do not match for key {}: {}",
        key,
        reason
    );
    ConvertError::VerificationFailed {
        path: path.to_path_buf(),
        key: key.to_string(),
        reason,
    }
}
