//! Writing and re-reading safetensors files.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use safetensors::SafeTensors;

use crate::error::{ConvertError, ConvertResult};
use crate::materialize::ContiguousTensor;

/// Serialize `tensors` to `path` with `metadata` in the header.
///
/// The safetensors writer orders entries by its own rules; names are the
/// only link back to load order.
///
/// # Errors
///
/// Returns `ConvertError::WriteFailed` if a tensor's bytes do not match its
/// shape and dtype, or if the file cannot be written.
pub fn save_bundle(
    tensors: &[ContiguousTensor],
    path: &Path,
    metadata: &HashMap<String, String>,
) -> ConvertResult<()> {
    let views = tensors
        .iter()
        .map(|t| {
            t.view()
                .map(|view| (t.name().to_string(), view))
                .map_err(|e| write_failed(path, format!("tensor '{}': {:?}", t.name(), e)))
        })
        .collect::<ConvertResult<Vec<_>>>()?;

    let metadata = (!metadata.is_empty()).then(|| metadata.clone());
    safetensors::tensor::serialize_to_file(views, &metadata, path)
        .map_err(|e| write_failed(path, format!("{:?}", e)))?;

    tracing::debug!("Wrote {} tensors to {:?}", tensors.len(), path);
    Ok(())
}

fn write_failed(path: &Path, reason: String) -> ConvertError {
    tracing::error!("[CNV-E008] Failed to write {:?}: {}", path, reason);
    ConvertError::WriteFailed {
        path: path.to_path_buf(),
        reason,
    }
}

/// Read a written file back into memory.
///
/// # Errors
///
/// Returns `ConvertError::ReloadFailed` if the file cannot be read.
pub fn read_written(path: &Path) -> ConvertResult<Vec<u8>> {
    fs::read(path).map_err(|e| reload_failed(path, format!("cannot read file: {}", e)))
}

/// Parse `bytes` as a safetensors file.
///
/// # Errors
///
/// Returns `ConvertError::ReloadFailed` if the header or data section is
/// malformed.
pub fn parse<'a>(path: &Path, bytes: &'a [u8]) -> ConvertResult<SafeTensors<'a>> {
    SafeTensors::deserialize(bytes)
        .map_err(|e| reload_failed(path, format!("SafeTensors parse error: {:?}", e)))
}

/// Header metadata of a safetensors file, empty if it carries none.
///
/// # Errors
///
/// Returns `ConvertError::ReloadFailed` if the header is malformed.
pub fn read_metadata(path: &Path, bytes: &[u8]) -> ConvertResult<HashMap<String, String>> {
    let (_, header) = SafeTensors::read_metadata(bytes)
        .map_err(|e| reload_failed(path, format!("SafeTensors header error: {:?}", e)))?;
    Ok(header.metadata().clone().unwrap_or_default())
}

fn reload_failed(path: &Path, reason: String) -> ConvertError {
    tracing::error!("[CNV-E010] Failed to reload {:?}: {}", path, reason);
    ConvertError::ReloadFailed {
        path: path.to_path_buf(),
        reason,
    }
}
