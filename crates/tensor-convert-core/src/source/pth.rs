//! PyTorch checkpoint reader.
//!
//! Checkpoints written by `torch.save` since 1.6 are zip archives holding a
//! pickled mapping (`<dir>/data.pkl`) plus one raw little-endian entry per
//! storage (`<dir>/data/<key>`). The pickle is decoded into an ordered tensor
//! index (see [`decode_index`]), then the storage entries are read with the
//! `zip` crate. Every storage entry is read once and shared by all tensors
//! pointing into it, so tied weights come out as aliasing handles.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::config::ConvertConfig;
use crate::error::{ConvertError, ConvertResult};
use crate::tensor::{Storage, TensorBundle, TensorHandle};

use super::pickle_index::{decode_index, TensorRecord};
use super::BundleSource;

/// Zip local file header magic.
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Pickle PROTO opcode; the next byte is the protocol version.
const PICKLE_PROTO: u8 = 0x80;

/// Pickled mapping inside the archive, under a per-checkpoint directory.
const PICKLE_ENTRY: &str = "data.pkl";

/// Container layout of a legacy bundle, sniffed from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFormat {
    /// Zip archive (`torch.save` since 1.6).
    Zip,
    /// Bare pickle stream (`torch.save(..., _use_new_zipfile_serialization=False)`).
    Pickle,
    /// Neither of the above.
    Unknown,
}

impl LegacyFormat {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Pickle => "pickle",
            Self::Unknown => "unknown",
        }
    }
}

/// Sniff the container layout of `path`.
///
/// # Errors
///
/// Returns `ConvertError::SourceLoadFailed` if the file cannot be opened or
/// read.
pub fn detect_legacy_format(path: &Path) -> ConvertResult<LegacyFormat> {
    let mut file = File::open(path).map_err(|e| ConvertError::SourceLoadFailed {
        path: path.to_path_buf(),
        reason: format!("cannot open: {}", e),
    })?;

    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file
            .read(&mut magic[filled..])
            .map_err(|e| ConvertError::SourceLoadFailed {
                path: path.to_path_buf(),
                reason: format!("cannot read header: {}", e),
            })?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(classify_magic(&magic[..filled]))
}

fn classify_magic(magic: &[u8]) -> LegacyFormat {
    if magic.starts_with(ZIP_MAGIC) {
        LegacyFormat::Zip
    } else if magic.len() >= 2 && magic[0] == PICKLE_PROTO && (2..=5).contains(&magic[1]) {
        LegacyFormat::Pickle
    } else {
        LegacyFormat::Unknown
    }
}

/// Reads `.bin`/`.pt` checkpoints from disk.
#[derive(Debug, Clone)]
pub struct PthSource {
    state_dict_key: Option<String>,
}

impl Default for PthSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PthSource {
    /// Reader that unwraps a nested `state_dict` entry when present.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state_dict_key: Some("state_dict".to_string()),
        }
    }

    /// Reader that unwraps `key` when present, or never unwraps for `None`.
    #[must_use]
    pub fn with_state_dict_key(key: Option<String>) -> Self {
        Self {
            state_dict_key: key,
        }
    }

    #[must_use]
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self::with_state_dict_key(config.state_dict_key.clone())
    }
}

impl BundleSource for PthSource {
    fn load_bundle(&self, path: &Path) -> ConvertResult<TensorBundle> {
        let format = detect_legacy_format(path)?;
        tracing::debug!("{:?} is a {} checkpoint", path, format.as_str());
        match format {
            LegacyFormat::Zip => {}
            LegacyFormat::Pickle => {
                return Err(ConvertError::SourceLoadFailed {
                    path: path.to_path_buf(),
                    reason: "bare pickle checkpoints (pre zip serialization) are not supported; \
                             re-save with a zip-based torch.save"
                        .to_string(),
                });
            }
            LegacyFormat::Unknown => {
                return Err(ConvertError::SourceLoadFailed {
                    path: path.to_path_buf(),
                    reason: "not a PyTorch checkpoint (no zip or pickle header)".to_string(),
                });
            }
        }

        let file = File::open(path).map_err(|e| ConvertError::SourceLoadFailed {
            path: path.to_path_buf(),
            reason: format!("cannot open: {}", e),
        })?;
        let mut archive =
            zip::ZipArchive::new(BufReader::new(file)).map_err(|e| ConvertError::SourceLoadFailed {
                path: path.to_path_buf(),
                reason: format!("invalid zip archive: {}", e),
            })?;

        let pickle_name = archive
            .file_names()
            .find(|name| *name == PICKLE_ENTRY || name.ends_with(&format!("/{}", PICKLE_ENTRY)))
            .map(str::to_string)
            .ok_or_else(|| ConvertError::SourceLoadFailed {
                path: path.to_path_buf(),
                reason: format!("no {} in archive", PICKLE_ENTRY),
            })?;
        let data_dir = format!("{}data/", &pickle_name[..pickle_name.len() - PICKLE_ENTRY.len()]);

        let records = {
            let entry = archive
                .by_name(&pickle_name)
                .map_err(|e| ConvertError::SourceLoadFailed {
                    path: path.to_path_buf(),
                    reason: format!("cannot open {}: {}", pickle_name, e),
                })?;
            decode_index(&mut BufReader::new(entry), path, self.state_dict_key.as_deref())?
        };
        if records.is_empty() {
            return Err(ConvertError::SourceLoadFailed {
                path: path.to_path_buf(),
                reason: "no readable tensors in checkpoint".to_string(),
            });
        }

        let mut storages: HashMap<String, Storage> = HashMap::new();
        let mut bundle = TensorBundle::new();

        for record in records {
            let entry_name = format!("{}{}", data_dir, record.storage_key);
            let storage = match storages.get(&entry_name) {
                Some(storage) => storage.clone(),
                None => {
                    let storage = read_storage(&mut archive, path, &entry_name, &record)?;
                    storages.insert(entry_name, storage.clone());
                    storage
                }
            };

            bundle.insert(TensorHandle::new(
                record.name,
                record.dtype,
                record.shape,
                record.stride,
                record.offset,
                storage,
            ));
        }

        tracing::debug!(
            "Loaded {} tensors over {} storages from {:?}",
            bundle.len(),
            storages.len(),
            path
        );
        Ok(bundle)
    }

    fn name(&self) -> &'static str {
        "pth"
    }
}

fn read_storage(
    archive: &mut zip::ZipArchive<BufReader<File>>,
    path: &Path,
    entry_name: &str,
    record: &TensorRecord,
) -> ConvertResult<Storage> {
    let mut entry = archive
        .by_name(entry_name)
        .map_err(|e| ConvertError::SourceLoadFailed {
            path: path.to_path_buf(),
            reason: format!("missing storage entry '{}' for '{}': {}", entry_name, record.name, e),
        })?;

    let expected = record.storage_numel.saturating_mul(record.dtype.size_in_bytes());
    let mut bytes = Vec::with_capacity(expected);
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| ConvertError::SourceLoadFailed {
            path: path.to_path_buf(),
            reason: format!("cannot read storage entry '{}': {}", entry_name, e),
        })?;

    if bytes.len() < expected {
        return Err(ConvertError::SourceLoadFailed {
            path: path.to_path_buf(),
            reason: format!(
                "storage entry '{}' holds {} bytes, expected {}",
                entry_name,
                bytes.len(),
                expected
            ),
        });
    }

    Ok(Storage::new(entry_name, bytes))
}
