//! Tensor index of a PyTorch checkpoint, decoded from its `data.pkl`.
//!
//! `candle_core::pickle::Stack` executes the pickle opcodes. Its SETITEMS and
//! DICT handlers store each batch back to front, so the key order of the
//! decoded dict is not the checkpoint's. [`decode_index`] steps the stack one
//! opcode at a time, records every key in stream order just before it is
//! stored, and sorts the decoded tensors by that order.
//!
//! Tensors are recognised by their rebuild call. Every torch storage class
//! with a safetensors counterpart is mapped; a tensor that cannot be decoded
//! fails the load instead of going missing from the output.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use candle_core::pickle::{Object, OpCode, Stack};

use crate::error::{ConvertError, ConvertResult};
use crate::tensor::DType;

const SET_ITEM: u8 = OpCode::SetItem as u8;
const SET_ITEMS: u8 = OpCode::SetItems as u8;
const DICT: u8 = OpCode::Dict as u8;

/// Attribute state torch attaches to a state dict; merged into the mapping
/// by the pickle BUILD step.
const METADATA_KEY: &str = "_metadata";

/// One tensor entry of the checkpoint's mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRecord {
    pub name: String,
    pub dtype: DType,
    /// Entry name under the archive's `data/` directory.
    pub storage_key: String,
    /// Element count of the whole storage.
    pub storage_numel: usize,
    /// Offset of the first element, in elements.
    pub offset: usize,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
}

/// Element type of a torch storage class.
#[must_use]
pub fn storage_dtype(class_name: &str) -> Option<DType> {
    let dtype = match class_name {
        "FloatStorage" => DType::F32,
        "DoubleStorage" => DType::F64,
        "HalfStorage" => DType::F16,
        "BFloat16Storage" => DType::BF16,
        "ByteStorage" => DType::U8,
        "CharStorage" => DType::I8,
        "ShortStorage" => DType::I16,
        "IntStorage" => DType::I32,
        "LongStorage" => DType::I64,
        "BoolStorage" => DType::Bool,
        _ => return None,
    };
    Some(dtype)
}

/// Decode the tensor entries of a `data.pkl` stream, in checkpoint order.
///
/// With `state_dict_key`, a nested mapping stored under that key is used
/// instead of the top level when present.
///
/// # Errors
///
/// - `ConvertError::SourceLoadFailed` if the pickle cannot be decoded, does
///   not hold a mapping, or holds a tensor in an unknown encoding
/// - `ConvertError::UnsupportedDType` for a tensor whose storage class has no
///   safetensors counterpart
pub fn decode_index<R: BufRead>(
    reader: &mut R,
    path: &Path,
    state_dict_key: Option<&str>,
) -> ConvertResult<Vec<TensorRecord>> {
    let load_failed = |reason: String| ConvertError::SourceLoadFailed {
        path: path.to_path_buf(),
        reason,
    };

    let mut stack = Stack::empty();
    let mut order = KeyOrder::default();
    loop {
        let next = reader
            .fill_buf()
            .map_err(|e| load_failed(format!("cannot read pickle: {}", e)))?
            .first()
            .copied();
        if let Some(opcode) = next {
            order.observe(opcode, stack.stack());
        }
        let stopped = stack
            .read(&mut *reader)
            .map_err(|e| load_failed(format!("cannot decode pickle: {}", e)))?;
        if stopped {
            break;
        }
    }
    let root = stack
        .finalize()
        .map_err(|e| load_failed(format!("cannot decode pickle: {}", e)))?;

    let mapping = select_mapping(unwrap_module(root), state_dict_key)
        .ok_or_else(|| load_failed("checkpoint does not hold a name -> tensor mapping".to_string()))?;

    let mut records = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = match key {
            Object::Unicode(name) => name,
            other => {
                tracing::warn!("Skipping entry with non-string key {:?} in {:?}", other, path);
                continue;
            }
        };
        match decode_tensor(&name, value) {
            Ok(Some(record)) => records.push(record),
            Ok(None) if name == METADATA_KEY => {}
            Ok(None) => tracing::warn!("Skipping non-tensor entry '{}' in {:?}", name, path),
            Err(EntryError::UnsupportedStorage(class)) => {
                tracing::error!("[CNV-E005] Tensor '{}' has unsupported storage {}", name, class);
                return Err(ConvertError::UnsupportedDType { name, dtype: class });
            }
            Err(EntryError::Malformed(reason)) => {
                return Err(load_failed(format!("tensor '{}': {}", name, reason)));
            }
        }
    }

    records.sort_by_key(|r| order.rank(&r.name));
    tracing::debug!("Decoded {} tensor entries from {:?}", records.len(), path);
    Ok(records)
}

/// Stream position of every string key stored into a dict. The first
/// occurrence wins, so keys of a nested dict rank by where they were written.
#[derive(Debug, Default)]
struct KeyOrder {
    rank: HashMap<String, usize>,
}

impl KeyOrder {
    /// Record the keys `opcode` is about to store, given the stack before it
    /// runs.
    fn observe(&mut self, opcode: u8, stack: &[Object]) {
        match opcode {
            SET_ITEMS | DICT => {
                if let Some(mark) = stack.iter().rposition(|o| *o == Object::Mark) {
                    for pair in stack[mark + 1..].chunks_exact(2) {
                        self.record(&pair[0]);
                    }
                }
            }
            SET_ITEM => {
                if let [.., key, _] = stack {
                    self.record(key);
                }
            }
            _ => {}
        }
    }

    fn record(&mut self, key: &Object) {
        if let Object::Unicode(key) = key {
            let next = self.rank.len();
            self.rank.entry(key.clone()).or_insert(next);
        }
    }

    fn rank(&self, name: &str) -> usize {
        self.rank.get(name).copied().unwrap_or(usize::MAX)
    }
}

/// A saved `__torch__` module pickles as BUILD over its reduce; the state
/// is the mapping.
fn unwrap_module(root: Object) -> Object {
    match root {
        Object::Build { callable, args } if is_torch_module(&callable) => *args,
        other => other,
    }
}

fn is_torch_module(obj: &Object) -> bool {
    let Object::Reduce { callable, .. } = obj else {
        return false;
    };
    matches!(
        callable.as_ref(),
        Object::Class { module_name, class_name }
            if module_name == "__torch__" && class_name == "Module"
    )
}

fn select_mapping(root: Object, state_dict_key: Option<&str>) -> Option<Vec<(Object, Object)>> {
    let Object::Dict(mut entries) = root else {
        return None;
    };
    if let Some(key) = state_dict_key {
        let nested = entries.iter().position(|(k, v)| {
            matches!(k, Object::Unicode(k) if k == key) && matches!(v, Object::Dict(_))
        });
        if let Some(pos) = nested {
            if let (_, Object::Dict(inner)) = entries.swap_remove(pos) {
                tracing::debug!("Using nested '{}' mapping", key);
                return Some(inner);
            }
        }
    }
    Some(entries)
}

#[derive(Debug)]
enum EntryError {
    UnsupportedStorage(String),
    Malformed(String),
}

fn malformed(reason: impl Into<String>) -> EntryError {
    EntryError::Malformed(reason.into())
}

/// `Ok(None)` for values that are not tensors at all.
fn decode_tensor(name: &str, value: Object) -> Result<Option<TensorRecord>, EntryError> {
    let Object::Reduce { callable, args } = value else {
        return Ok(None);
    };
    let Object::Class { module_name, class_name } = *callable else {
        return Ok(None);
    };

    match (module_name.as_str(), class_name.as_str()) {
        ("torch._utils", "_rebuild_tensor_v2") => rebuild_tensor(name, *args).map(Some),
        // (tensor, requires_grad, backward_hooks[, state])
        ("torch._utils", "_rebuild_parameter" | "_rebuild_parameter_with_state") => {
            let inner = tuple(*args)?
                .into_iter()
                .next()
                .ok_or_else(|| malformed("parameter without a tensor"))?;
            decode_wrapped(name, inner)
        }
        // (rebuild function, tensor type, rebuild args, state)
        ("torch._tensor", "_rebuild_from_type_v2") => {
            let mut parts = tuple(*args)?.into_iter();
            let (Some(func), Some(_), Some(func_args)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed("incomplete _rebuild_from_type_v2 arguments"));
            };
            let inner = Object::Reduce {
                callable: Box::new(func),
                args: Box::new(func_args),
            };
            decode_wrapped(name, inner)
        }
        (module, class) if module == "torch" || module.starts_with("torch.") => {
            Err(malformed(format!("unsupported tensor encoding {}.{}", module, class)))
        }
        _ => Ok(None),
    }
}

fn decode_wrapped(name: &str, inner: Object) -> Result<Option<TensorRecord>, EntryError> {
    match decode_tensor(name, inner)? {
        Some(record) => Ok(Some(record)),
        None => Err(malformed("wrapper does not hold a tensor")),
    }
}

// _rebuild_tensor_v2(storage, storage_offset, size, stride, requires_grad, backward_hooks)
fn rebuild_tensor(name: &str, args: Object) -> Result<TensorRecord, EntryError> {
    let mut args = tuple(args)?.into_iter();
    let (Some(storage), Some(offset), Some(shape), Some(stride)) =
        (args.next(), args.next(), args.next(), args.next())
    else {
        return Err(malformed("incomplete _rebuild_tensor_v2 arguments"));
    };

    let Object::PersistentLoad(pid) = storage else {
        return Err(malformed("storage is not a persistent reference"));
    };
    // ("storage", storage class, key, location, numel)
    let mut pid = tuple(*pid)?.into_iter();
    let (Some(_), Some(class), Some(key), Some(_), Some(numel)) =
        (pid.next(), pid.next(), pid.next(), pid.next(), pid.next())
    else {
        return Err(malformed("incomplete storage reference"));
    };
    let Object::Class { class_name, .. } = class else {
        return Err(malformed("storage reference without a storage class"));
    };
    let dtype = storage_dtype(&class_name).ok_or(EntryError::UnsupportedStorage(class_name))?;
    let Object::Unicode(storage_key) = key else {
        return Err(malformed("storage key is not a string"));
    };

    let shape = dims(shape, "size")?;
    let stride = dims(stride, "stride")?;
    if shape.len() != stride.len() {
        return Err(malformed(format!(
            "size has {} dims but stride has {}",
            shape.len(),
            stride.len()
        )));
    }

    Ok(TensorRecord {
        name: name.to_string(),
        dtype,
        storage_key,
        storage_numel: index(numel, "storage size")?,
        offset: index(offset, "storage offset")?,
        shape,
        stride,
    })
}

fn tuple(obj: Object) -> Result<Vec<Object>, EntryError> {
    match obj {
        Object::Tuple(items) => Ok(items),
        other => Err(malformed(format!("expected a tuple, got {:?}", other))),
    }
}

fn index(obj: Object, what: &str) -> Result<usize, EntryError> {
    match obj {
        Object::Int(v) => usize::try_from(v).map_err(|_| malformed(format!("negative {}: {}", what, v))),
        other => Err(malformed(format!("{} is not an integer: {:?}", what, other))),
    }
}

fn dims(obj: Object, what: &str) -> Result<Vec<usize>, EntryError> {
    tuple(obj)?.into_iter().map(|v| index(v, what)).collect()
}
