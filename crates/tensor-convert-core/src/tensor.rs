//! In-memory tensor handles produced by bundle sources.
//!
//! A [`TensorHandle`] is a strided view over a shared [`Storage`] buffer, the
//! same shape a legacy checkpoint has once unpickled: several names may point
//! into one buffer. [`TensorBundle`] keeps the handles in load order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DType {
    /// Boolean stored as one byte.
    Bool,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 32-bit integer.
    U32,
    /// IEEE-754 half precision.
    F16,
    /// bfloat16.
    BF16,
    /// IEEE-754 single precision.
    F32,
    /// IEEE-754 double precision.
    F64,
}

impl DType {
    /// Returns the number of bytes per element.
    #[must_use]
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Get the safetensors header name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::U8 => "U8",
            Self::I8 => "I8",
            Self::I16 => "I16",
            Self::I32 => "I32",
            Self::I64 => "I64",
            Self::U32 => "U32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::F32 => "F32",
            Self::F64 => "F64",
        }
    }

    /// Map to the safetensors element type.
    #[must_use]
    pub fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::Bool => safetensors::Dtype::BOOL,
            Self::U8 => safetensors::Dtype::U8,
            Self::I8 => safetensors::Dtype::I8,
            Self::I16 => safetensors::Dtype::I16,
            Self::I32 => safetensors::Dtype::I32,
            Self::I64 => safetensors::Dtype::I64,
            Self::U32 => safetensors::Dtype::U32,
            Self::F16 => safetensors::Dtype::F16,
            Self::BF16 => safetensors::Dtype::BF16,
            Self::F32 => safetensors::Dtype::F32,
            Self::F64 => safetensors::Dtype::F64,
        }
    }

    /// Map from a safetensors element type, if representable.
    #[must_use]
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        match dtype {
            safetensors::Dtype::BOOL => Some(Self::Bool),
            safetensors::Dtype::U8 => Some(Self::U8),
            safetensors::Dtype::I8 => Some(Self::I8),
            safetensors::Dtype::I16 => Some(Self::I16),
            safetensors::Dtype::I32 => Some(Self::I32),
            safetensors::Dtype::I64 => Some(Self::I64),
            safetensors::Dtype::U32 => Some(Self::U32),
            safetensors::Dtype::F16 => Some(Self::F16),
            safetensors::Dtype::BF16 => Some(Self::BF16),
            safetensors::Dtype::F32 => Some(Self::F32),
            safetensors::Dtype::F64 => Some(Self::F64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, immutable backing buffer.
///
/// Clones share one allocation, so two handles built from clones of the same
/// `Storage` alias each other exactly the way views of one torch storage do.
#[derive(Clone)]
pub struct Storage {
    key: String,
    bytes: Arc<[u8]>,
}

impl Storage {
    /// Wrap `bytes` as the buffer named `key` within its bundle.
    pub fn new(key: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            key: key.into(),
            bytes: bytes.into(),
        }
    }

    /// Name of the buffer within its bundle (e.g. `archive/data/3`).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("key", &self.key)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Identity of the memory a tensor's data starts at.
///
/// Two handles with equal `StorageId` read their first element from the same
/// byte of the same buffer; writing through one would be visible through the
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StorageId {
    buffer: String,
    byte_offset: usize,
}

impl StorageId {
    pub fn new(buffer: impl Into<String>, byte_offset: usize) -> Self {
        Self {
            buffer: buffer.into(),
            byte_offset,
        }
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.buffer, self.byte_offset)
    }
}

/// Row-major strides (in elements) for `shape`.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut acc = 1usize;
    for (stride, &dim) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc = acc.saturating_mul(dim);
    }
    strides
}

/// Named strided view over a [`Storage`].
#[derive(Debug, Clone)]
pub struct TensorHandle {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    storage: Storage,
}

impl TensorHandle {
    /// Build a view with explicit strides and element offset.
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<usize>,
        strides: Vec<usize>,
        offset: usize,
        storage: Storage,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            strides,
            offset,
            storage,
        }
    }

    /// Build a row-major view starting at the beginning of `storage`.
    pub fn contiguous(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<usize>,
        storage: Storage,
    ) -> Self {
        let strides = contiguous_strides(&shape);
        Self::new(name, dtype, shape, strides, 0, storage)
    }

    /// Another view over the same storage.
    #[must_use]
    pub fn view(
        &self,
        name: impl Into<String>,
        shape: Vec<usize>,
        strides: Vec<usize>,
        offset: usize,
    ) -> Self {
        Self::new(name, self.dtype, shape, strides, offset, self.storage.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Offset of the first element, in elements.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Number of elements described by the shape (1 for scalars).
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Identity of the byte this view starts at.
    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        StorageId::new(
            self.storage.key(),
            self.offset.saturating_mul(self.dtype.size_in_bytes()),
        )
    }

    /// Whether elements are laid out row-major without gaps.
    ///
    /// Axes of extent 1 may carry any stride, and empty tensors are always
    /// contiguous.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }
        if self.num_elements() == 0 {
            return true;
        }
        let mut expected = 1usize;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected = expected.saturating_mul(dim);
        }
        true
    }
}

/// Ordered mapping from tensor name to handle, in load order.
///
/// Removal leaves an empty slot behind so every other handle keeps its slot;
/// lookups go through a name index.
#[derive(Debug, Clone, Default)]
pub struct TensorBundle {
    slots: Vec<Option<TensorHandle>>,
    index: HashMap<String, usize>,
}

impl TensorBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle. A handle with an existing name replaces the old one in
    /// place, keeping its position.
    pub fn insert(&mut self, handle: TensorHandle) {
        match self.index.get(&handle.name) {
            Some(&slot) => self.slots[slot] = Some(handle),
            None => {
                self.index.insert(handle.name.clone(), self.slots.len());
                self.slots.push(Some(handle));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TensorHandle> {
        let &slot = self.index.get(name)?;
        self.slots.get(slot)?.as_ref()
    }

    /// Remove and return the handle called `name`.
    pub fn remove(&mut self, name: &str) -> Option<TensorHandle> {
        let slot = self.index.remove(name)?;
        self.slots.get_mut(slot)?.take()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> Iter<'_> {
        self.slots.iter().flatten()
    }

    /// Names in load order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Handles of a [`TensorBundle`] in load order.
pub type Iter<'a> = std::iter::Flatten<std::slice::Iter<'a, Option<TensorHandle>>>;

impl FromIterator<TensorHandle> for TensorBundle {
    fn from_iter<I: IntoIterator<Item = TensorHandle>>(iter: I) -> Self {
        let mut bundle = Self::new();
        for handle in iter {
            bundle.insert(handle);
        }
        bundle
    }
}

impl<'a> IntoIterator for &'a TensorBundle {
    type Item = &'a TensorHandle;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
