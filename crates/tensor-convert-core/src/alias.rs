//! Detection and resolution of tensors that share backing storage.
//!
//! Tied weights (an embedding matrix reused as the output projection, say)
//! are stored once in a legacy bundle but appear under several names. The
//! safetensors format has no notion of shared storage, so only one name per
//! storage identity may be written. The first name in load order wins.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::Serialize;

use crate::tensor::{StorageId, TensorBundle};

/// Names sharing one storage identity, in load order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasGroup {
    storage: StorageId,
    names: Vec<String>,
}

impl AliasGroup {
    pub fn storage(&self) -> &StorageId {
        &self.storage
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The name that survives resolution.
    pub fn canonical(&self) -> &str {
        &self.names[0]
    }

    /// Names dropped in favour of [`canonical`](Self::canonical).
    pub fn duplicates(&self) -> &[String] {
        &self.names[1..]
    }
}

/// Group tensor names by storage identity.
///
/// Only groups with more than one name are returned. Groups appear in order
/// of the first occurrence of their storage identity, and names within a
/// group keep bundle order, so the result is stable for a stable bundle.
#[must_use]
pub fn find_alias_groups(bundle: &TensorBundle) -> Vec<AliasGroup> {
    let mut order: Vec<StorageId> = Vec::new();
    let mut by_storage: HashMap<StorageId, Vec<String>> = HashMap::new();

    for handle in bundle {
        match by_storage.entry(handle.storage_id()) {
            Entry::Occupied(mut entry) => entry.get_mut().push(handle.name().to_string()),
            Entry::Vacant(entry) => {
                order.push(entry.key().clone());
                entry.insert(vec![handle.name().to_string()]);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|storage| {
            let names = by_storage.remove(&storage)?;
            (names.len() > 1).then_some(AliasGroup { storage, names })
        })
        .collect()
}

/// Drop every non-canonical name of each group from `bundle`.
///
/// Returns the dropped names in group order.
pub fn resolve_aliases(bundle: &mut TensorBundle, groups: &[AliasGroup]) -> Vec<String> {
    let mut dropped = Vec::new();
    for group in groups {
        for name in group.duplicates() {
            if bundle.remove(name).is_some() {
                tracing::debug!(
                    "Dropping '{}': shares storage {} with '{}'",
                    name,
                    group.storage(),
                    group.canonical()
                );
                dropped.push(name.clone());
            }
        }
    }
    dropped
}
