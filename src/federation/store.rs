//! Content-addressable local tuple store.
//!
//! Keys are the SHA-1 hash of the serialized tuple, so two equal-value
//! tuples collapse to one entry and a later `put` only overwrites the
//! owner metadata. Blocking read/take loops live at the federation layer;
//! the store itself is non-blocking.

use dashmap::DashMap;

use crate::domain::NodeId;
use crate::federation::tuple::{Tuple, TupleError, TupleKey, TupleTemplate};

#[derive(Debug, Clone)]
struct StoredTuple {
    tuple: Tuple,
    blob: Vec<u8>,
    owner: NodeId,
}

/// Keyed store of tuples with owner metadata.
#[derive(Debug, Default)]
pub struct TupleStore {
    entries: DashMap<TupleKey, StoredTuple>,
}

impl TupleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a tuple under its content hash. If an equal-value tuple is
    /// already present the owner metadata is overwritten.
    pub fn put(&self, tuple: &Tuple, owner: NodeId) {
        let blob = tuple.serialize();
        self.entries.insert(
            tuple.key(),
            StoredTuple {
                tuple: tuple.clone(),
                blob,
                owner,
            },
        );
    }

    /// Stores a replicated serialized tuple under the owner id reported by
    /// the peer it came from.
    pub fn put_serialized(&self, blob: &[u8], owner: NodeId) -> Result<(), TupleError> {
        let tuple = Tuple::deserialize(blob)?;
        self.entries.insert(
            tuple.key(),
            StoredTuple {
                tuple,
                blob: blob.to_vec(),
                owner,
            },
        );
        Ok(())
    }

    /// Non-destructive lookup. A fully bound template resolves through its
    /// hash; otherwise the store is scanned for the first match. The result
    /// echoes the template's bound field values plus the stored owner id.
    #[must_use]
    pub fn find_tuple(&self, template: &TupleTemplate) -> Option<(Tuple, NodeId)> {
        if let Some(tuple) = template.to_tuple() {
            let entry = self.entries.get(&tuple.key())?;
            return Some((template.echo(&entry.tuple), entry.owner));
        }
        self.entries.iter().find_map(|entry| {
            template
                .matches(&entry.tuple)
                .then(|| (template.echo(&entry.tuple), entry.owner))
        })
    }

    /// Non-destructive lookup of every matching tuple.
    #[must_use]
    pub fn find_all(&self, template: &TupleTemplate) -> Vec<(Tuple, NodeId)> {
        self.entries
            .iter()
            .filter(|entry| template.matches(&entry.tuple))
            .map(|entry| (entry.tuple.clone(), entry.owner))
            .collect()
    }

    /// Destructive take: removes and returns the first matching tuple.
    #[must_use]
    pub fn take(&self, template: &TupleTemplate) -> Option<(Tuple, NodeId)> {
        let key = if let Some(tuple) = template.to_tuple() {
            self.entries.contains_key(&tuple.key()).then(|| tuple.key())?
        } else {
            self.entries
                .iter()
                .find(|entry| template.matches(&entry.tuple))
                .map(|entry| *entry.key())?
        };
        self.entries
            .remove(&key)
            .map(|(_, stored)| (stored.tuple, stored.owner))
    }

    /// Enumerates `(owner, blob)` for tuples owned by the given node. This
    /// is what peers replicate at join time.
    #[must_use]
    pub fn owned_tuples(&self, owner: NodeId) -> Vec<(NodeId, Vec<u8>)> {
        self.entries
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| (entry.owner, entry.blob.clone()))
            .collect()
    }

    /// Enumerates `(owner, blob)` for every stored tuple.
    #[must_use]
    pub fn all_tuples(&self) -> Vec<(NodeId, Vec<u8>)> {
        self.entries
            .iter()
            .map(|entry| (entry.owner, entry.blob.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
