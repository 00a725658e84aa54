//! Whole-tree operations: merge, subtract, paths, flatten/unflatten.

use crate::value::Value;

use super::path;
use super::Hash;

/// How attributes of entries present on both sides are combined by
/// [`Hash::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Existing attributes are kept; incoming ones overwrite by name.
    #[default]
    MergeAttributes,
    /// Incoming attributes replace the existing set.
    ReplaceAttributes,
}

impl Hash {
    /// Merge `other` into `self`.
    ///
    /// Nested Hashes merge recursively; all other values (vectors included)
    /// are replaced. New keys are appended in `other`'s order.
    pub fn merge(&mut self, other: &Hash, policy: MergePolicy) {
        for incoming in other {
            let key = incoming.key();
            let Some(existing) = self.find_mut(key) else {
                let node = self.set_key(key, incoming.value().clone());
                node.set_attributes(incoming.attributes().clone());
                continue;
            };
            match policy {
                MergePolicy::MergeAttributes => existing.attributes_mut().merge(incoming.attributes()),
                MergePolicy::ReplaceAttributes => {
                    existing.set_attributes(incoming.attributes().clone());
                }
            }
            match (existing.value_mut(), incoming.value()) {
                (Value::Hash(mine), Value::Hash(theirs)) => mine.merge(theirs, policy),
                (mine, theirs) => *mine = theirs.clone(),
            }
        }
    }

    /// Remove from `self` every path present in `other`.
    ///
    /// A non-empty Hash in `other` recurses; anything else erases the key.
    pub fn subtract(&mut self, other: &Hash) {
        for node in other {
            let key = node.key();
            let recurse = match (self.find(key).map(|n| n.value()), node.value()) {
                (Some(Value::Hash(_)), Value::Hash(theirs)) => !theirs.is_empty(),
                (Some(_), _) => false,
                (None, _) => continue,
            };
            if recurse {
                if let (Some(mine), Value::Hash(theirs)) = (
                    self.find_mut(key).and_then(|n| n.value_mut().as_hash_mut()),
                    node.value(),
                ) {
                    mine.subtract(theirs);
                }
            } else {
                self.erase_key(key);
            }
        }
    }

    /// Full paths of all leaves in order.
    ///
    /// Empty Hashes and vectors of Hash count as leaves.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for node in self {
            let full = path::join(prefix, node.key());
            match node.value() {
                Value::Hash(h) if !h.is_empty() => h.collect_paths(&full, out),
                _ => out.push(full),
            }
        }
    }

    /// One-level Hash whose keys are the leaf paths of `self`.
    #[must_use]
    pub fn flatten(&self) -> Hash {
        let mut flat = Hash::new();
        self.flatten_into("", &mut flat);
        flat
    }

    fn flatten_into(&self, prefix: &str, flat: &mut Hash) {
        for node in self {
            let full = path::join(prefix, node.key());
            match node.value() {
                Value::Hash(h) if !h.is_empty() => h.flatten_into(&full, flat),
                value => {
                    flat.set_key(&full, value.clone())
                        .set_attributes(node.attributes().clone());
                }
            }
        }
    }

    /// Inverse of [`flatten`](Self::flatten).
    #[must_use]
    pub fn unflatten(&self) -> Hash {
        let mut tree = Hash::new();
        for node in self {
            tree.set(node.key(), node.value().clone())
                .set_attributes(node.attributes().clone());
        }
        tree
    }
}
