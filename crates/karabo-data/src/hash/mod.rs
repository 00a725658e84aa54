//! # Hash
//!
//! Ordered, path-addressable, typed, attributed tree container.
//!
//! ## Paths
//!
//! Nested entries are addressed as `a.b.c`; `a.b[3]` selects element 3 of a
//! vector of Hash stored at `a.b`. Writes create missing intermediate Hashes
//! and pad vectors of Hash with empty Hashes. Reads never create anything.
//!
//! ## Ordering
//!
//! Iteration yields entries in insertion order. Re-setting a key keeps its
//! position, replaces the value and clears the attributes.
//!
//! ## Equality
//!
//! `==` is full equality: same keys in the same order, equal values and equal
//! attribute maps at every level.

mod attributes;
mod json;
mod node;
mod ops;
pub mod path;

use std::collections::HashMap;
use std::fmt;

pub use attributes::Attributes;
pub use node::Node;
pub use ops::MergePolicy;

use crate::errors::{KaraboError, Result};
use crate::types::ReferenceType;
use crate::value::{FromValue, Value};

use attributes::{extract, extract_as};
use path::Segment;

/// Ordered tree of typed, attributed entries.
#[derive(Debug, Clone, Default)]
pub struct Hash {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

/// Resolution of a read path: either a node or an element of a vector of Hash.
enum Located<'a> {
    Node(&'a Node),
    Element(&'a Hash),
}

impl Hash {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style `set`.
    #[must_use]
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set(path, value);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
    }

    /// Top-level keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes.iter().map(Node::key)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Node> {
        self.nodes.iter_mut()
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Set `value` at `path`, creating intermediate nodes as needed.
    ///
    /// An indexed final segment (`v[2]`) addresses an element of the vector
    /// of Hash at `v`, padding it with empty Hashes. Only a Hash value can
    /// fill such an element; any other value leaves the padded vector as is.
    /// The returned node is the one holding the vector.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> &mut Node {
        let value = value.into();
        let (parents, last) = path::split_for_write(path);
        let mut current = self;
        for segment in parents {
            current = current.child_for_write(segment);
        }
        if last.index.is_none() {
            return current.set_key(last.key, value);
        }
        let element = current.child_for_write(last);
        if let Value::Hash(hash) = value {
            *element = hash;
        }
        let pos = current.index[last.key];
        &mut current.nodes[pos]
    }

    /// Set a top-level entry under `key` without path parsing.
    pub fn set_key(&mut self, key: &str, value: impl Into<Value>) -> &mut Node {
        let value = value.into();
        let pos = match self.index.get(key) {
            Some(&pos) => {
                let node = &mut self.nodes[pos];
                node.set_value(value);
                node.attributes_mut().clear();
                pos
            }
            None => {
                self.nodes.push(Node::new(key.to_string(), value));
                let pos = self.nodes.len() - 1;
                self.index.insert(key.to_string(), pos);
                pos
            }
        };
        &mut self.nodes[pos]
    }

    fn child_for_write(&mut self, segment: Segment<'_>) -> &mut Hash {
        let pos = match self.index.get(segment.key) {
            Some(&pos) => pos,
            None => {
                let fresh = match segment.index {
                    Some(_) => Value::VectorHash(Vec::new()),
                    None => Value::Hash(Hash::new()),
                };
                self.set_key(segment.key, fresh);
                self.nodes.len() - 1
            }
        };
        let value = self.nodes[pos].value_mut();
        match segment.index {
            None => value.make_hash(),
            Some(i) => {
                let items = value.make_vector_hash();
                if items.len() <= i {
                    items.resize_with(i + 1, Hash::new);
                }
                &mut items[i]
            }
        }
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Top-level entry under `key`, without path parsing.
    #[must_use]
    pub fn find(&self, key: &str) -> Option<&Node> {
        self.index.get(key).map(|&pos| &self.nodes[pos])
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut Node> {
        match self.index.get(key) {
            Some(&pos) => Some(&mut self.nodes[pos]),
            None => None,
        }
    }

    fn child(&self, segment: Segment<'_>) -> Option<&Hash> {
        let value = self.find(segment.key)?.value();
        match segment.index {
            None => value.as_hash(),
            Some(i) => value.as_vector_hash()?.get(i),
        }
    }

    fn child_mut(&mut self, segment: Segment<'_>) -> Option<&mut Hash> {
        let value = self.find_mut(segment.key)?.value_mut();
        match segment.index {
            None => value.as_hash_mut(),
            Some(i) => value.as_vector_hash_mut()?.get_mut(i),
        }
    }

    /// Parent Hash of the last segment, plus that segment.
    fn parent_of<'p>(&self, path: &'p str) -> Option<(&Hash, Segment<'p>)> {
        let segments = path::parse(path)?;
        let (last, parents) = segments.split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.child(*segment)?;
        }
        Some((current, *last))
    }

    fn parent_of_mut<'p>(&mut self, path: &'p str) -> Option<(&mut Hash, Segment<'p>)> {
        let segments = path::parse(path)?;
        let (last, parents) = segments.split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.child_mut(*segment)?;
        }
        Some((current, *last))
    }

    fn locate(&self, path: &str) -> Option<Located<'_>> {
        let (parent, last) = self.parent_of(path)?;
        let node = parent.find(last.key)?;
        match last.index {
            None => Some(Located::Node(node)),
            Some(i) => node.value().as_vector_hash()?.get(i).map(Located::Element),
        }
    }

    fn not_found(path: &str) -> KaraboError {
        KaraboError::NotFound(format!("key '{path}' does not exist"))
    }

    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        self.locate(path).is_some()
    }

    /// Typed read; succeeds on exact type or lossless numeric promotion.
    pub fn get<T: FromValue>(&self, path: &str) -> Result<T> {
        match self.locate(path).ok_or_else(|| Self::not_found(path))? {
            Located::Node(node) => extract(node.value(), path),
            Located::Element(h) => extract(&Value::Hash(h.clone()), path),
        }
    }

    /// Read through the full cast table.
    pub fn get_as<T: FromValue>(&self, path: &str) -> Result<T> {
        match self.locate(path).ok_or_else(|| Self::not_found(path))? {
            Located::Node(node) => extract_as(node.value(), path),
            Located::Element(h) => extract_as(&Value::Hash(h.clone()), path),
        }
    }

    pub fn get_node(&self, path: &str) -> Result<&Node> {
        match self.locate(path) {
            Some(Located::Node(node)) => Ok(node),
            _ => Err(Self::not_found(path)),
        }
    }

    pub fn get_node_mut(&mut self, path: &str) -> Result<&mut Node> {
        let (parent, last) = self
            .parent_of_mut(path)
            .ok_or_else(|| Self::not_found(path))?;
        if last.index.is_some() {
            return Err(Self::not_found(path));
        }
        parent.find_mut(last.key).ok_or_else(|| Self::not_found(path))
    }

    pub fn get_value(&self, path: &str) -> Result<&Value> {
        self.get_node(path).map(Node::value)
    }

    pub fn get_value_mut(&mut self, path: &str) -> Result<&mut Value> {
        self.get_node_mut(path).map(Node::value_mut)
    }

    pub fn get_type(&self, path: &str) -> Result<ReferenceType> {
        match self.locate(path).ok_or_else(|| Self::not_found(path))? {
            Located::Node(node) => Ok(node.value_type()),
            Located::Element(_) => Ok(ReferenceType::Hash),
        }
    }

    /// Borrow the Hash at `path` (a Hash node or a vector element).
    pub fn get_hash(&self, path: &str) -> Result<&Hash> {
        match self.locate(path).ok_or_else(|| Self::not_found(path))? {
            Located::Node(node) => node.value().as_hash().ok_or_else(|| {
                KaraboError::TypeMismatch(format!(
                    "'{path}' holds {}, requested HASH",
                    node.value_type()
                ))
            }),
            Located::Element(h) => Ok(h),
        }
    }

    pub fn get_hash_mut(&mut self, path: &str) -> Result<&mut Hash> {
        let (parent, last) = self
            .parent_of_mut(path)
            .ok_or_else(|| Self::not_found(path))?;
        parent.child_mut(last).ok_or_else(|| Self::not_found(path))
    }

    pub fn get_vector_hash(&self, path: &str) -> Result<&Vec<Hash>> {
        let node = self.get_node(path)?;
        node.value().as_vector_hash().ok_or_else(|| {
            KaraboError::TypeMismatch(format!(
                "'{path}' holds {}, requested VECTOR_HASH",
                node.value_type()
            ))
        })
    }

    pub fn get_vector_hash_mut(&mut self, path: &str) -> Result<&mut Vec<Hash>> {
        let node = self.get_node_mut(path)?;
        let found = node.value_type();
        node.value_mut().as_vector_hash_mut().ok_or_else(|| {
            KaraboError::TypeMismatch(format!("'{path}' holds {found}, requested VECTOR_HASH"))
        })
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove the entry (or vector element) at `path`. Returns whether
    /// something was removed.
    pub fn erase(&mut self, path: &str) -> bool {
        let Some((parent, last)) = self.parent_of_mut(path) else {
            return false;
        };
        match last.index {
            None => parent.erase_key(last.key),
            Some(i) => match parent
                .find_mut(last.key)
                .and_then(|n| n.value_mut().as_vector_hash_mut())
            {
                Some(items) if i < items.len() => {
                    items.remove(i);
                    true
                }
                _ => false,
            },
        }
    }

    /// Like [`erase`](Self::erase), then removes parents left empty.
    pub fn erase_path(&mut self, path: &str) -> bool {
        if !self.erase(path) {
            return false;
        }
        let mut parent = path;
        while let Some((prefix, _)) = parent.rsplit_once(path::SEPARATOR) {
            let empty = self.get_hash(prefix).map(Hash::is_empty).unwrap_or(false);
            if !empty || prefix.ends_with(']') {
                break;
            }
            self.erase(prefix);
            parent = prefix;
        }
        true
    }

    fn erase_key(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some(pos) => {
                self.nodes.remove(pos);
                for (i, node) in self.nodes.iter().enumerate().skip(pos) {
                    self.index.insert(node.key().to_string(), i);
                }
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn set_attribute(&mut self, path: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.get_node_mut(path)?.set_attribute(name, value);
        Ok(())
    }

    pub fn get_attribute<T: FromValue>(&self, path: &str, name: &str) -> Result<T> {
        self.get_node(path)?.attributes().get(name)
    }

    pub fn get_attribute_as<T: FromValue>(&self, path: &str, name: &str) -> Result<T> {
        self.get_node(path)?.attributes().get_as(name)
    }

    #[must_use]
    pub fn has_attribute(&self, path: &str, name: &str) -> bool {
        self.get_node(path)
            .map(|n| n.has_attribute(name))
            .unwrap_or(false)
    }

    pub fn get_attributes(&self, path: &str) -> Result<&Attributes> {
        self.get_node(path).map(Node::attributes)
    }

    pub fn get_attributes_mut(&mut self, path: &str) -> Result<&mut Attributes> {
        self.get_node_mut(path).map(Node::attributes_mut)
    }

    /// Owned copy of the attributes at `path`.
    pub fn copy_attributes(&self, path: &str) -> Result<Attributes> {
        self.get_attributes(path).cloned()
    }

    /// Replace all attributes at `path`.
    pub fn set_attributes(&mut self, path: &str, attributes: Attributes) -> Result<()> {
        self.get_node_mut(path)?.set_attributes(attributes);
        Ok(())
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl<'a> IntoIterator for &'a Hash {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl IntoIterator for Hash {
    type Item = Node;
    type IntoIter = std::vec::IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl Hash {
    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        for node in &self.nodes {
            write!(f, "{pad}'{}'", node.key())?;
            for (name, value) in node.attributes() {
                write!(f, " {name}=\"{}\"", short_text(value))?;
            }
            match node.value() {
                Value::Hash(h) => {
                    writeln!(f, " +")?;
                    h.render(f, depth + 1)?;
                }
                Value::VectorHash(items) => {
                    writeln!(f, " @")?;
                    for (i, item) in items.iter().enumerate() {
                        writeln!(f, "{pad}  [{i}]")?;
                        item.render(f, depth + 2)?;
                    }
                }
                Value::Schema(s) => {
                    writeln!(f, " => {} SCHEMA", s.root_name())?;
                    s.parameters().render(f, depth + 1)?;
                }
                other => writeln!(f, " => {} {}", short_text(other), other.value_type())?,
            }
        }
        Ok(())
    }
}

fn short_text(value: &Value) -> String {
    crate::cast::to_text(value).unwrap_or_else(|_| value.value_type().to_string())
}
