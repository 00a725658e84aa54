//! Per-node attribute map: ordered, typed, same value system as nodes.

use crate::cast;
use crate::errors::{KaraboError, Result};
use crate::value::{FromValue, Value};

/// Ordered attribute map of a [`Node`](super::Node).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(String, Value)>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced attribute keeps its position.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
        self
    }

    #[must_use]
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_value_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Typed read: exact type, or a lossless numeric promotion.
    pub fn get<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .get_value(name)
            .ok_or_else(|| KaraboError::NotFound(format!("attribute '{name}'")))?;
        extract(value, name)
    }

    /// Read through the full cast table.
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .get_value(name)
            .ok_or_else(|| KaraboError::NotFound(format!("attribute '{name}'")))?;
        extract_as(value, name)
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.get_value(name).is_some()
    }

    pub fn erase(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != name);
        before != self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overwrite each of `other`'s attributes onto this map.
    pub fn merge(&mut self, other: &Attributes) {
        for (name, value) in other.iter() {
            self.set(name, value.clone());
        }
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = (&'a str, &'a Value);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a Value)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

pub(crate) fn extract<T: FromValue>(value: &Value, what: &str) -> Result<T> {
    if let Some(v) = T::from_value(value) {
        return Ok(v);
    }
    let source = value.value_type();
    if cast::is_implicit(source, T::TYPE) {
        if let Some(v) = cast::convert(value, T::TYPE)
            .ok()
            .and_then(|c| T::from_value(&c))
        {
            return Ok(v);
        }
    }
    Err(KaraboError::TypeMismatch(format!(
        "'{what}' holds {source}, requested {}",
        T::TYPE
    )))
}

pub(crate) fn extract_as<T: FromValue>(value: &Value, what: &str) -> Result<T> {
    if let Some(v) = T::from_value(value) {
        return Ok(v);
    }
    let converted = cast::convert(value, T::TYPE)
        .map_err(|e| KaraboError::Cast(format!("'{what}': {}", e.detail())))?;
    T::from_value(&converted).ok_or_else(|| {
        KaraboError::Cast(format!("'{what}': cannot produce {}", T::TYPE))
    })
}
