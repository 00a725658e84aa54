//! A single Hash entry: key, typed value and attributes.

use crate::errors::Result;
use crate::types::ReferenceType;
use crate::value::{FromValue, Value};

use super::attributes::{extract, extract_as, Attributes};

/// One entry of a [`Hash`](super::Hash).
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    key: String,
    value: Value,
    attributes: Attributes,
}

impl Node {
    pub(crate) fn new(key: String, value: Value) -> Self {
        Self {
            key,
            value,
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Replace the value, keeping attributes.
    pub fn set_value(&mut self, value: impl Into<Value>) -> &mut Self {
        self.value = value.into();
        self
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    #[must_use]
    pub fn value_type(&self) -> ReferenceType {
        self.value.value_type()
    }

    pub fn get<T: FromValue>(&self) -> Result<T> {
        extract(&self.value, &self.key)
    }

    pub fn get_as<T: FromValue>(&self) -> Result<T> {
        extract_as(&self.value, &self.key)
    }

    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn set_attributes(&mut self, attributes: Attributes) -> &mut Self {
        self.attributes = attributes;
        self
    }

    /// Chainable attribute setter.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.attributes.set(name, value);
        self
    }

    pub fn get_attribute<T: FromValue>(&self, name: &str) -> Result<T> {
        self.attributes.get(name)
    }

    #[must_use]
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.has(name)
    }
}
