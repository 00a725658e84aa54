//! Fluent builder for leaf parameters.

use std::marker::PhantomData;

use crate::cast;
use crate::errors::{KaraboError, Result};
use crate::hash::{Attributes, Hash};
use crate::state::State;
use crate::value::{FromValue, Value};

use super::{attr, AccessLevel, AccessMode, ArchivePolicy, Assignment, LeafType, NodeType, Schema};

/// Builder of a typed leaf parameter.
///
/// Defaults: reconfigurable, optional, property leaf.
#[must_use = "an element is only added to the schema by commit()"]
pub struct LeafElement<'a, T> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
    _type: PhantomData<T>,
}

impl<'a, T> LeafElement<'a, T>
where
    T: FromValue + Into<Value> + Clone,
{
    pub fn new(schema: &'a mut Schema) -> Self {
        let mut attributes = Attributes::new();
        attributes
            .set(attr::NODE_TYPE, NodeType::Leaf.as_i32())
            .set(attr::VALUE_TYPE, T::TYPE.name())
            .set(attr::LEAF_TYPE, LeafType::Property.as_i32())
            .set(attr::ACCESS_MODE, AccessMode::Write.as_i32())
            .set(attr::ASSIGNMENT, Assignment::Optional.as_i32())
            .set(attr::REQUIRED_ACCESS_LEVEL, AccessLevel::Observer.as_i32());
        Self {
            schema,
            key: String::new(),
            attributes,
            _type: PhantomData,
        }
    }

    fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.set(name, value);
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(self, name: &str) -> Self {
        self.with(attr::DISPLAYED_NAME, name)
    }

    pub fn description(self, text: &str) -> Self {
        self.with(attr::DESCRIPTION, text)
    }

    pub fn unit(self, symbol: &str) -> Self {
        self.with(attr::UNIT_SYMBOL, symbol)
    }

    pub fn metric_prefix(self, symbol: &str) -> Self {
        self.with(attr::METRIC_PREFIX_SYMBOL, symbol)
    }

    /// Comma-separated tags.
    pub fn tags(self, tags: &str) -> Self {
        let list: Vec<String> = tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        self.with(attr::TAGS, list)
    }

    pub fn alias(self, alias: impl Into<Value>) -> Self {
        self.with(attr::ALIAS, alias)
    }

    pub fn display_type(self, display_type: &str) -> Self {
        self.with(attr::DISPLAY_TYPE, display_type)
    }

    pub fn assignment_optional(self) -> Self {
        self.with(attr::ASSIGNMENT, Assignment::Optional.as_i32())
    }

    pub fn assignment_mandatory(self) -> Self {
        self.with(attr::ASSIGNMENT, Assignment::Mandatory.as_i32())
    }

    pub fn assignment_internal(self) -> Self {
        self.with(attr::ASSIGNMENT, Assignment::Internal.as_i32())
    }

    pub fn default_value(self, value: T) -> Self {
        self.with(attr::DEFAULT_VALUE, value)
    }

    /// Default value of a read-only leaf.
    pub fn initial_value(self, value: T) -> Self {
        self.default_value(value)
    }

    pub fn init(self) -> Self {
        self.with(attr::ACCESS_MODE, AccessMode::Init.as_i32())
    }

    pub fn reconfigurable(self) -> Self {
        self.with(attr::ACCESS_MODE, AccessMode::Write.as_i32())
    }

    pub fn read_only(self) -> Self {
        self.with(attr::ACCESS_MODE, AccessMode::Read.as_i32())
    }

    pub fn allowed_states(self, states: &[State]) -> Self {
        self.with(attr::ALLOWED_STATES, State::names(states))
    }

    pub fn options(self, options: Vec<T>) -> Self
    where
        Vec<T>: Into<Value>,
    {
        self.with(attr::OPTIONS, options)
    }

    /// Options as comma-separated text, cast to the leaf's type on commit.
    pub fn options_text(self, options: &str) -> Self {
        self.with(attr::OPTIONS, options)
    }

    pub fn min_inc(self, value: T) -> Self {
        self.with(attr::MIN_INC, value)
    }

    pub fn max_inc(self, value: T) -> Self {
        self.with(attr::MAX_INC, value)
    }

    pub fn min_exc(self, value: T) -> Self {
        self.with(attr::MIN_EXC, value)
    }

    pub fn max_exc(self, value: T) -> Self {
        self.with(attr::MAX_EXC, value)
    }

    pub fn min_size(self, size: u32) -> Self {
        self.with(attr::MIN_SIZE, size)
    }

    pub fn max_size(self, size: u32) -> Self {
        self.with(attr::MAX_SIZE, size)
    }

    pub fn required_access_level(self, level: AccessLevel) -> Self {
        self.with(attr::REQUIRED_ACCESS_LEVEL, level.as_i32())
    }

    pub fn user_access(self) -> Self {
        self.required_access_level(AccessLevel::User)
    }

    pub fn operator_access(self) -> Self {
        self.required_access_level(AccessLevel::Operator)
    }

    pub fn expert_access(self) -> Self {
        self.required_access_level(AccessLevel::Expert)
    }

    pub fn admin_access(self) -> Self {
        self.required_access_level(AccessLevel::Admin)
    }

    pub fn archive_policy(self, policy: ArchivePolicy) -> Self {
        self.with(attr::ARCHIVE_POLICY, policy.as_i32())
    }

    /// Declare the leaf in the schema.
    pub fn commit(mut self) -> Result<()> {
        if let Some(options) = self.attributes.get_value(attr::OPTIONS) {
            let target = if T::TYPE.is_vector() {
                T::TYPE
            } else {
                T::TYPE.vector_type().unwrap_or(T::TYPE)
            };
            let typed = cast::convert(options, target).map_err(|_| {
                KaraboError::Parse(format!(
                    "options of '{}' are not castable to {}",
                    self.key,
                    T::TYPE
                ))
            })?;
            self.attributes.set(attr::OPTIONS, typed);
        }
        self.schema.add_element(&self.key, self.attributes)
    }
}

impl<'a> LeafElement<'a, Vec<Hash>> {
    /// Column description of a table.
    pub fn row_schema(self, rows: &Schema) -> Self {
        self.with(attr::ROW_SCHEMA, rows.clone())
            .with(attr::DISPLAY_TYPE, "Table")
    }
}

pub type BoolElement<'a> = LeafElement<'a, bool>;
pub type Int8Element<'a> = LeafElement<'a, i8>;
pub type UInt8Element<'a> = LeafElement<'a, u8>;
pub type Int16Element<'a> = LeafElement<'a, i16>;
pub type UInt16Element<'a> = LeafElement<'a, u16>;
pub type Int32Element<'a> = LeafElement<'a, i32>;
pub type UInt32Element<'a> = LeafElement<'a, u32>;
pub type Int64Element<'a> = LeafElement<'a, i64>;
pub type UInt64Element<'a> = LeafElement<'a, u64>;
pub type FloatElement<'a> = LeafElement<'a, f32>;
pub type DoubleElement<'a> = LeafElement<'a, f64>;
pub type StringElement<'a> = LeafElement<'a, String>;
pub type ByteArrayElement<'a> = LeafElement<'a, bytes::Bytes>;
pub type VectorBoolElement<'a> = LeafElement<'a, Vec<bool>>;
pub type VectorInt32Element<'a> = LeafElement<'a, Vec<i32>>;
pub type VectorUInt32Element<'a> = LeafElement<'a, Vec<u32>>;
pub type VectorInt64Element<'a> = LeafElement<'a, Vec<i64>>;
pub type VectorUInt64Element<'a> = LeafElement<'a, Vec<u64>>;
pub type VectorFloatElement<'a> = LeafElement<'a, Vec<f32>>;
pub type VectorDoubleElement<'a> = LeafElement<'a, Vec<f64>>;
pub type VectorStringElement<'a> = LeafElement<'a, Vec<String>>;
pub type TableElement<'a> = LeafElement<'a, Vec<Hash>>;
