//! # Schema
//!
//! A Schema is a parameter tree describing a configurable class. It is
//! stored as a [`Hash`]: leaves hold `NONE` values, nodes (plain, choice and
//! list) hold Hashes of their children, and every entry carries its
//! description as attributes (`nodeType`, `valueType`, `accessMode`,
//! `assignment`, `defaultValue`, ranges, `options`, `allowedStates`, ...).
//!
//! ## Construction
//!
//! Schemas are built with the fluent element builders in [`elements`]
//! (`Int32Element::new(&mut schema).key("k")...commit()`). A commit checks
//! the description for consistency and is filtered by the schema's
//! [`AssemblyRules`].
//!
//! ## Combining
//!
//! - [`Schema::merge`] overrides attributes of existing entries (used by
//!   device schema injection)
//! - [`Schema::append_schema`] refuses to redeclare a leaf

mod builder;
pub mod elements;

use crate::errors::{KaraboError, Result};
use crate::hash::{Attributes, Hash, MergePolicy, Node};
use crate::state::State;
use crate::types::ReferenceType;
use crate::value::Value;
use crate::{cast, hash::path};

/// Attribute names of a parameter description.
pub mod attr {
    pub const NODE_TYPE: &str = "nodeType";
    pub const VALUE_TYPE: &str = "valueType";
    pub const ACCESS_MODE: &str = "accessMode";
    pub const ASSIGNMENT: &str = "assignment";
    pub const LEAF_TYPE: &str = "leafType";
    pub const DEFAULT_VALUE: &str = "defaultValue";
    pub const DISPLAYED_NAME: &str = "displayedName";
    pub const DESCRIPTION: &str = "description";
    pub const UNIT_SYMBOL: &str = "unitSymbol";
    pub const METRIC_PREFIX_SYMBOL: &str = "metricPrefixSymbol";
    pub const MIN_INC: &str = "minInc";
    pub const MAX_INC: &str = "maxInc";
    pub const MIN_EXC: &str = "minExc";
    pub const MAX_EXC: &str = "maxExc";
    pub const MIN_SIZE: &str = "minSize";
    pub const MAX_SIZE: &str = "maxSize";
    pub const MIN: &str = "min";
    pub const MAX: &str = "max";
    pub const OPTIONS: &str = "options";
    pub const ALLOWED_STATES: &str = "allowedStates";
    pub const TAGS: &str = "tags";
    pub const ALIAS: &str = "alias";
    pub const REQUIRED_ACCESS_LEVEL: &str = "requiredAccessLevel";
    pub const ARCHIVE_POLICY: &str = "archivePolicy";
    pub const DISPLAY_TYPE: &str = "displayType";
    pub const CLASS_ID: &str = "classId";
    pub const ROW_SCHEMA: &str = "rowSchema";
}

macro_rules! int_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            #[must_use]
            pub fn as_i32(self) -> i32 {
                self as i32
            }

            #[must_use]
            pub fn from_i32(value: i32) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

int_enum!(
    /// Shape of a schema entry.
    NodeType { Leaf = 0, Node = 1, ChoiceOfNodes = 2, ListOfNodes = 3 }
);

int_enum!(
    /// Who may write a parameter and when. Stored as a bit mask.
    AccessMode { Init = 1, Read = 2, Write = 4 }
);

int_enum!(
    /// Whether a parameter must be supplied.
    Assignment { Optional = 0, Mandatory = 1, Internal = 2 }
);

int_enum!(
    /// Flavor of a leaf.
    LeafType { Property = 0, Command = 1, State = 2 }
);

int_enum!(
    /// Required access level of a parameter (opaque tag, not enforced as
    /// authorization).
    AccessLevel { Observer = 0, User = 1, Operator = 2, Expert = 3, Admin = 4 }
);

int_enum!(
    /// How often a logger should archive a property.
    ArchivePolicy {
        EveryEvent = 0,
        Every100Ms = 1,
        Every1S = 2,
        Every5S = 3,
        Every10S = 4,
        Every1Min = 5,
        Every10Min = 6,
        NoArchiving = 7,
    }
);

/// Bit mask of all access modes.
pub const ACCESS_ALL: i32 = 7;

/// Filter applied when elements are committed or a sub-schema is extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRules {
    /// Access-mode mask; an entry is kept if its mode intersects it.
    pub access_mode: i32,
    /// Keep only entries allowed in this state (empty: any).
    pub state: String,
    /// Keep only entries whose required level is at most this (-1: any).
    pub access_level: i32,
}

impl Default for AssemblyRules {
    fn default() -> Self {
        Self {
            access_mode: ACCESS_ALL,
            state: String::new(),
            access_level: -1,
        }
    }
}

impl AssemblyRules {
    #[must_use]
    pub fn new(access_mode: i32, state: &str, access_level: i32) -> Self {
        Self {
            access_mode,
            state: state.to_string(),
            access_level,
        }
    }

    fn admits(&self, attributes: &Attributes) -> bool {
        let mode_ok = attributes
            .get::<i32>(attr::ACCESS_MODE)
            .map(|mode| mode & self.access_mode != 0)
            .unwrap_or(true);
        let state_ok = self.state.is_empty()
            || attributes
                .get::<Vec<String>>(attr::ALLOWED_STATES)
                .map(|states| states.is_empty() || states.iter().any(|s| *s == self.state))
                .unwrap_or(true);
        let level_ok = self.access_level < 0
            || attributes
                .get::<i32>(attr::REQUIRED_ACCESS_LEVEL)
                .map(|level| level <= self.access_level)
                .unwrap_or(true);
        mode_ok && state_ok && level_ok
    }
}

/// Parameter description of a configurable class.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    root_name: String,
    parameters: Hash,
    rules: AssemblyRules,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.root_name == other.root_name && self.parameters == other.parameters
    }
}

impl Schema {
    #[must_use]
    pub fn new(root_name: &str) -> Self {
        Self {
            root_name: root_name.to_string(),
            ..Self::default()
        }
    }

    /// A schema whose commits are filtered by `rules`.
    #[must_use]
    pub fn with_rules(root_name: &str, rules: AssemblyRules) -> Self {
        Self {
            root_name: root_name.to_string(),
            parameters: Hash::new(),
            rules,
        }
    }

    /// Wrap an existing parameter Hash.
    #[must_use]
    pub fn from_parameters(root_name: &str, parameters: Hash) -> Self {
        Self {
            root_name: root_name.to_string(),
            parameters,
            rules: AssemblyRules::default(),
        }
    }

    #[must_use]
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub fn set_root_name(&mut self, root_name: &str) {
        self.root_name = root_name.to_string();
    }

    #[must_use]
    pub fn parameters(&self) -> &Hash {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Hash {
        &mut self.parameters
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    // =========================================================================
    // Element registration
    // =========================================================================

    /// Register an element described by `attributes` at `key`.
    ///
    /// Leaves store `NONE`; every other node type stores a Hash of children.
    /// Elements rejected by the assembly rules are silently skipped.
    pub fn add_element(&mut self, key: &str, attributes: Attributes) -> Result<()> {
        let description_error =
            |msg: &str| KaraboError::Parse(format!("bad description for parameter '{key}': {msg}"));
        if key.is_empty() {
            return Err(description_error("missing key"));
        }
        let node_type = attributes
            .get::<i32>(attr::NODE_TYPE)
            .ok()
            .and_then(NodeType::from_i32)
            .ok_or_else(|| description_error("missing nodeType"))?;
        if !attributes.has(attr::ACCESS_MODE) {
            return Err(description_error("missing accessMode"));
        }
        if matches!(node_type, NodeType::Leaf | NodeType::ChoiceOfNodes)
            && !attributes.has(attr::ASSIGNMENT)
        {
            return Err(description_error("missing assignment"));
        }
        if !self.rules.admits(&attributes) {
            return Ok(());
        }
        if node_type == NodeType::Leaf {
            check_leaf(&attributes).map_err(|msg| description_error(&msg))?;
        }
        if let Some(alias) = attributes.get_value(attr::ALIAS) {
            if let Some(other) = self.alias_to_key(alias) {
                if other != key {
                    return Err(description_error(&format!(
                        "alias already used by '{other}'"
                    )));
                }
            }
        }
        let value = match node_type {
            NodeType::Leaf => Value::None,
            _ => match self.parameters.get_hash(key) {
                // keep children declared before the node itself
                Ok(children) => Value::Hash(children.clone()),
                Err(_) => Value::Hash(Hash::new()),
            },
        };
        self.parameters.set(key, value).set_attributes(attributes);
        Ok(())
    }

    /// Overwrite attributes of an existing entry.
    pub fn overwrite_attributes(&mut self, key: &str, attributes: &Attributes) -> Result<()> {
        let node = self
            .parameters
            .get_node_mut(key)
            .map_err(|_| KaraboError::NotFound(format!("cannot overwrite unknown parameter '{key}'")))?;
        node.attributes_mut().merge(attributes);
        if node
            .attributes()
            .get::<i32>(attr::NODE_TYPE)
            .map(|t| t == NodeType::Leaf.as_i32())
            .unwrap_or(false)
        {
            check_leaf(node.attributes())
                .map_err(|msg| KaraboError::Parse(format!("bad overwrite of '{key}': {msg}")))?;
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn node(&self, path: &str) -> Result<&Node> {
        self.parameters.get_node(path)
    }

    fn attribute(&self, path: &str, name: &str) -> Option<&Value> {
        self.node(path).ok()?.attributes().get_value(name)
    }

    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        self.parameters.has(path)
    }

    pub fn node_type(&self, path: &str) -> Result<NodeType> {
        let node = self.node(path)?;
        node.get_attribute::<i32>(attr::NODE_TYPE)
            .ok()
            .and_then(NodeType::from_i32)
            .ok_or_else(|| KaraboError::Parse(format!("'{path}' has no valid nodeType")))
    }

    #[must_use]
    pub fn is_leaf(&self, path: &str) -> bool {
        matches!(self.node_type(path), Ok(NodeType::Leaf))
    }

    #[must_use]
    pub fn is_node(&self, path: &str) -> bool {
        matches!(self.node_type(path), Ok(NodeType::Node))
    }

    #[must_use]
    pub fn is_choice_of_nodes(&self, path: &str) -> bool {
        matches!(self.node_type(path), Ok(NodeType::ChoiceOfNodes))
    }

    #[must_use]
    pub fn is_list_of_nodes(&self, path: &str) -> bool {
        matches!(self.node_type(path), Ok(NodeType::ListOfNodes))
    }

    /// True for slot nodes.
    #[must_use]
    pub fn is_command(&self, path: &str) -> bool {
        self.is_node(path) && self.display_type(path).as_deref() == Some("Slot")
    }

    #[must_use]
    pub fn is_property(&self, path: &str) -> bool {
        self.is_leaf(path) && self.leaf_type(path) != Some(LeafType::Command)
    }

    #[must_use]
    pub fn leaf_type(&self, path: &str) -> Option<LeafType> {
        self.attribute(path, attr::LEAF_TYPE)
            .and_then(|v| cast::convert(v, ReferenceType::Int32).ok())
            .and_then(|v| match v {
                Value::Int32(i) => LeafType::from_i32(i),
                _ => None,
            })
    }

    pub fn value_type(&self, path: &str) -> Result<ReferenceType> {
        let name: String = self.node(path)?.get_attribute(attr::VALUE_TYPE)?;
        name.parse()
    }

    pub fn access_mode(&self, path: &str) -> Result<i32> {
        self.node(path)?.get_attribute(attr::ACCESS_MODE)
    }

    #[must_use]
    pub fn is_access_init_only(&self, path: &str) -> bool {
        matches!(self.access_mode(path), Ok(m) if m == AccessMode::Init.as_i32())
    }

    #[must_use]
    pub fn is_access_read_only(&self, path: &str) -> bool {
        matches!(self.access_mode(path), Ok(m) if m == AccessMode::Read.as_i32())
    }

    #[must_use]
    pub fn is_access_reconfigurable(&self, path: &str) -> bool {
        matches!(self.access_mode(path), Ok(m) if m == AccessMode::Write.as_i32())
    }

    pub fn assignment(&self, path: &str) -> Result<Assignment> {
        let raw: i32 = self.node(path)?.get_attribute(attr::ASSIGNMENT)?;
        Assignment::from_i32(raw)
            .ok_or_else(|| KaraboError::Parse(format!("'{path}' has invalid assignment {raw}")))
    }

    #[must_use]
    pub fn default_value(&self, path: &str) -> Option<&Value> {
        self.attribute(path, attr::DEFAULT_VALUE)
    }

    #[must_use]
    pub fn has_default_value(&self, path: &str) -> bool {
        self.default_value(path).is_some()
    }

    #[must_use]
    pub fn options(&self, path: &str) -> Option<&Value> {
        self.attribute(path, attr::OPTIONS)
    }

    /// Names in `allowedStates`; empty if unrestricted.
    #[must_use]
    pub fn allowed_states(&self, path: &str) -> Vec<String> {
        self.node(path)
            .and_then(|n| n.get_attribute::<Vec<String>>(attr::ALLOWED_STATES))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn tags(&self, path: &str) -> Vec<String> {
        self.node(path)
            .and_then(|n| n.get_attribute::<Vec<String>>(attr::TAGS))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn display_type(&self, path: &str) -> Option<String> {
        self.node(path)
            .and_then(|n| n.get_attribute::<String>(attr::DISPLAY_TYPE))
            .ok()
    }

    #[must_use]
    pub fn displayed_name(&self, path: &str) -> Option<String> {
        self.node(path)
            .and_then(|n| n.get_attribute::<String>(attr::DISPLAYED_NAME))
            .ok()
    }

    #[must_use]
    pub fn description(&self, path: &str) -> Option<String> {
        self.node(path)
            .and_then(|n| n.get_attribute::<String>(attr::DESCRIPTION))
            .ok()
    }

    #[must_use]
    pub fn required_access_level(&self, path: &str) -> AccessLevel {
        self.node(path)
            .and_then(|n| n.get_attribute::<i32>(attr::REQUIRED_ACCESS_LEVEL))
            .ok()
            .and_then(AccessLevel::from_i32)
            .unwrap_or(AccessLevel::Observer)
    }

    #[must_use]
    pub fn row_schema(&self, path: &str) -> Option<Schema> {
        match self.attribute(path, attr::ROW_SCHEMA)? {
            Value::Schema(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Child keys of a node (top level if `path` is empty).
    #[must_use]
    pub fn keys(&self, path: &str) -> Vec<String> {
        let hash = if path.is_empty() {
            Some(&self.parameters)
        } else {
            self.parameters.get_hash(path).ok()
        };
        hash.map(|h| h.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Full paths of all leaves (property and state leaves, not slots).
    #[must_use]
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_leaves(&self.parameters, "", &mut out);
        out
    }

    /// Path whose `alias` attribute equals `alias`.
    #[must_use]
    pub fn alias_to_key(&self, alias: &Value) -> Option<String> {
        find_alias(&self.parameters, "", alias)
    }

    #[must_use]
    pub fn key_to_alias(&self, path: &str) -> Option<&Value> {
        self.attribute(path, attr::ALIAS)
    }

    pub fn set_attribute(&mut self, path: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.parameters.set_attribute(path, name, value)
    }

    // =========================================================================
    // Combination and extraction
    // =========================================================================

    /// Merge `other` into this schema; attributes of shared entries are
    /// overridden by `other`'s.
    pub fn merge(&mut self, other: &Schema) {
        self.parameters
            .merge(&other.parameters, MergePolicy::MergeAttributes);
    }

    /// Append `other`'s entries; redeclaring an existing leaf is an error.
    pub fn append_schema(&mut self, other: &Schema) -> Result<()> {
        for leaf in other.leaf_paths() {
            if self.is_leaf(&leaf) {
                return Err(KaraboError::Parse(format!(
                    "parameter '{leaf}' is already declared"
                )));
            }
        }
        self.merge(other);
        Ok(())
    }

    /// Import another class's parameters as a node at `key`.
    pub fn append_parameters_of(&mut self, key: &str, other: &Schema) -> Result<()> {
        elements::NodeElement::new(self)
            .key(key)
            .class_id(other.root_name())
            .displayed_name(other.root_name())
            .commit()?;
        let node = self.parameters.get_hash_mut(key)?;
        node.merge(&other.parameters, MergePolicy::MergeAttributes);
        Ok(())
    }

    /// The schema rooted at a node.
    pub fn sub_schema(&self, path: &str) -> Result<Schema> {
        let children = self.parameters.get_hash(path)?;
        Ok(Schema::from_parameters(&self.root_name, children.clone()))
    }

    /// Entries admitted by `rules` (state-dependent / access-dependent
    /// view).
    #[must_use]
    pub fn sub_schema_by_rules(&self, rules: &AssemblyRules) -> Schema {
        Schema::from_parameters(&self.root_name, filter(&self.parameters, rules))
    }
}

fn filter(hash: &Hash, rules: &AssemblyRules) -> Hash {
    let mut out = Hash::new();
    for node in hash {
        if !rules.admits(node.attributes()) {
            continue;
        }
        let value = match node.value() {
            Value::Hash(children) => Value::Hash(filter(children, rules)),
            other => other.clone(),
        };
        out.set_key(node.key(), value)
            .set_attributes(node.attributes().clone());
    }
    out
}

fn is_slot(node: &Node) -> bool {
    node.get_attribute::<String>(attr::DISPLAY_TYPE)
        .map(|d| d == "Slot")
        .unwrap_or(false)
}

fn collect_leaves(hash: &Hash, prefix: &str, out: &mut Vec<String>) {
    for node in hash {
        let full = path::join(prefix, node.key());
        match node.value() {
            Value::Hash(children) => {
                if !is_slot(node) {
                    collect_leaves(children, &full, out);
                }
            }
            _ => out.push(full),
        }
    }
}

fn find_alias(hash: &Hash, prefix: &str, alias: &Value) -> Option<String> {
    for node in hash {
        let full = path::join(prefix, node.key());
        if node.attributes().get_value(attr::ALIAS) == Some(alias) {
            return Some(full);
        }
        if let Value::Hash(children) = node.value() {
            if let Some(found) = find_alias(children, &full, alias) {
                return Some(found);
            }
        }
    }
    None
}

fn bound(attributes: &Attributes, name: &str) -> Option<f64> {
    attributes.get_as::<f64>(name).ok()
}

/// Consistency checks of a leaf description.
fn check_leaf(attributes: &Attributes) -> std::result::Result<(), String> {
    let type_name: String = attributes
        .get(attr::VALUE_TYPE)
        .map_err(|_| "missing valueType".to_string())?;
    let value_type: ReferenceType = type_name.parse().map_err(|_| format!("unknown valueType {type_name}"))?;

    if let Some(options) = attributes.get_value(attr::OPTIONS) {
        let target = if value_type.is_vector() {
            value_type
        } else {
            value_type.vector_type().unwrap_or(value_type)
        };
        cast::convert(options, target)
            .map_err(|_| format!("options are not castable to {value_type}"))?;
    }
    if let Some(default) = attributes.get_value(attr::DEFAULT_VALUE) {
        cast::convert(default, value_type)
            .map_err(|_| format!("default value is not castable to {value_type}"))?;
    }

    let min_inc = bound(attributes, attr::MIN_INC);
    let min_exc = bound(attributes, attr::MIN_EXC);
    let max_inc = bound(attributes, attr::MAX_INC);
    let max_exc = bound(attributes, attr::MAX_EXC);
    if min_inc.is_some() && min_exc.is_some() {
        return Err("both minInc and minExc given".into());
    }
    if max_inc.is_some() && max_exc.is_some() {
        return Err("both maxInc and maxExc given".into());
    }
    let incoherent = match (min_inc.or(min_exc), max_inc.or(max_exc)) {
        (Some(lo), Some(hi)) => {
            if min_inc.is_some() && max_inc.is_some() {
                lo > hi
            } else {
                lo >= hi
            }
        }
        _ => false,
    };
    if incoherent {
        return Err("minimum exceeds maximum".into());
    }
    if let (Ok(lo), Ok(hi)) = (
        attributes.get::<u32>(attr::MIN_SIZE),
        attributes.get::<u32>(attr::MAX_SIZE),
    ) {
        if lo > hi {
            return Err("minSize exceeds maxSize".into());
        }
    }
    Ok(())
}

/// State names of an `allowedStates` attribute.
#[must_use]
pub fn state_names(states: &[State]) -> Value {
    Value::VectorString(State::names(states))
}

#[cfg(test)]
mod tests {
    use super::elements::*;
    use super::*;

    fn sample() -> Schema {
        let mut s = Schema::new("Sample");
        Int32Element::new(&mut s)
            .key("count")
            .alias(10i32)
            .assignment_optional()
            .default_value(1)
            .reconfigurable()
            .commit()
            .unwrap();
        NodeElement::new(&mut s).key("node").commit().unwrap();
        DoubleElement::new(&mut s)
            .key("node.value")
            .read_only()
            .initial_value(0.5)
            .commit()
            .unwrap();
        SlotElement::new(&mut s)
            .key("start")
            .allowed_states(&[State::Normal])
            .commit()
            .unwrap();
        s
    }

    #[test]
    fn test_queries() {
        let s = sample();
        assert!(s.is_leaf("count"));
        assert!(s.is_node("node"));
        assert!(s.is_command("start"));
        assert!(s.is_access_reconfigurable("count"));
        assert!(s.is_access_read_only("node.value"));
        assert_eq!(s.value_type("node.value").unwrap(), ReferenceType::Double);
        assert_eq!(s.assignment("count").unwrap(), Assignment::Optional);
        assert_eq!(s.default_value("count"), Some(&Value::Int32(1)));
        assert_eq!(s.allowed_states("start"), vec!["NORMAL"]);
        assert_eq!(s.leaf_paths(), vec!["count", "node.value"]);
    }

    #[test]
    fn test_alias_lookup_and_uniqueness() {
        let mut s = sample();
        assert_eq!(s.alias_to_key(&Value::Int32(10)).as_deref(), Some("count"));
        assert_eq!(s.key_to_alias("count"), Some(&Value::Int32(10)));
        let dup = Int32Element::new(&mut s)
            .key("other")
            .alias(10i32)
            .assignment_optional()
            .default_value(0)
            .commit();
        assert!(dup.is_err());
    }

    #[test]
    fn test_append_schema_rejects_redeclared_leaf() {
        let mut s = sample();
        let mut other = Schema::new("Other");
        Int32Element::new(&mut other)
            .key("count")
            .assignment_optional()
            .default_value(5)
            .commit()
            .unwrap();
        assert!(s.append_schema(&other).is_err());

        let mut fresh = Schema::new("Fresh");
        StringElement::new(&mut fresh)
            .key("label")
            .assignment_optional()
            .default_value("x".to_string())
            .commit()
            .unwrap();
        s.append_schema(&fresh).unwrap();
        assert!(s.is_leaf("label"));
    }

    #[test]
    fn test_merge_overrides_attributes() {
        let mut s = sample();
        let mut inject = Schema::new("Sample");
        Int32Element::new(&mut inject)
            .key("count")
            .assignment_optional()
            .default_value(2)
            .min_inc(1)
            .reconfigurable()
            .commit()
            .unwrap();
        s.merge(&inject);
        assert_eq!(s.default_value("count"), Some(&Value::Int32(2)));
        assert!(s.parameters().has_attribute("count", attr::MIN_INC));
    }

    #[test]
    fn test_sub_schema_by_rules() {
        let s = sample();
        let writable = s.sub_schema_by_rules(&AssemblyRules::new(
            AccessMode::Write.as_i32(),
            "",
            -1,
        ));
        assert!(writable.has("count"));
        assert!(!writable.has("node.value"));

        let in_error = s.sub_schema_by_rules(&AssemblyRules::new(ACCESS_ALL, "ERROR", -1));
        assert!(!in_error.has("start"));
        assert!(in_error.has("count"));
    }

    #[test]
    fn test_rules_filter_commits() {
        let mut s = Schema::with_rules(
            "Filtered",
            AssemblyRules::new(AccessMode::Read.as_i32(), "", -1),
        );
        Int32Element::new(&mut s)
            .key("w")
            .assignment_optional()
            .default_value(0)
            .reconfigurable()
            .commit()
            .unwrap();
        assert!(!s.has("w"));
    }

    #[test]
    fn test_incoherent_range_rejected() {
        let mut s = Schema::new("Bad");
        let result = Int32Element::new(&mut s)
            .key("k")
            .assignment_optional()
            .default_value(0)
            .min_inc(5)
            .max_inc(1)
            .commit();
        assert!(matches!(result, Err(KaraboError::Parse(_))));
    }

    #[test]
    fn test_options_must_cast() {
        let mut s = Schema::new("Opt");
        let result = Int32Element::new(&mut s)
            .key("k")
            .assignment_optional()
            .default_value(1)
            .options_text("1,2,x")
            .commit();
        assert!(result.is_err());
    }
}
