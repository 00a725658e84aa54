//! # Validator
//!
//! Applies a [`Schema`] to a candidate configuration [`Hash`]:
//!
//! - injects defaults of missing optional leaves, nodes and choices
//! - coerces every leaf to its declared `valueType`
//! - checks options, ranges, vector sizes and table rows
//! - gates writes by access mode and `allowedStates` when reconfiguring
//! - attaches timestamps to the validated leaves
//!
//! The output follows the schema's key order; extra keys (if allowed) come
//! last in input order. Validating a validated configuration again yields
//! the same Hash.

use crate::cast;
use crate::errors::{KaraboError, Result, Violation, ViolationKind};
use crate::hash::{path, Attributes, Hash, Node};
use crate::schema::{attr, elements::SLOT_DISPLAY_TYPE, AccessMode, Assignment, LeafType, NodeType, Schema};
use crate::state::State;
use crate::time::Timestamp;
use crate::types::ReferenceType;
use crate::value::Value;

/// What the configuration is validated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationContext {
    /// Construction of an instance; every access mode may be set.
    Initialization,
    /// External reconfiguration of a running instance in the given state.
    Reconfiguration(State),
    /// Updates made by the instance itself.
    Internal,
}

/// Knobs of a validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRules {
    pub inject_defaults: bool,
    pub allow_additional_keys: bool,
    pub allow_missing_keys: bool,
    pub allow_unrooted_configuration: bool,
    pub inject_timestamps: bool,
    pub force_injected_timestamp: bool,
    pub clamp_to_range: bool,
    pub context: ValidationContext,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::initialization()
    }
}

impl ValidationRules {
    /// Full configuration of a new instance.
    #[must_use]
    pub fn initialization() -> Self {
        Self {
            inject_defaults: true,
            allow_additional_keys: false,
            allow_missing_keys: false,
            allow_unrooted_configuration: true,
            inject_timestamps: true,
            force_injected_timestamp: false,
            clamp_to_range: false,
            context: ValidationContext::Initialization,
        }
    }

    /// Partial update of an instance in `state`.
    #[must_use]
    pub fn reconfiguration(state: State) -> Self {
        Self {
            inject_defaults: false,
            allow_missing_keys: true,
            context: ValidationContext::Reconfiguration(state),
            ..Self::initialization()
        }
    }

    /// Partial update performed by the instance itself.
    #[must_use]
    pub fn internal() -> Self {
        Self {
            inject_defaults: false,
            allow_missing_keys: true,
            context: ValidationContext::Internal,
            ..Self::initialization()
        }
    }
}

/// Result of a validation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// The normalized configuration (valid keys only).
    pub validated: Hash,
    /// Everything that was rejected.
    pub violations: Vec<Violation>,
    has_reconfigurable: bool,
}

impl ValidationReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Whether a reconfigurable (WRITE) leaf was part of the input.
    #[must_use]
    pub fn has_reconfigurable_parameter(&self) -> bool {
        self.has_reconfigurable
    }

    /// The validated Hash, or a `Validation` error with all violations.
    pub fn into_result(self) -> Result<Hash> {
        if self.violations.is_empty() {
            Ok(self.validated)
        } else {
            Err(KaraboError::Validation(self.violations))
        }
    }
}

/// Validates configurations against schemas under fixed rules.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    rules: ValidationRules,
    timestamp: Option<Timestamp>,
}

impl Validator {
    #[must_use]
    pub fn new(rules: ValidationRules) -> Self {
        Self {
            rules,
            timestamp: None,
        }
    }

    /// Timestamp attached to validated leaves (default: now).
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Validate `config` against `schema`.
    #[must_use]
    pub fn validate(&self, schema: &Schema, config: &Hash) -> ValidationReport {
        let mut run = Run {
            rules: &self.rules,
            timestamp: self.timestamp.unwrap_or_else(Timestamp::now),
            violations: Vec::new(),
            has_reconfigurable: false,
        };
        let validated = if self.rules.allow_unrooted_configuration {
            run.node(schema.parameters(), config, "")
        } else {
            let root = schema.root_name();
            match config.get_hash(root) {
                Ok(inner) if config.len() == 1 => {
                    let mut rooted = Hash::new();
                    rooted.set_key(root, run.node(schema.parameters(), inner, root));
                    rooted
                }
                _ => {
                    run.violation(
                        root,
                        ViolationKind::UnknownKey,
                        format!("configuration must have the single root key '{root}'"),
                    );
                    Hash::new()
                }
            }
        };
        ValidationReport {
            validated,
            violations: run.violations,
            has_reconfigurable: run.has_reconfigurable,
        }
    }
}

/// Shortcut for `Validator::new(rules).validate(schema, config)`.
#[must_use]
pub fn validate(schema: &Schema, config: &Hash, rules: ValidationRules) -> ValidationReport {
    Validator::new(rules).validate(schema, config)
}

struct Run<'a> {
    rules: &'a ValidationRules,
    timestamp: Timestamp,
    violations: Vec<Violation>,
    has_reconfigurable: bool,
}

fn int_attribute(node: &Node, name: &str) -> Option<i32> {
    node.attributes().get::<i32>(name).ok()
}

fn is_slot(node: &Node) -> bool {
    node.get_attribute::<String>(attr::DISPLAY_TYPE)
        .map(|d| d == SLOT_DISPLAY_TYPE)
        .unwrap_or(false)
}

fn as_f64(value: &Value) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    Some(match value {
        Value::Int8(x) => f64::from(*x),
        Value::UInt8(x) => f64::from(*x),
        Value::Int16(x) => f64::from(*x),
        Value::UInt16(x) => f64::from(*x),
        Value::Int32(x) => f64::from(*x),
        Value::UInt32(x) => f64::from(*x),
        Value::Int64(x) => *x as f64,
        Value::UInt64(x) => *x as f64,
        Value::Float(x) => f64::from(*x),
        Value::Double(x) => *x,
        _ => return None,
    })
}

impl Run<'_> {
    fn violation(&mut self, path: &str, kind: ViolationKind, message: impl Into<String>) {
        self.violations.push(Violation::new(path, kind, message));
    }

    fn stamp(&self, attributes: &mut Attributes) {
        if self.rules.inject_timestamps
            && (self.rules.force_injected_timestamp || !Timestamp::is_in(attributes))
        {
            self.timestamp.to_attributes(attributes);
        }
    }

    /// Validate the children of a node.
    fn node(&mut self, schema: &Hash, input: &Hash, prefix: &str) -> Hash {
        let mut output = Hash::new();
        for description in schema {
            let key = description.key();
            let full = path::join(prefix, key);
            let supplied = input.find(key);

            if is_slot(description) {
                if let Some(node) = supplied {
                    let empty = node.value().as_hash().map(Hash::is_empty).unwrap_or(false);
                    if !empty {
                        self.violation(&full, ViolationKind::UnknownKey, "a slot cannot be configured");
                    }
                }
                continue;
            }

            let node_type = int_attribute(description, attr::NODE_TYPE).and_then(NodeType::from_i32);
            match node_type {
                Some(NodeType::Leaf) => self.leaf(description, supplied, &full, &mut output),
                Some(NodeType::Node) => self.sub_node(description, supplied, &full, &mut output),
                Some(NodeType::ChoiceOfNodes) => self.choice(description, supplied, &full, &mut output),
                Some(NodeType::ListOfNodes) => self.list(description, supplied, &full, &mut output),
                None => {}
            }
        }

        for node in input {
            if schema.find(node.key()).is_some() {
                continue;
            }
            if self.rules.allow_additional_keys {
                output
                    .set_key(node.key(), node.value().clone())
                    .set_attributes(node.attributes().clone());
            } else {
                self.violation(
                    &path::join(prefix, node.key()),
                    ViolationKind::UnknownKey,
                    "key is not described by the schema",
                );
            }
        }
        output
    }

    fn sub_node(&mut self, description: &Node, supplied: Option<&Node>, full: &str, output: &mut Hash) {
        let Some(children) = description.value().as_hash() else {
            return;
        };
        match supplied {
            Some(node) => match node.value() {
                Value::Hash(given) => {
                    let validated = self.node(children, given, full);
                    output
                        .set_key(description.key(), validated)
                        .set_attributes(node.attributes().clone());
                }
                other => self.violation(
                    full,
                    ViolationKind::TypeMismatch,
                    format!("expected a node, found {}", other.value_type()),
                ),
            },
            None => {
                if self.rules.inject_defaults {
                    let validated = self.node(children, &Hash::new(), full);
                    output.set_key(description.key(), validated);
                } else if !self.rules.allow_missing_keys {
                    self.node(children, &Hash::new(), full);
                }
            }
        }
    }

    fn missing_mandatory(&mut self, description: &Node, full: &str) -> bool {
        let mandatory =
            int_attribute(description, attr::ASSIGNMENT) == Some(Assignment::Mandatory.as_i32());
        if mandatory && !self.rules.allow_missing_keys {
            self.violation(full, ViolationKind::MissingMandatory, "missing mandatory parameter");
        }
        mandatory
    }

    fn choice(&mut self, description: &Node, supplied: Option<&Node>, full: &str, output: &mut Hash) {
        let Some(options) = description.value().as_hash() else {
            return;
        };
        let selected: Option<(String, Hash)> = match supplied.map(Node::value) {
            Some(Value::String(name)) => Some((name.clone(), Hash::new())),
            Some(Value::Hash(h)) if h.len() == 1 => h.iter().next().map(|n| {
                let body = n.value().as_hash().cloned().unwrap_or_default();
                (n.key().to_string(), body)
            }),
            Some(Value::Hash(h)) if h.is_empty() => None,
            Some(Value::Hash(_)) => {
                self.violation(full, ViolationKind::TypeMismatch, "more than one option selected");
                return;
            }
            Some(other) => {
                self.violation(
                    full,
                    ViolationKind::TypeMismatch,
                    format!("expected an option name or node, found {}", other.value_type()),
                );
                return;
            }
            None => None,
        };
        let selected = match selected {
            Some(s) => Some(s),
            None => {
                if self.missing_mandatory(description, full) {
                    return;
                }
                match description.get_attribute::<String>(attr::DEFAULT_VALUE) {
                    Ok(name) if self.rules.inject_defaults => Some((name, Hash::new())),
                    _ => None,
                }
            }
        };
        let Some((name, body)) = selected else {
            return;
        };
        let Some(option) = options.find(&name) else {
            self.violation(full, ViolationKind::UnknownKey, format!("unknown option '{name}'"));
            return;
        };
        let option_children = option.value().as_hash().cloned().unwrap_or_default();
        let validated = self.node(&option_children, &body, &path::join(full, &name));
        let mut chosen = Hash::new();
        chosen.set_key(&name, validated);
        let node = output.set_key(description.key(), chosen);
        if let Some(given) = supplied {
            node.set_attributes(given.attributes().clone());
        }
    }

    fn list(&mut self, description: &Node, supplied: Option<&Node>, full: &str, output: &mut Hash) {
        let Some(options) = description.value().as_hash() else {
            return;
        };
        let entries: Vec<(String, Hash)> = match supplied.map(Node::value) {
            Some(Value::VectorString(names)) => {
                names.iter().map(|n| (n.clone(), Hash::new())).collect()
            }
            Some(Value::VectorHash(items)) => {
                let mut entries = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let Some(first) = item.iter().next().filter(|_| item.len() == 1) else {
                        self.violation(
                            &format!("{full}[{i}]"),
                            ViolationKind::TypeMismatch,
                            "each list entry must select exactly one option",
                        );
                        return;
                    };
                    let body = first.value().as_hash().cloned().unwrap_or_default();
                    entries.push((first.key().to_string(), body));
                }
                entries
            }
            Some(other) => {
                self.violation(
                    full,
                    ViolationKind::TypeMismatch,
                    format!("expected a list of options, found {}", other.value_type()),
                );
                return;
            }
            None => {
                if self.missing_mandatory(description, full) || !self.rules.inject_defaults {
                    return;
                }
                match description.get_attribute::<Vec<String>>(attr::DEFAULT_VALUE) {
                    Ok(names) => names.into_iter().map(|n| (n, Hash::new())).collect(),
                    Err(_) => return,
                }
            }
        };

        let count = i64::try_from(entries.len()).unwrap_or(i64::MAX);
        if let Ok(min) = description.attributes().get_as::<i64>(attr::MIN) {
            if count < min {
                self.violation(full, ViolationKind::OutOfRange, format!("at least {min} entries required"));
            }
        }
        if let Ok(max) = description.attributes().get_as::<i64>(attr::MAX) {
            if count > max {
                self.violation(full, ViolationKind::OutOfRange, format!("at most {max} entries allowed"));
            }
        }

        let mut validated = Vec::with_capacity(entries.len());
        for (i, (name, body)) in entries.into_iter().enumerate() {
            let Some(option) = options.find(&name) else {
                self.violation(
                    &format!("{full}[{i}]"),
                    ViolationKind::UnknownKey,
                    format!("unknown option '{name}'"),
                );
                continue;
            };
            let option_children = option.value().as_hash().cloned().unwrap_or_default();
            let inner = self.node(&option_children, &body, &format!("{full}[{i}].{name}"));
            let mut entry = Hash::new();
            entry.set_key(&name, inner);
            validated.push(entry);
        }
        let node = output.set_key(description.key(), Value::VectorHash(validated));
        if let Some(given) = supplied {
            node.set_attributes(given.attributes().clone());
        }
    }

    fn leaf(&mut self, description: &Node, supplied: Option<&Node>, full: &str, output: &mut Hash) {
        let Some(value_type) = description
            .get_attribute::<String>(attr::VALUE_TYPE)
            .ok()
            .and_then(|name| ReferenceType::from_name(&name))
        else {
            return;
        };
        let access = int_attribute(description, attr::ACCESS_MODE).unwrap_or(AccessMode::Write.as_i32());

        let Some(given) = supplied else {
            if self.missing_mandatory(description, full) || !self.rules.inject_defaults {
                return;
            }
            if let Some(default) = description.attributes().get_value(attr::DEFAULT_VALUE) {
                match cast::convert(default, value_type) {
                    Ok(value) => {
                        let mut attributes = Attributes::new();
                        self.stamp(&mut attributes);
                        output.set_key(description.key(), value).set_attributes(attributes);
                    }
                    Err(e) => self.violation(full, ViolationKind::TypeMismatch, e.detail()),
                }
            }
            return;
        };

        let rules = self.rules;
        if let ValidationContext::Reconfiguration(state) = &rules.context {
            if access == AccessMode::Init.as_i32() {
                self.violation(full, ViolationKind::InitOnlyAfterInit, "parameter can only be set at initialization");
                return;
            }
            if access == AccessMode::Read.as_i32() {
                self.violation(full, ViolationKind::ReadOnly, "parameter is read-only");
                return;
            }
            let allowed = description
                .get_attribute::<Vec<String>>(attr::ALLOWED_STATES)
                .unwrap_or_default();
            if !state.is_allowed_by(&allowed) {
                self.violation(
                    full,
                    ViolationKind::DisallowedState,
                    format!("not settable in state {state} (allowed: {})", allowed.join(",")),
                );
                return;
            }
        }
        if access == AccessMode::Write.as_i32() {
            self.has_reconfigurable = true;
        }

        let coerced = match (given.value(), value_type) {
            (Value::VectorString(v), ReferenceType::VectorHash) if v.is_empty() => {
                Ok(Value::VectorHash(Vec::new()))
            }
            (value, target) => cast::convert(value, target),
        };
        let mut value = match coerced {
            Ok(v) => v,
            Err(e) => {
                self.violation(full, ViolationKind::TypeMismatch, e.detail());
                return;
            }
        };

        if int_attribute(description, attr::LEAF_TYPE) == Some(LeafType::State.as_i32()) {
            if let Some(name) = value.as_str() {
                if name.parse::<State>().is_err() {
                    self.violation(full, ViolationKind::TypeMismatch, format!("'{name}' is not a state"));
                    return;
                }
            }
        }

        if !self.check_options(description, &value, full)
            || !self.check_range(description, &mut value, value_type, full)
            || !self.check_size(description, &value, full)
        {
            return;
        }

        if let Some(Value::Schema(row_schema)) = description.attributes().get_value(attr::ROW_SCHEMA) {
            if let Value::VectorHash(rows) = &mut value {
                if !self.check_rows(row_schema, rows, full) {
                    return;
                }
            }
        }

        let mut attributes = given.attributes().clone();
        self.stamp(&mut attributes);
        output.set_key(description.key(), value).set_attributes(attributes);
    }

    fn check_rows(&mut self, row_schema: &Schema, rows: &mut [Hash], full: &str) -> bool {
        let row_rules = ValidationRules {
            inject_defaults: true,
            allow_missing_keys: false,
            inject_timestamps: false,
            context: ValidationContext::Internal,
            ..self.rules.clone()
        };
        let mut nested = Run {
            rules: &row_rules,
            timestamp: self.timestamp,
            violations: Vec::new(),
            has_reconfigurable: false,
        };
        for (i, row) in rows.iter_mut().enumerate() {
            *row = nested.node(row_schema.parameters(), row, &format!("{full}[{i}]"));
        }
        let ok = nested.violations.is_empty();
        self.violations.append(&mut nested.violations);
        ok
    }

    fn check_options(&mut self, description: &Node, value: &Value, full: &str) -> bool {
        let Some(options) = description.attributes().get_value(attr::OPTIONS) else {
            return true;
        };
        let (Ok(Value::VectorString(allowed)), Ok(text)) = (
            cast::convert(options, ReferenceType::VectorString),
            cast::to_text(value),
        ) else {
            return true;
        };
        if allowed.iter().any(|o| *o == text) {
            return true;
        }
        self.violation(
            full,
            ViolationKind::NotInOptions,
            format!("'{text}' is not one of [{}]", allowed.join(",")),
        );
        false
    }

    fn check_range(
        &mut self,
        description: &Node,
        value: &mut Value,
        value_type: ReferenceType,
        full: &str,
    ) -> bool {
        let Some(x) = as_f64(value) else {
            return true;
        };
        let attributes = description.attributes();
        let bound = |name: &str| attributes.get_value(name).and_then(as_f64);

        let clamp = self.rules.clamp_to_range;
        let mut clamp_to = None;
        let mut failure = None;
        if let Some(b) = bound(attr::MIN_EXC) {
            if x <= b {
                failure = Some(format!("{x} must be greater than {b} (minExc)"));
            }
        }
        if let Some(b) = bound(attr::MIN_INC) {
            if x < b {
                if clamp {
                    clamp_to = Some(attr::MIN_INC);
                } else {
                    failure = Some(format!("{x} must be at least {b} (minInc)"));
                }
            }
        }
        if let Some(b) = bound(attr::MAX_EXC) {
            if x >= b {
                failure = Some(format!("{x} must be less than {b} (maxExc)"));
            }
        }
        if let Some(b) = bound(attr::MAX_INC) {
            if x > b {
                if clamp {
                    clamp_to = Some(attr::MAX_INC);
                } else {
                    failure = Some(format!("{x} must be at most {b} (maxInc)"));
                }
            }
        }
        if let Some(message) = failure {
            self.violation(full, ViolationKind::OutOfRange, message);
            return false;
        }
        if let Some(name) = clamp_to {
            match attributes
                .get_value(name)
                .map(|b| cast::convert(b, value_type))
            {
                Some(Ok(clamped)) => *value = clamped,
                _ => {
                    self.violation(full, ViolationKind::OutOfRange, format!("cannot clamp to {name}"));
                    return false;
                }
            }
        }
        true
    }

    fn check_size(&mut self, description: &Node, value: &Value, full: &str) -> bool {
        let Some(len) = value.vector_len() else {
            return true;
        };
        let attributes = description.attributes();
        if let Ok(min) = attributes.get_as::<u64>(attr::MIN_SIZE) {
            if (len as u64) < min {
                self.violation(full, ViolationKind::OutOfRange, format!("size {len} is below minSize {min}"));
                return false;
            }
        }
        if let Ok(max) = attributes.get_as::<u64>(attr::MAX_SIZE) {
            if len as u64 > max {
                self.violation(full, ViolationKind::OutOfRange, format!("size {len} exceeds maxSize {max}"));
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::elements::*;
    use crate::time::{Epochstamp, Trainstamp};

    fn schema() -> Schema {
        let mut s = Schema::new("Motor");
        Int32Element::new(&mut s)
            .key("speed")
            .assignment_optional()
            .default_value(10)
            .min_inc(0)
            .max_inc(100)
            .reconfigurable()
            .allowed_states(&[State::On, State::Off])
            .commit()
            .unwrap();
        StringElement::new(&mut s)
            .key("mode")
            .options_text("fast,slow")
            .assignment_optional()
            .default_value("slow".to_string())
            .init()
            .commit()
            .unwrap();
        StringElement::new(&mut s)
            .key("address")
            .assignment_mandatory()
            .init()
            .commit()
            .unwrap();
        DoubleElement::new(&mut s)
            .key("position")
            .read_only()
            .initial_value(0.0)
            .commit()
            .unwrap();
        NodeElement::new(&mut s).key("limits").commit().unwrap();
        DoubleElement::new(&mut s)
            .key("limits.upper")
            .assignment_optional()
            .default_value(1.0)
            .max_exc(10.0)
            .reconfigurable()
            .commit()
            .unwrap();
        SlotElement::new(&mut s).key("move").commit().unwrap();
        s
    }

    fn ts() -> Timestamp {
        Timestamp::new(Epochstamp::new(1, 0), Trainstamp(7))
    }

    fn init(config: &Hash) -> ValidationReport {
        Validator::new(ValidationRules::initialization())
            .with_timestamp(ts())
            .validate(&schema(), config)
    }

    #[test]
    fn test_defaults_injected_in_schema_order() {
        let report = init(&Hash::new().with("address", "tcp://m1").with("speed", "42"));
        assert!(report.is_valid(), "{:?}", report.violations);
        let v = &report.validated;
        assert_eq!(v.paths(), vec!["speed", "mode", "address", "position", "limits.upper"]);
        assert_eq!(v.get::<i32>("speed").unwrap(), 42);
        assert_eq!(v.get::<String>("mode").unwrap(), "slow");
        assert_eq!(v.get_attribute::<u64>("speed", "tid").unwrap(), 7);
        assert!(!v.has("move"));
    }

    #[test]
    fn test_violations() {
        let report = init(
            &Hash::new()
                .with("speed", 101i32)
                .with("mode", "medium")
                .with("limits.upper", 10.0f64)
                .with("bogus", 1i32),
        );
        let kinds: Vec<_> = report
            .violations
            .iter()
            .map(|v| (v.path.as_str(), v.kind))
            .collect();
        assert!(kinds.contains(&("speed", ViolationKind::OutOfRange)));
        assert!(kinds.contains(&("mode", ViolationKind::NotInOptions)));
        assert!(kinds.contains(&("address", ViolationKind::MissingMandatory)));
        assert!(kinds.contains(&("limits.upper", ViolationKind::OutOfRange)));
        assert!(kinds.contains(&("bogus", ViolationKind::UnknownKey)));
        assert!(matches!(report.into_result(), Err(KaraboError::Validation(v)) if v.len() == 5));
    }

    #[test]
    fn test_type_mismatch() {
        let report = init(&Hash::new().with("address", "a").with("speed", "fast"));
        assert_eq!(report.violations[0].kind, ViolationKind::TypeMismatch);
    }

    #[test]
    fn test_clamping_is_opt_in() {
        let rules = ValidationRules {
            clamp_to_range: true,
            ..ValidationRules::initialization()
        };
        let report = Validator::new(rules)
            .with_timestamp(ts())
            .validate(&schema(), &Hash::new().with("address", "a").with("speed", 500i32));
        assert!(report.is_valid());
        assert_eq!(report.validated.get::<i32>("speed").unwrap(), 100);
    }

    #[test]
    fn test_validation_is_idempotent() {
        let first = init(&Hash::new().with("address", "a").with("mode", "fast"));
        let second = init(&first.validated);
        assert!(second.is_valid());
        assert_eq!(second.validated, first.validated);
    }

    #[test]
    fn test_reconfiguration_gates() {
        let s = schema();
        let reconfigure = |state: State, changes: Hash| {
            Validator::new(ValidationRules::reconfiguration(state))
                .with_timestamp(ts())
                .validate(&s, &changes)
        };

        let ok = reconfigure(State::On, Hash::new().with("speed", 5i32));
        assert!(ok.is_valid());
        assert!(ok.has_reconfigurable_parameter());
        assert_eq!(ok.validated.paths(), vec!["speed"]);

        let kinds = |r: ValidationReport| r.violations.iter().map(|v| v.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds(reconfigure(State::Error, Hash::new().with("speed", 5i32))),
            vec![ViolationKind::DisallowedState]
        );
        assert_eq!(
            kinds(reconfigure(State::On, Hash::new().with("mode", "fast"))),
            vec![ViolationKind::InitOnlyAfterInit]
        );
        assert_eq!(
            kinds(reconfigure(State::On, Hash::new().with("position", 1.0f64))),
            vec![ViolationKind::ReadOnly]
        );
    }

    #[test]
    fn test_rooted_configuration() {
        let rules = ValidationRules {
            allow_unrooted_configuration: false,
            ..ValidationRules::initialization()
        };
        let v = Validator::new(rules.clone()).with_timestamp(ts());
        let good = v.validate(&schema(), &Hash::new().with("Motor.address", "a"));
        assert!(good.is_valid());
        assert_eq!(good.validated.get::<i32>("Motor.speed").unwrap(), 10);
        let bad = v.validate(&schema(), &Hash::new().with("address", "a"));
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_choice_and_list_options() {
        let mut s = Schema::new("Cfg");
        ChoiceElement::new(&mut s)
            .key("link")
            .default_value("Tcp")
            .commit()
            .unwrap();
        NodeElement::new(&mut s).key("link.Tcp").commit().unwrap();
        UInt32Element::new(&mut s)
            .key("link.Tcp.port")
            .assignment_optional()
            .default_value(80)
            .commit()
            .unwrap();
        NodeElement::new(&mut s).key("link.Udp").commit().unwrap();
        ListElement::new(&mut s)
            .key("stages")
            .default_value(&["A"])
            .commit()
            .unwrap();
        NodeElement::new(&mut s).key("stages.A").commit().unwrap();
        NodeElement::new(&mut s).key("stages.B").commit().unwrap();

        let report = validate(&s, &Hash::new(), ValidationRules::initialization());
        assert!(report.is_valid());
        assert_eq!(report.validated.get::<u32>("link.Tcp.port").unwrap(), 80);
        assert_eq!(report.validated.get_vector_hash("stages").unwrap().len(), 1);

        let chosen = validate(
            &s,
            &Hash::new().with("link", "Udp").with("stages", vec!["B", "A"]),
            ValidationRules::initialization(),
        );
        assert!(chosen.is_valid());
        assert!(chosen.validated.has("link.Udp"));
        assert!(chosen.validated.has("stages[0].B"));

        let unknown = validate(
            &s,
            &Hash::new().with("link", "Serial").with("stages", vec!["C"]),
            ValidationRules::initialization(),
        );
        let kinds: Vec<_> = unknown.violations.iter().map(|v| v.kind).collect();
        assert_eq!(kinds, vec![ViolationKind::UnknownKey, ViolationKind::UnknownKey]);
    }

    #[test]
    fn test_table_rows_validated() {
        let mut row = Schema::new("Row");
        StringElement::new(&mut row)
            .key("name")
            .assignment_mandatory()
            .commit()
            .unwrap();
        Int32Element::new(&mut row)
            .key("gain")
            .assignment_optional()
            .default_value(1)
            .commit()
            .unwrap();
        let mut s = Schema::new("Tab");
        TableElement::new(&mut s)
            .key("table")
            .row_schema(&row)
            .assignment_optional()
            .default_value(Vec::new())
            .max_size(2)
            .commit()
            .unwrap();

        let ok = validate(
            &s,
            &Hash::new().with("table", vec![Hash::new().with("name", "x")]),
            ValidationRules::initialization(),
        );
        assert!(ok.is_valid());
        assert_eq!(ok.validated.get::<i32>("table[0].gain").unwrap(), 1);

        let bad = validate(
            &s,
            &Hash::new().with("table", vec![Hash::new().with("gain", 2i32)]),
            ValidationRules::initialization(),
        );
        assert_eq!(bad.violations[0].path, "table[0].name");
        assert_eq!(bad.violations[0].kind, ViolationKind::MissingMandatory);

        let too_long = validate(
            &s,
            &Hash::new().with("table", vec![Hash::new(), Hash::new(), Hash::new()]),
            ValidationRules::initialization(),
        );
        assert_eq!(too_long.violations[0].kind, ViolationKind::OutOfRange);
    }
}
