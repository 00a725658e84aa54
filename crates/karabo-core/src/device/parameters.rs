//! # Device Parameters
//!
//! The parameters every device carries, and the live pair of effective
//! schema and current configuration.
//!
//! The effective schema is the class's static schema with the injected
//! schema merged on top. Injection never touches existing values: a key
//! that is already configured keeps its value when its description
//! changes, only newly described leaves receive their defaults.

use karabo_data::schema::elements::{Int32Element, SlotElement, StateElement, StringElement};
use karabo_data::{Hash, MergePolicy, Result, Schema, State, Timestamp, ValidationRules, Validator};

use super::class::DeviceClass;

/// `serverId` of devices started outside a server.
pub const NO_SERVER: &str = "__none__";

/// Default `heartbeatInterval` in seconds.
pub const DEFAULT_HEARTBEAT_SECS: i32 = 10;

/// Declare the common device parameters.
pub fn expected_parameters(schema: &mut Schema) -> Result<()> {
    StringElement::new(schema)
        .key("_deviceId_")
        .displayed_name("_DeviceID_")
        .description("Device id as assigned by the starting server")
        .assignment_optional()
        .default_value(String::new())
        .init()
        .commit()?;

    StringElement::new(schema)
        .key("deviceId")
        .displayed_name("DeviceID")
        .description("The device instance id uniquely identifies a device instance in the distributed system")
        .assignment_optional()
        .default_value(String::new())
        .init()
        .commit()?;

    StringElement::new(schema)
        .key("_serverId_")
        .displayed_name("_ServerID_")
        .assignment_optional()
        .default_value(NO_SERVER.to_string())
        .init()
        .commit()?;

    StringElement::new(schema)
        .key("serverId")
        .displayed_name("ServerID")
        .description("The device server which hosts this device")
        .read_only()
        .initial_value(NO_SERVER.to_string())
        .commit()?;

    StringElement::new(schema)
        .key("classId")
        .displayed_name("ClassID")
        .read_only()
        .initial_value(String::new())
        .commit()?;

    StringElement::new(schema)
        .key("classVersion")
        .displayed_name("Class version")
        .read_only()
        .initial_value(String::new())
        .commit()?;

    StringElement::new(schema)
        .key("hostName")
        .displayed_name("Host")
        .description("The name of the host where this device runs")
        .read_only()
        .initial_value(String::new())
        .commit()?;

    Int32Element::new(schema)
        .key("pid")
        .displayed_name("Process id")
        .read_only()
        .initial_value(0)
        .commit()?;

    Int32Element::new(schema)
        .key("heartbeatInterval")
        .displayed_name("Heartbeat interval")
        .description("The heartbeat interval")
        .unit("s")
        .assignment_optional()
        .default_value(DEFAULT_HEARTBEAT_SECS)
        .min_inc(1)
        .init()
        .expert_access()
        .commit()?;

    Int32Element::new(schema)
        .key("visibility")
        .displayed_name("Visibility")
        .description("Minimum access level needed to see this device")
        .assignment_optional()
        .default_value(0)
        .min_inc(0)
        .max_inc(4)
        .init()
        .admin_access()
        .commit()?;

    StateElement::new(schema)
        .key("state")
        .displayed_name("State")
        .initial_value(State::Unknown)
        .commit()?;

    StringElement::new(schema)
        .key("status")
        .displayed_name("Status")
        .read_only()
        .initial_value(String::new())
        .commit()?;

    StringElement::new(schema)
        .key("lockedBy")
        .displayed_name("Locked by")
        .assignment_optional()
        .default_value(String::new())
        .reconfigurable()
        .commit()?;

    StringElement::new(schema)
        .key("lastCommand")
        .displayed_name("Last command")
        .description("The last slot called, with the calling instance")
        .read_only()
        .initial_value(String::new())
        .commit()?;

    SlotElement::new(schema)
        .key("slotClearLock")
        .displayed_name("Clear lock")
        .commit()?;

    Ok(())
}

/// Common parameters followed by the class's own.
pub fn class_schema(class: &dyn DeviceClass) -> Result<Schema> {
    let mut schema = Schema::new(class.class_id());
    expected_parameters(&mut schema)?;
    class.expected_parameters(&mut schema)?;
    Ok(schema)
}

/// Effective schema and current configuration of one device.
#[derive(Debug, Clone)]
pub(crate) struct Parameters {
    pub config: Hash,
    pub static_schema: Schema,
    pub injected: Schema,
    pub full: Schema,
}

impl Parameters {
    pub fn new(static_schema: Schema, config: Hash) -> Self {
        let injected = Schema::new(static_schema.root_name());
        Self {
            config,
            full: static_schema.clone(),
            static_schema,
            injected,
        }
    }

    /// Merge `changes` (already validated) into the configuration.
    pub fn apply(&mut self, changes: &Hash) {
        self.config.merge(changes, MergePolicy::ReplaceAttributes);
    }

    /// Add `schema` to the injected schema. Returns the defaults given to
    /// leaves that had no value yet.
    pub fn append(&mut self, schema: &Schema, timestamp: Timestamp) -> Hash {
        self.injected.merge(schema);
        self.rebuild();
        self.fill_defaults(schema, timestamp)
    }

    /// Replace the injected schema by `schema`. Values of previously
    /// injected leaves that neither `schema` nor the static schema
    /// describe are dropped.
    pub fn replace_injected(&mut self, schema: &Schema, timestamp: Timestamp) -> Hash {
        for path in self.injected.leaf_paths() {
            if !schema.has(&path) && !self.static_schema.has(&path) {
                self.config.erase_path(&path);
            }
        }
        self.injected = schema.clone();
        self.injected.set_root_name(self.static_schema.root_name());
        self.rebuild();
        self.fill_defaults(schema, timestamp)
    }

    /// The values at `paths`; unknown paths are skipped.
    pub fn slice(&self, paths: &[String]) -> Hash {
        let mut out = Hash::new();
        for path in paths {
            if let Ok(node) = self.config.get_node(path) {
                out.set(path, node.value().clone())
                    .set_attributes(node.attributes().clone());
            }
        }
        out
    }

    fn rebuild(&mut self) {
        let mut full = self.static_schema.clone();
        full.merge(&self.injected);
        self.full = full;
    }

    fn fill_defaults(&mut self, schema: &Schema, timestamp: Timestamp) -> Hash {
        let rules = ValidationRules {
            allow_missing_keys: true,
            ..ValidationRules::initialization()
        };
        let defaults = Validator::new(rules)
            .with_timestamp(timestamp)
            .validate(schema, &Hash::new())
            .validated;
        let mut added = Hash::new();
        for path in defaults.paths() {
            if self.config.has(&path) {
                continue;
            }
            let Ok(node) = defaults.get_node(&path) else {
                continue;
            };
            if node.value().as_hash().is_some_and(Hash::is_empty) {
                continue;
            }
            self.config
                .set(&path, node.value().clone())
                .set_attributes(node.attributes().clone());
            added
                .set(&path, node.value().clone())
                .set_attributes(node.attributes().clone());
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_data::Value;

    fn k_schema(default: i32, min: i32, max: Option<i32>) -> Schema {
        let mut s = Schema::new("Injected");
        let element = Int32Element::new(&mut s)
            .key("k")
            .assignment_optional()
            .default_value(default)
            .min_inc(min)
            .reconfigurable();
        match max {
            Some(max) => element.max_inc(max).commit().unwrap(),
            None => element.commit().unwrap(),
        }
        s
    }

    fn params() -> Parameters {
        let mut s = Schema::new("Dev");
        Int32Element::new(&mut s)
            .key("k")
            .assignment_optional()
            .default_value(0)
            .reconfigurable()
            .commit()
            .unwrap();
        Parameters::new(s, Hash::new().with("k", 0i32))
    }

    #[test]
    fn test_injection_preserves_existing_value() {
        let mut p = params();
        p.apply(&Hash::new().with("k", 5i32));

        p.append(&k_schema(2, 1, None), Timestamp::now());
        assert_eq!(p.config.get::<i32>("k").unwrap(), 5);
        assert_eq!(p.full.default_value("k"), Some(&Value::Int32(2)));

        p.replace_injected(&k_schema(3, 2, None), Timestamp::now());
        assert_eq!(p.config.get::<i32>("k").unwrap(), 5);

        p.replace_injected(&k_schema(3, 2, Some(10)), Timestamp::now());
        assert_eq!(p.config.get::<i32>("k").unwrap(), 5);
        assert!(p.full.parameters().has_attribute("k", "maxInc"));
    }

    #[test]
    fn test_replace_drops_leaves_of_previous_injection() {
        let mut p = params();
        let mut extra = Schema::new("Injected");
        Int32Element::new(&mut extra)
            .key("extra")
            .assignment_optional()
            .default_value(7)
            .reconfigurable()
            .commit()
            .unwrap();

        let added = p.append(&extra, Timestamp::now());
        assert_eq!(added.get::<i32>("extra").unwrap(), 7);
        assert_eq!(p.config.get::<i32>("extra").unwrap(), 7);

        p.replace_injected(&k_schema(1, 0, None), Timestamp::now());
        assert!(!p.config.has("extra"));
        assert!(!p.full.has("extra"));
    }

    #[test]
    fn test_update_restores_static_attributes() {
        let mut p = params();
        p.append(&k_schema(2, 1, None), Timestamp::now());
        p.replace_injected(&Schema::new("Injected"), Timestamp::now());
        assert!(!p.full.parameters().has_attribute("k", "minInc"));
        assert_eq!(p.config.get::<i32>("k").unwrap(), 0);
    }

    #[test]
    fn test_slice() {
        let mut p = params();
        p.apply(&Hash::new().with("status", "ok"));
        let slice = p.slice(&["k".to_string(), "nope".to_string()]);
        assert_eq!(slice.len(), 1);
        assert_eq!(slice.get::<i32>("k").unwrap(), 0);
    }
}
