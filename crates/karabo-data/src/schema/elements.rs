//! # Schema Elements
//!
//! Builders for every kind of schema entry. Leaves are typed
//! [`LeafElement`]s (`Int32Element`, `StringElement`, `TableElement`, ...);
//! structural entries have their own builders below.

use crate::errors::Result;
use crate::hash::Attributes;
use crate::state::State;
use crate::value::Value;

use super::{attr, AccessMode, Assignment, LeafType, NodeType, Schema, ACCESS_ALL};

pub use super::builder::*;

/// Display type marking a node as a slot.
pub const SLOT_DISPLAY_TYPE: &str = "Slot";
/// Display type of output channel nodes.
pub const OUTPUT_CHANNEL_DISPLAY_TYPE: &str = "OutputChannel";
/// Display type of input channel nodes.
pub const INPUT_CHANNEL_DISPLAY_TYPE: &str = "InputChannel";

fn node_attributes(node_type: NodeType) -> Attributes {
    let mut attributes = Attributes::new();
    attributes
        .set(attr::NODE_TYPE, node_type.as_i32())
        .set(attr::ACCESS_MODE, ACCESS_ALL);
    attributes
}

// =============================================================================
// NODE
// =============================================================================

/// A plain grouping node.
#[must_use = "an element is only added to the schema by commit()"]
pub struct NodeElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
}

impl<'a> NodeElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        Self {
            schema,
            key: String::new(),
            attributes: node_attributes(NodeType::Node),
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(mut self, name: &str) -> Self {
        self.attributes.set(attr::DISPLAYED_NAME, name);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.attributes.set(attr::DESCRIPTION, text);
        self
    }

    pub fn class_id(mut self, class_id: &str) -> Self {
        self.attributes.set(attr::CLASS_ID, class_id);
        self
    }

    pub fn display_type(mut self, display_type: &str) -> Self {
        self.attributes.set(attr::DISPLAY_TYPE, display_type);
        self
    }

    pub fn commit(self) -> Result<()> {
        self.schema.add_element(&self.key, self.attributes)
    }
}

// =============================================================================
// CHOICE / LIST
// =============================================================================

/// Exactly one of the child nodes is selected.
#[must_use = "an element is only added to the schema by commit()"]
pub struct ChoiceElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
}

impl<'a> ChoiceElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        let mut attributes = node_attributes(NodeType::ChoiceOfNodes);
        attributes.set(attr::ASSIGNMENT, Assignment::Optional.as_i32());
        Self {
            schema,
            key: String::new(),
            attributes,
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(mut self, name: &str) -> Self {
        self.attributes.set(attr::DISPLAYED_NAME, name);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.attributes.set(attr::DESCRIPTION, text);
        self
    }

    pub fn assignment_mandatory(mut self) -> Self {
        self.attributes
            .set(attr::ASSIGNMENT, Assignment::Mandatory.as_i32());
        self
    }

    /// Name of the option chosen when none is given.
    pub fn default_value(mut self, option: &str) -> Self {
        self.attributes.set(attr::DEFAULT_VALUE, option);
        self
    }

    pub fn init(mut self) -> Self {
        self.attributes
            .set(attr::ACCESS_MODE, AccessMode::Init.as_i32());
        self
    }

    pub fn reconfigurable(mut self) -> Self {
        self.attributes
            .set(attr::ACCESS_MODE, AccessMode::Write.as_i32());
        self
    }

    pub fn commit(self) -> Result<()> {
        self.schema.add_element(&self.key, self.attributes)
    }
}

/// Any number of the child nodes, in any order.
#[must_use = "an element is only added to the schema by commit()"]
pub struct ListElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
}

impl<'a> ListElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        let mut attributes = node_attributes(NodeType::ListOfNodes);
        attributes.set(attr::ASSIGNMENT, Assignment::Optional.as_i32());
        Self {
            schema,
            key: String::new(),
            attributes,
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(mut self, name: &str) -> Self {
        self.attributes.set(attr::DISPLAYED_NAME, name);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.attributes.set(attr::DESCRIPTION, text);
        self
    }

    pub fn assignment_mandatory(mut self) -> Self {
        self.attributes
            .set(attr::ASSIGNMENT, Assignment::Mandatory.as_i32());
        self
    }

    /// Options selected when none are given.
    pub fn default_value(mut self, options: &[&str]) -> Self {
        self.attributes.set(attr::DEFAULT_VALUE, options);
        self
    }

    /// Minimum number of selected options.
    pub fn min(mut self, count: i32) -> Self {
        self.attributes.set(attr::MIN, count);
        self
    }

    /// Maximum number of selected options.
    pub fn max(mut self, count: i32) -> Self {
        self.attributes.set(attr::MAX, count);
        self
    }

    pub fn init(mut self) -> Self {
        self.attributes
            .set(attr::ACCESS_MODE, AccessMode::Init.as_i32());
        self
    }

    pub fn commit(self) -> Result<()> {
        self.schema.add_element(&self.key, self.attributes)
    }
}

// =============================================================================
// SLOT / STATE
// =============================================================================

/// A command invocable on a device.
#[must_use = "an element is only added to the schema by commit()"]
pub struct SlotElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
}

impl<'a> SlotElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        let mut attributes = Attributes::new();
        attributes
            .set(attr::NODE_TYPE, NodeType::Node.as_i32())
            .set(attr::ACCESS_MODE, AccessMode::Write.as_i32())
            .set(attr::DISPLAY_TYPE, SLOT_DISPLAY_TYPE)
            .set(attr::CLASS_ID, SLOT_DISPLAY_TYPE);
        Self {
            schema,
            key: String::new(),
            attributes,
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(mut self, name: &str) -> Self {
        self.attributes.set(attr::DISPLAYED_NAME, name);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.attributes.set(attr::DESCRIPTION, text);
        self
    }

    pub fn allowed_states(mut self, states: &[State]) -> Self {
        self.attributes
            .set(attr::ALLOWED_STATES, State::names(states));
        self
    }

    pub fn commit(self) -> Result<()> {
        self.schema.add_element(&self.key, self.attributes)
    }
}

/// The read-only state leaf of a device.
#[must_use = "an element is only added to the schema by commit()"]
pub struct StateElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
}

impl<'a> StateElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        let mut attributes = Attributes::new();
        attributes
            .set(attr::NODE_TYPE, NodeType::Leaf.as_i32())
            .set(attr::VALUE_TYPE, crate::types::ReferenceType::String.name())
            .set(attr::LEAF_TYPE, LeafType::State.as_i32())
            .set(attr::ACCESS_MODE, AccessMode::Read.as_i32())
            .set(attr::ASSIGNMENT, Assignment::Optional.as_i32())
            .set(attr::DISPLAY_TYPE, "State")
            .set(attr::CLASS_ID, "State")
            .set(attr::DEFAULT_VALUE, State::Unknown.name());
        Self {
            schema,
            key: "state".to_string(),
            attributes,
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(mut self, name: &str) -> Self {
        self.attributes.set(attr::DISPLAYED_NAME, name);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.attributes.set(attr::DESCRIPTION, text);
        self
    }

    /// Restrict the states this leaf may take.
    pub fn options(mut self, states: &[State]) -> Self {
        self.attributes.set(attr::OPTIONS, State::names(states));
        self
    }

    pub fn initial_value(mut self, state: State) -> Self {
        self.attributes.set(attr::DEFAULT_VALUE, state.name());
        self
    }

    pub fn commit(self) -> Result<()> {
        self.schema.add_element(&self.key, self.attributes)
    }
}

// =============================================================================
// PIPELINE CHANNELS
// =============================================================================

/// Node describing a pipeline output channel and its data schema.
#[must_use = "an element is only added to the schema by commit()"]
pub struct OutputChannelElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
    data_schema: Option<Schema>,
}

impl<'a> OutputChannelElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        let mut attributes = node_attributes(NodeType::Node);
        attributes
            .set(attr::DISPLAY_TYPE, OUTPUT_CHANNEL_DISPLAY_TYPE)
            .set(attr::CLASS_ID, OUTPUT_CHANNEL_DISPLAY_TYPE);
        Self {
            schema,
            key: String::new(),
            attributes,
            data_schema: None,
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(mut self, name: &str) -> Self {
        self.attributes.set(attr::DISPLAYED_NAME, name);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.attributes.set(attr::DESCRIPTION, text);
        self
    }

    /// Schema of the data written to this channel.
    pub fn data_schema(mut self, data: &Schema) -> Self {
        self.data_schema = Some(data.clone());
        self
    }

    pub fn commit(self) -> Result<()> {
        let key = self.key;
        self.schema.add_element(&key, self.attributes)?;
        if !self.schema.has(&key) {
            return Ok(());
        }
        let child = |name: &str| format!("{key}.{name}");
        StringElement::new(self.schema)
            .key(&child("hostname"))
            .displayed_name("Hostname")
            .description("Hostname or interface the channel server binds to")
            .assignment_optional()
            .default_value("default".to_string())
            .init()
            .commit()?;
        UInt32Element::new(self.schema)
            .key(&child("port"))
            .displayed_name("Port")
            .description("Port of the channel server (0: any free port)")
            .assignment_optional()
            .default_value(0)
            .init()
            .commit()?;
        StringElement::new(self.schema)
            .key(&child("distributionMode"))
            .displayed_name("Distribution Mode")
            .description("How shared inputs receive data")
            .options_text("load-balanced,round-robin")
            .assignment_optional()
            .default_value("load-balanced".to_string())
            .init()
            .commit()?;
        StringElement::new(self.schema)
            .key(&child("noInputShared"))
            .displayed_name("No Input (Shared)")
            .description("What to do if no shared input is ready")
            .options_text("wait,drop")
            .assignment_optional()
            .default_value("drop".to_string())
            .reconfigurable()
            .commit()?;
        NodeElement::new(self.schema)
            .key(&child("schema"))
            .displayed_name("Data Schema")
            .commit()?;
        if let Some(data) = self.data_schema {
            let node = self.schema.parameters_mut().get_hash_mut(&child("schema"))?;
            node.merge(data.parameters(), crate::hash::MergePolicy::MergeAttributes);
        }
        Ok(())
    }
}

/// Node describing a pipeline input channel.
#[must_use = "an element is only added to the schema by commit()"]
pub struct InputChannelElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
    data_schema: Option<Schema>,
}

impl<'a> InputChannelElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        let mut attributes = node_attributes(NodeType::Node);
        attributes
            .set(attr::DISPLAY_TYPE, INPUT_CHANNEL_DISPLAY_TYPE)
            .set(attr::CLASS_ID, INPUT_CHANNEL_DISPLAY_TYPE);
        Self {
            schema,
            key: String::new(),
            attributes,
            data_schema: None,
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn displayed_name(mut self, name: &str) -> Self {
        self.attributes.set(attr::DISPLAYED_NAME, name);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.attributes.set(attr::DESCRIPTION, text);
        self
    }

    pub fn data_schema(mut self, data: &Schema) -> Self {
        self.data_schema = Some(data.clone());
        self
    }

    pub fn commit(self) -> Result<()> {
        let key = self.key;
        self.schema.add_element(&key, self.attributes)?;
        if !self.schema.has(&key) {
            return Ok(());
        }
        let child = |name: &str| format!("{key}.{name}");
        VectorStringElement::new(self.schema)
            .key(&child("connectedOutputChannels"))
            .displayed_name("Connected Output Channels")
            .description("Outputs to read from, as 'instanceId:channelName'")
            .assignment_optional()
            .default_value(Vec::new())
            .reconfigurable()
            .commit()?;
        StringElement::new(self.schema)
            .key(&child("dataDistribution"))
            .displayed_name("Data Distribution")
            .description("'copy': every chunk; 'shared': chunks split among shared inputs")
            .options_text("copy,shared")
            .assignment_optional()
            .default_value("copy".to_string())
            .reconfigurable()
            .commit()?;
        StringElement::new(self.schema)
            .key(&child("onSlowness"))
            .displayed_name("On Slowness")
            .description("Policy of the output when this input is not ready")
            .options_text("wait,drop,queueDrop,throw")
            .assignment_optional()
            .default_value("drop".to_string())
            .reconfigurable()
            .commit()?;
        UInt32Element::new(self.schema)
            .key(&child("maxQueueLength"))
            .displayed_name("Max Queue Length")
            .description("Chunks queued for this input under 'queueDrop'")
            .assignment_optional()
            .default_value(2)
            .min_inc(1)
            .reconfigurable()
            .commit()?;
        BoolElement::new(self.schema)
            .key(&child("respondToEndOfStream"))
            .displayed_name("Respond To End-Of-Stream")
            .assignment_optional()
            .default_value(true)
            .reconfigurable()
            .commit()?;
        VectorStringElement::new(self.schema)
            .key(&child("missingConnections"))
            .displayed_name("Missing Connections")
            .description("Configured outputs currently not connected")
            .read_only()
            .initial_value(Vec::new())
            .commit()?;
        if let Some(data) = self.data_schema {
            NodeElement::new(self.schema)
                .key(&child("schema"))
                .displayed_name("Data Schema")
                .commit()?;
            let node = self.schema.parameters_mut().get_hash_mut(&child("schema"))?;
            node.merge(data.parameters(), crate::hash::MergePolicy::MergeAttributes);
        }
        Ok(())
    }
}

// =============================================================================
// OVERWRITE
// =============================================================================

/// Modify attributes of an already declared (usually inherited) entry.
#[must_use = "an element is only applied to the schema by commit()"]
pub struct OverwriteElement<'a> {
    schema: &'a mut Schema,
    key: String,
    attributes: Attributes,
}

impl<'a> OverwriteElement<'a> {
    pub fn new(schema: &'a mut Schema) -> Self {
        Self {
            schema,
            key: String::new(),
            attributes: Attributes::new(),
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.set(name, value);
        self
    }

    pub fn set_new_displayed_name(self, name: &str) -> Self {
        self.with(attr::DISPLAYED_NAME, name)
    }

    pub fn set_new_description(self, text: &str) -> Self {
        self.with(attr::DESCRIPTION, text)
    }

    pub fn set_new_alias(self, alias: impl Into<Value>) -> Self {
        self.with(attr::ALIAS, alias)
    }

    pub fn set_new_tags(self, tags: &[&str]) -> Self {
        self.with(attr::TAGS, tags)
    }

    pub fn set_new_default_value(self, value: impl Into<Value>) -> Self {
        self.with(attr::DEFAULT_VALUE, value)
    }

    pub fn set_new_min_inc(self, value: impl Into<Value>) -> Self {
        self.with(attr::MIN_INC, value)
    }

    pub fn set_new_max_inc(self, value: impl Into<Value>) -> Self {
        self.with(attr::MAX_INC, value)
    }

    pub fn set_new_min_exc(self, value: impl Into<Value>) -> Self {
        self.with(attr::MIN_EXC, value)
    }

    pub fn set_new_max_exc(self, value: impl Into<Value>) -> Self {
        self.with(attr::MAX_EXC, value)
    }

    pub fn set_new_options(self, options: impl Into<Value>) -> Self {
        self.with(attr::OPTIONS, options)
    }

    pub fn set_new_allowed_states(self, states: &[State]) -> Self {
        self.with(attr::ALLOWED_STATES, State::names(states))
    }

    pub fn set_new_unit(self, symbol: &str) -> Self {
        self.with(attr::UNIT_SYMBOL, symbol)
    }

    pub fn set_new_assignment_mandatory(self) -> Self {
        self.with(attr::ASSIGNMENT, Assignment::Mandatory.as_i32())
    }

    pub fn set_new_assignment_optional(self) -> Self {
        self.with(attr::ASSIGNMENT, Assignment::Optional.as_i32())
    }

    pub fn set_new_assignment_internal(self) -> Self {
        self.with(attr::ASSIGNMENT, Assignment::Internal.as_i32())
    }

    pub fn set_now_init(self) -> Self {
        self.with(attr::ACCESS_MODE, AccessMode::Init.as_i32())
    }

    pub fn set_now_reconfigurable(self) -> Self {
        self.with(attr::ACCESS_MODE, AccessMode::Write.as_i32())
    }

    pub fn set_now_read_only(self) -> Self {
        self.with(attr::ACCESS_MODE, AccessMode::Read.as_i32())
    }

    /// Errors with `NotFound` if the key was never declared.
    pub fn commit(self) -> Result<()> {
        self.schema.overwrite_attributes(&self.key, &self.attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::KaraboError;
    use crate::schema::{Assignment, AccessMode};
    use crate::types::ReferenceType;

    #[test]
    fn test_choice_and_list() {
        let mut s = Schema::new("Cfg");
        ChoiceElement::new(&mut s)
            .key("connection")
            .default_value("Tcp")
            .commit()
            .unwrap();
        NodeElement::new(&mut s).key("connection.Tcp").commit().unwrap();
        NodeElement::new(&mut s).key("connection.Udp").commit().unwrap();
        ListElement::new(&mut s)
            .key("filters")
            .default_value(&["A"])
            .max(2)
            .commit()
            .unwrap();
        NodeElement::new(&mut s).key("filters.A").commit().unwrap();

        assert!(s.is_choice_of_nodes("connection"));
        assert_eq!(s.keys("connection"), vec!["Tcp", "Udp"]);
        assert!(s.is_list_of_nodes("filters"));
        assert_eq!(
            s.default_value("filters"),
            Some(&Value::VectorString(vec!["A".into()]))
        );
    }

    #[test]
    fn test_state_element() {
        let mut s = Schema::new("Dev");
        StateElement::new(&mut s)
            .options(&[State::Init, State::Normal, State::Error])
            .initial_value(State::Init)
            .commit()
            .unwrap();
        assert!(s.is_access_read_only("state"));
        assert_eq!(s.value_type("state").unwrap(), ReferenceType::String);
        assert_eq!(s.leaf_type("state"), Some(LeafType::State));
        assert_eq!(s.default_value("state"), Some(&Value::String("INIT".into())));
    }

    #[test]
    fn test_output_channel_children() {
        let mut data = Schema::new("Data");
        Int32Element::new(&mut data)
            .key("frame")
            .read_only()
            .commit()
            .unwrap();
        let mut s = Schema::new("Producer");
        OutputChannelElement::new(&mut s)
            .key("output")
            .data_schema(&data)
            .commit()
            .unwrap();
        assert_eq!(s.display_type("output").as_deref(), Some("OutputChannel"));
        assert_eq!(s.default_value("output.port"), Some(&Value::UInt32(0)));
        assert_eq!(
            s.options("output.noInputShared"),
            Some(&Value::VectorString(vec!["wait".into(), "drop".into()]))
        );
        assert!(s.is_leaf("output.schema.frame"));
    }

    #[test]
    fn test_input_channel_children() {
        let mut s = Schema::new("Consumer");
        InputChannelElement::new(&mut s).key("input").commit().unwrap();
        assert_eq!(
            s.default_value("input.onSlowness"),
            Some(&Value::String("drop".into()))
        );
        assert_eq!(
            s.default_value("input.maxQueueLength"),
            Some(&Value::UInt32(2))
        );
        assert!(s.is_access_read_only("input.missingConnections"));
    }

    #[test]
    fn test_overwrite() {
        let mut s = Schema::new("Dev");
        Int32Element::new(&mut s)
            .key("k")
            .assignment_optional()
            .default_value(1)
            .commit()
            .unwrap();
        OverwriteElement::new(&mut s)
            .key("k")
            .set_new_default_value(5i32)
            .set_now_read_only()
            .set_new_assignment_mandatory()
            .commit()
            .unwrap();
        assert_eq!(s.default_value("k"), Some(&Value::Int32(5)));
        assert_eq!(s.access_mode("k").unwrap(), AccessMode::Read.as_i32());
        assert_eq!(s.assignment("k").unwrap(), Assignment::Mandatory);

        let missing = OverwriteElement::new(&mut s).key("nope").commit();
        assert!(matches!(missing, Err(KaraboError::NotFound(_))));
    }
}
