//! Device server settings.
//!
//! Read from a Hash validated against [`ServerConfig::schema`]; the
//! command line turns every `key=value` argument into one string entry and
//! the validator coerces it to the declared type.

use std::path::PathBuf;
use std::time::Duration;

use karabo_data::schema::elements::{
    BoolElement, Int32Element, NodeElement, StringElement, VectorStringElement,
};
use karabo_data::{
    AccessLevel, Hash, KaraboError, Result, Schema, ValidationRules, Validator,
};

/// Class id of the server's own schema.
pub const SERVER_CLASS_ID: &str = "DeviceServer";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub server_id: String,
    /// Classes this server offers; empty offers every registered class.
    pub device_classes: Vec<String>,
    /// Minimum access level of callers allowed to start and kill devices.
    pub visibility: AccessLevel,
    /// `DEBUG`, `INFO`, `WARN` or `ERROR`.
    pub log_priority: String,
    /// Devices to start right away: `deviceId -> {classId, ...config}`.
    pub init: Hash,
    pub plugin_directory: PathBuf,
    pub scan_plugins: bool,
    pub heartbeat_interval: Duration,
    /// Instance whose `signalTimeTick` is forwarded to the devices.
    pub time_server_id: Option<String>,
}

impl ServerConfig {
    /// Defaults for `server_id`.
    pub fn new(server_id: &str) -> Result<Self> {
        Self::from_hash(&Hash::new().with("serverId", server_id))
    }

    pub fn schema() -> Result<Schema> {
        let mut s = Schema::new(SERVER_CLASS_ID);
        StringElement::new(&mut s)
            .key("serverId")
            .displayed_name("Server ID")
            .description("The device server instance id uniquely identifies this server")
            .assignment_mandatory()
            .init()
            .commit()?;
        VectorStringElement::new(&mut s)
            .key("deviceClasses")
            .displayed_name("Device Classes")
            .description("The device classes the server will manage (empty: all)")
            .assignment_optional()
            .default_value(Vec::new())
            .init()
            .commit()?;
        Int32Element::new(&mut s)
            .key("visibility")
            .displayed_name("Visibility")
            .description("Minimum access level of callers managing devices here")
            .assignment_optional()
            .default_value(0)
            .min_inc(0)
            .max_inc(4)
            .init()
            .commit()?;
        NodeElement::new(&mut s)
            .key("Logger")
            .displayed_name("Logger")
            .commit()?;
        StringElement::new(&mut s)
            .key("Logger.priority")
            .displayed_name("Priority")
            .options_text("DEBUG,INFO,WARN,ERROR")
            .assignment_optional()
            .default_value("INFO".to_string())
            .init()
            .commit()?;
        StringElement::new(&mut s)
            .key("init")
            .displayed_name("Auto start")
            .description("JSON object of devices to start: {deviceId: {classId: ..., ...}}")
            .assignment_optional()
            .default_value(String::new())
            .init()
            .commit()?;
        StringElement::new(&mut s)
            .key("pluginDirectory")
            .displayed_name("Plugin Directory")
            .assignment_optional()
            .default_value("plugins".to_string())
            .init()
            .commit()?;
        BoolElement::new(&mut s)
            .key("scanPlugins")
            .displayed_name("Scan plug-ins?")
            .assignment_optional()
            .default_value(true)
            .init()
            .commit()?;
        Int32Element::new(&mut s)
            .key("heartbeatInterval")
            .displayed_name("Heartbeat interval")
            .unit("s")
            .assignment_optional()
            .default_value(10)
            .min_inc(1)
            .init()
            .commit()?;
        StringElement::new(&mut s)
            .key("timeServerId")
            .displayed_name("Time Server Id")
            .assignment_optional()
            .default_value(String::new())
            .init()
            .commit()?;
        Ok(s)
    }

    pub fn from_hash(config: &Hash) -> Result<Self> {
        let rules = ValidationRules {
            inject_timestamps: false,
            ..ValidationRules::initialization()
        };
        let c = Validator::new(rules)
            .validate(&Self::schema()?, config)
            .into_result()?;

        let init_text = c.get::<String>("init")?;
        let init = if init_text.trim().is_empty() {
            Hash::new()
        } else {
            Hash::from_json_str(&init_text)?
        };
        let visibility = c.get::<i32>("visibility")?;
        let heartbeat = c.get::<i32>("heartbeatInterval")?;
        let time_server_id = c.get::<String>("timeServerId")?;

        Ok(Self {
            server_id: c.get("serverId")?,
            device_classes: c.get("deviceClasses")?,
            visibility: AccessLevel::from_i32(visibility).ok_or_else(|| {
                KaraboError::Parse(format!("visibility {visibility} is not an access level"))
            })?,
            log_priority: c.get("Logger.priority")?,
            init,
            plugin_directory: PathBuf::from(c.get::<String>("pluginDirectory")?),
            scan_plugins: c.get("scanPlugins")?,
            heartbeat_interval: Duration::from_secs(u64::try_from(heartbeat).unwrap_or(1)),
            time_server_id: Some(time_server_id).filter(|id| !id.is_empty()),
        })
    }

    /// Parse `key=value` arguments.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hash = Hash::new();
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| KaraboError::Parse(format!("argument '{arg}' is not key=value")))?;
            hash.set(key.trim(), value.trim());
        }
        Self::from_hash(&hash)
    }
}
