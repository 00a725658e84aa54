//! Channel settings and the connection handshake.
//!
//! Both channel kinds are configured from the node of the device
//! configuration that declares them:
//!
//! | Key | Channel | Default |
//! |-----|---------|---------|
//! | `hostname` | output | `default` (all interfaces, advertise host name) |
//! | `port` | output | `0` (ephemeral) |
//! | `distributionMode` | output | `load-balanced` |
//! | `connectedOutputChannels` | input | empty |
//! | `dataDistribution` | input | `copy` |
//! | `onSlowness` | input | `drop` |
//! | `maxQueueLength` | input | `2` |

use std::fmt;
use std::str::FromStr;

use karabo_data::{Hash, KaraboError, Result};

pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 2;
pub const DEFAULT_HOSTNAME: &str = "default";

/// What an output does when an input's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnSlowness {
    /// Block the producer until the input has room.
    Wait,
    /// Discard the new chunk for this input.
    #[default]
    Drop,
    /// Discard the oldest queued chunk to make room.
    QueueDrop,
    /// Fail the write with `Backpressure`.
    Throw,
}

/// Whether an input receives every chunk or shares them with its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDistribution {
    #[default]
    Copy,
    Shared,
}

/// How an output picks among its shared inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionMode {
    RoundRobin,
    #[default]
    LoadBalanced,
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = KaraboError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(KaraboError::Parse(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(OnSlowness {
    Wait => "wait",
    Drop => "drop",
    QueueDrop => "queueDrop",
    Throw => "throw",
});

string_enum!(DataDistribution {
    Copy => "copy",
    Shared => "shared",
});

string_enum!(DistributionMode {
    RoundRobin => "round-robin",
    LoadBalanced => "load-balanced",
});

fn parsed<T: FromStr<Err = KaraboError>>(node: &Hash, key: &str, default: T) -> Result<T> {
    match node.get::<String>(key) {
        Ok(text) => text.parse(),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputChannelConfig {
    /// Interface to bind; `default` binds all and advertises the host name.
    pub hostname: String,
    pub port: u16,
    pub distribution_mode: DistributionMode,
}

impl Default for OutputChannelConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: 0,
            distribution_mode: DistributionMode::default(),
        }
    }
}

impl OutputChannelConfig {
    /// Read from a channel node; missing keys keep their defaults.
    pub fn from_hash(node: &Hash) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            hostname: node.get::<String>("hostname").unwrap_or(defaults.hostname),
            port: node
                .get_as::<u32>("port")
                .ok()
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(defaults.port),
            distribution_mode: parsed(node, "distributionMode", defaults.distribution_mode)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputChannelConfig {
    /// Outputs to read from, as `instanceId:channelName`.
    pub connected_output_channels: Vec<String>,
    pub data_distribution: DataDistribution,
    pub on_slowness: OnSlowness,
    pub max_queue_length: usize,
}

impl Default for InputChannelConfig {
    fn default() -> Self {
        Self {
            connected_output_channels: Vec::new(),
            data_distribution: DataDistribution::default(),
            on_slowness: OnSlowness::default(),
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}

impl InputChannelConfig {
    pub fn from_hash(node: &Hash) -> Result<Self> {
        let defaults = Self::default();
        let outputs = node
            .get::<Vec<String>>("connectedOutputChannels")
            .unwrap_or_default()
            .into_iter()
            .filter(|o| !o.is_empty())
            .collect();
        Ok(Self {
            connected_output_channels: outputs,
            data_distribution: parsed(node, "dataDistribution", defaults.data_distribution)?,
            on_slowness: parsed(node, "onSlowness", defaults.on_slowness)?,
            max_queue_length: node
                .get_as::<u32>("maxQueueLength")
                .map_or(defaults.max_queue_length, |n| n as usize)
                .max(1),
        })
    }
}

/// First message of an input on a fresh connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// Id of the input channel, `instanceId:channelName`.
    pub instance_id: String,
    pub memory_location: String,
    pub data_distribution: DataDistribution,
    pub on_slowness: OnSlowness,
    pub max_queue_length: usize,
}

impl Handshake {
    #[must_use]
    pub fn new(instance_id: &str, config: &InputChannelConfig) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            memory_location: "remote".to_string(),
            data_distribution: config.data_distribution,
            on_slowness: config.on_slowness,
            max_queue_length: config.max_queue_length,
        }
    }

    #[must_use]
    pub fn to_hash(&self) -> Hash {
        Hash::new()
            .with("reason", "hello")
            .with("instanceId", self.instance_id.as_str())
            .with("memoryLocation", self.memory_location.as_str())
            .with("dataDistribution", self.data_distribution.as_str())
            .with("onSlowness", self.on_slowness.as_str())
            .with("maxQueueLength", self.max_queue_length as u32)
    }

    pub fn from_hash(message: &Hash) -> Result<Self> {
        let instance_id = message.get::<String>("instanceId")?;
        if instance_id.is_empty() {
            return Err(KaraboError::Protocol("handshake without instanceId".into()));
        }
        let max_queue_length = message.get_as::<u32>("maxQueueLength")? as usize;
        if max_queue_length == 0 {
            return Err(KaraboError::Protocol("maxQueueLength must be positive".into()));
        }
        Ok(Self {
            instance_id,
            memory_location: message
                .get::<String>("memoryLocation")
                .unwrap_or_else(|_| "remote".to_string()),
            data_distribution: message.get::<String>("dataDistribution")?.parse()?,
            on_slowness: message.get::<String>("onSlowness")?.parse()?,
            max_queue_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_names() {
        assert_eq!("queueDrop".parse::<OnSlowness>().unwrap(), OnSlowness::QueueDrop);
        assert_eq!(DistributionMode::LoadBalanced.to_string(), "load-balanced");
        assert!("sometimes".parse::<OnSlowness>().is_err());
    }

    #[test]
    fn test_input_config_from_node() {
        let node = Hash::new()
            .with("connectedOutputChannels", vec!["cam:output", ""])
            .with("onSlowness", "wait")
            .with("dataDistribution", "shared")
            .with("maxQueueLength", 5u32);
        let config = InputChannelConfig::from_hash(&node).unwrap();
        assert_eq!(config.connected_output_channels, vec!["cam:output"]);
        assert_eq!(config.on_slowness, OnSlowness::Wait);
        assert_eq!(config.data_distribution, DataDistribution::Shared);
        assert_eq!(config.max_queue_length, 5);

        let bad = Hash::new().with("onSlowness", "never");
        assert!(InputChannelConfig::from_hash(&bad).is_err());
    }

    #[test]
    fn test_handshake_round_trip_and_rejections() {
        let hs = Handshake::new("proc:input", &InputChannelConfig::default());
        assert_eq!(Handshake::from_hash(&hs.to_hash()).unwrap(), hs);

        let mut zero = hs.to_hash();
        zero.set("maxQueueLength", 0u32);
        assert!(Handshake::from_hash(&zero).is_err());
        assert!(Handshake::from_hash(&Hash::new()).is_err());
    }
}
