//! Looking up where an output channel listens.

use std::collections::HashMap;

use async_trait::async_trait;
use karabo_bus::{SignalSlotable, WeakSignalSlotable};
use karabo_data::{Hash, KaraboError, Result};
use parking_lot::RwLock;

/// Finds the connection info of an output channel.
#[async_trait]
pub trait ChannelResolver: Send + Sync + 'static {
    /// Info of `output_id` (`instanceId:channelName`), with at least
    /// `hostname` and `port`.
    async fn resolve(&self, output_id: &str) -> Result<Hash>;
}

/// Split `instanceId:channelName` at the last colon.
pub fn split_channel_id(channel_id: &str) -> Result<(&str, &str)> {
    match channel_id.rsplit_once(':') {
        Some((instance, channel)) if !instance.is_empty() && !channel.is_empty() => {
            Ok((instance, channel))
        }
        _ => Err(KaraboError::Parse(format!(
            "'{channel_id}' is not of the form instanceId:channelName"
        ))),
    }
}

/// Fixed table of outputs, for tests and tools without a broker.
#[derive(Debug, Default)]
pub struct StaticResolver {
    outputs: RwLock<HashMap<String, Hash>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, output_id: &str, info: Hash) {
        self.outputs.write().insert(output_id.to_string(), info);
    }

    pub fn remove(&self, output_id: &str) -> Option<Hash> {
        self.outputs.write().remove(output_id)
    }
}

#[async_trait]
impl ChannelResolver for StaticResolver {
    async fn resolve(&self, output_id: &str) -> Result<Hash> {
        self.outputs
            .read()
            .get(output_id)
            .cloned()
            .ok_or_else(|| KaraboError::NotFound(format!("output channel {output_id}")))
    }
}

#[async_trait]
impl ChannelResolver for SignalSlotable {
    async fn resolve(&self, output_id: &str) -> Result<Hash> {
        let (instance, channel) = split_channel_id(output_id)?;
        let (found, info) = self
            .request(instance, "slotGetOutputChannelInformation", (channel.to_string(),))
            .receive::<(bool, Hash)>()
            .await?;
        if found {
            Ok(info)
        } else {
            Err(KaraboError::NotFound(format!("output channel {output_id}")))
        }
    }
}

#[async_trait]
impl ChannelResolver for WeakSignalSlotable {
    async fn resolve(&self, output_id: &str) -> Result<Hash> {
        match self.upgrade() {
            Some(ss) => ss.resolve(output_id).await,
            None => Err(KaraboError::Canceled("instance is gone".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_channel_id() {
        assert_eq!(split_channel_id("SA1/CAM:output").unwrap(), ("SA1/CAM", "output"));
        assert_eq!(split_channel_id("a:b:c").unwrap(), ("a:b", "c"));
        assert!(split_channel_id("output").is_err());
        assert!(split_channel_id("cam:").is_err());
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new();
        resolver.insert("cam:output", Hash::new().with("port", 4000u32));
        assert_eq!(
            resolver.resolve("cam:output").await.unwrap().get::<u32>("port").unwrap(),
            4000
        );
        assert!(matches!(
            resolver.resolve("cam:other").await,
            Err(KaraboError::NotFound(_))
        ));
    }
}
