//! Extension points of a device class.

use std::sync::Arc;

use async_trait::async_trait;
use karabo_data::time::TimeTick;
use karabo_data::{Hash, Result, Schema, State, Value};
use karabo_pipeline::{ChunkMeta, Payload};

use super::Device;
use crate::fsm::Machine;

/// Changes collected by state-machine actions while an event is processed.
///
/// The device applies them together with the new state, so one event
/// produces one `signalStateChanged`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    changes: Hash,
    status: Option<String>,
}

impl Effects {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a property update.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.changes.set(key, value);
    }

    pub fn set_status(&mut self, status: &str) {
        self.status = Some(status.to_string());
    }

    #[must_use]
    pub fn changes(&self) -> &Hash {
        &self.changes
    }

    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.status.is_none()
    }

    /// Everything queued, `status` included.
    #[must_use]
    pub fn into_hash(self) -> Hash {
        let mut hash = self.changes;
        if let Some(status) = self.status {
            hash.set("status", status);
        }
        hash
    }
}

/// Static description of a device class, registered with the server.
pub trait DeviceClass: Send + Sync + 'static {
    fn class_id(&self) -> &str;

    fn class_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Declare the class's own parameters on top of the common ones.
    fn expected_parameters(&self, schema: &mut Schema) -> Result<()>;

    /// Optional state machine; when present its initial state wins over
    /// [`initial_state`](Self::initial_state).
    fn state_machine(&self) -> Option<Machine<Effects>> {
        None
    }

    fn initial_state(&self) -> State {
        State::Unknown
    }

    /// Instantiate the behavior of one device from its validated
    /// configuration.
    fn create(&self, config: &Hash) -> Result<Arc<dyn DeviceLogic>>;
}

/// Behavior of one device instance. Every hook has a no-op default.
#[async_trait]
pub trait DeviceLogic: Send + Sync + 'static {
    /// Register the device's own slots. Runs before the device goes online.
    fn register(self: Arc<Self>, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Runs once the device is online. An error moves it to `ERROR`.
    async fn initialize(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Sees (and may edit) the validated part of an external
    /// reconfiguration before it is applied. An error rejects all of it.
    async fn pre_reconfigure(&self, _device: &Device, _incoming: &mut Hash) -> Result<()> {
        Ok(())
    }

    async fn post_reconfigure(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// One chunk arrived on input channel `channel`.
    async fn on_data(
        &self,
        _device: &Device,
        _channel: &str,
        _items: Vec<(Payload, ChunkMeta)>,
    ) -> Result<()> {
        Ok(())
    }

    /// Every output connected to `channel` ended its stream.
    async fn on_end_of_stream(&self, _device: &Device, _channel: &str) -> Result<()> {
        Ok(())
    }

    async fn on_time_update(&self, _device: &Device, _tick: TimeTick) {}

    /// Cleanup before the device goes offline. Bounded by a grace period.
    async fn destroy(&self, _device: &Device) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effects_fold_status_into_changes() {
        let mut effects = Effects::new();
        assert!(effects.is_empty());
        effects.set("speed", 3i32);
        effects.set_status("moving");
        let hash = effects.into_hash();
        assert_eq!(hash.get::<i32>("speed").unwrap(), 3);
        assert_eq!(hash.get::<String>("status").unwrap(), "moving");
    }
}
