//! Pipeline channels declared in a device's schema.

use std::collections::HashSet;
use std::sync::Arc;

use karabo_bus::InstanceEvent;
use karabo_data::schema::attr;
use karabo_data::schema::elements::{INPUT_CHANNEL_DISPLAY_TYPE, OUTPUT_CHANNEL_DISPLAY_TYPE};
use karabo_data::{Hash, KaraboError, Result, Schema, Timestamp};
use karabo_pipeline::{
    ChannelResolver, ChunkMeta, InputChannel, InputChannelConfig, InputEvent, OutputChannel,
    OutputChannelConfig, Payload,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::{Device, WeakDevice};

/// Paths of the nodes whose `displayType` is `display_type`.
pub(crate) fn channel_paths(schema: &Schema, display_type: &str) -> Vec<String> {
    let mut out = Vec::new();
    collect(schema.parameters(), "", display_type, &mut out);
    out
}

fn collect(hash: &Hash, prefix: &str, display_type: &str, out: &mut Vec<String>) {
    for node in hash {
        let path = if prefix.is_empty() {
            node.key().to_string()
        } else {
            format!("{prefix}.{}", node.key())
        };
        let is_channel = node
            .get_attribute::<String>(attr::DISPLAY_TYPE)
            .is_ok_and(|d| d == display_type);
        if is_channel {
            out.push(path);
        } else if let Some(children) = node.value().as_hash() {
            collect(children, &path, display_type, out);
        }
    }
}

impl Device {
    /// Output channel `name`, if the schema declares one.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<Arc<OutputChannel>> {
        self.inner.outputs.read().get(name).cloned()
    }

    #[must_use]
    pub fn input(&self, name: &str) -> Option<Arc<InputChannel>> {
        self.inner.inputs.read().get(name).cloned()
    }

    fn require_output(&self, name: &str) -> Result<Arc<OutputChannel>> {
        self.output(name).ok_or_else(|| {
            KaraboError::NotFound(format!("{} has no output channel {name}", self.device_id()))
        })
    }

    /// Write `payload` to output `name` and send it as one chunk,
    /// stamped with the current time and train id.
    pub async fn write_channel(&self, name: &str, payload: impl Into<Payload>) -> Result<()> {
        let output = self.require_output(name)?;
        let source = format!("{}:{name}", self.device_id());
        output
            .write_chunk(payload, ChunkMeta::new(&source, self.timestamp()))
            .await
    }

    /// Write with an explicit timestamp; sent with the next
    /// [`update_channel`](Self::update_channel).
    pub fn write_channel_at(
        &self,
        name: &str,
        payload: impl Into<Payload>,
        timestamp: Timestamp,
    ) -> Result<()> {
        let output = self.require_output(name)?;
        let source = format!("{}:{name}", self.device_id());
        output.write(payload, ChunkMeta::new(&source, timestamp));
        Ok(())
    }

    pub async fn update_channel(&self, name: &str) -> Result<()> {
        self.require_output(name)?.update().await
    }

    pub async fn signal_end_of_stream(&self, name: &str) -> Result<()> {
        self.require_output(name)?.signal_end_of_stream().await
    }

    /// Create the channels the schema declares and the device does not
    /// have yet.
    pub(super) async fn open_channels(&self) -> Result<()> {
        let (full, config) = {
            let params = self.inner.params.read();
            (params.full.clone(), params.config.clone())
        };

        for path in channel_paths(&full, OUTPUT_CHANNEL_DISPLAY_TYPE) {
            if self.inner.outputs.read().contains_key(&path) {
                continue;
            }
            let settings = config.get_hash(&path).cloned().unwrap_or_default();
            let output = OutputChannel::bind(
                &format!("{}:{path}", self.device_id()),
                OutputChannelConfig::from_hash(&settings)?,
            )
            .await?;
            self.inner.ss.register_channel(&path, output.info());
            info!(device_id = %self.device_id(), channel = %path, addr = %output.local_addr(), "Output channel open");
            self.inner.outputs.write().insert(path, Arc::new(output));
        }

        for path in channel_paths(&full, INPUT_CHANNEL_DISPLAY_TYPE) {
            if self.inner.inputs.read().contains_key(&path) {
                continue;
            }
            let settings = config.get_hash(&path).cloned().unwrap_or_default();
            let resolver: Arc<dyn ChannelResolver> = Arc::new(self.inner.ss.downgrade());
            let input = Arc::new(InputChannel::open(
                &format!("{}:{path}", self.device_id()),
                InputChannelConfig::from_hash(&settings)?,
                resolver,
            ));
            info!(device_id = %self.device_id(), channel = %path, "Input channel open");
            self.inner.inputs.write().insert(path.clone(), Arc::clone(&input));
            tokio::spawn(read_input(self.downgrade(), path.clone(), Arc::clone(&input)));
            tokio::spawn(watch_connections(self.downgrade(), path, input));
        }
        Ok(())
    }

    /// Open newly declared channels, close those the schema dropped.
    pub(super) async fn sync_channels(&self) -> Result<()> {
        let full = self.full_schema();
        let outputs: HashSet<String> = channel_paths(&full, OUTPUT_CHANNEL_DISPLAY_TYPE)
            .into_iter()
            .collect();
        let inputs: HashSet<String> = channel_paths(&full, INPUT_CHANNEL_DISPLAY_TYPE)
            .into_iter()
            .collect();

        let gone_outputs: Vec<_> = {
            let mut map = self.inner.outputs.write();
            let stale: Vec<String> = map.keys().filter(|k| !outputs.contains(*k)).cloned().collect();
            stale.into_iter().filter_map(|k| map.remove(&k).map(|o| (k, o))).collect()
        };
        for (name, output) in gone_outputs {
            output.close();
            self.inner.ss.unregister_channel(&name);
            info!(device_id = %self.device_id(), channel = %name, "Output channel closed");
        }
        let gone_inputs: Vec<_> = {
            let mut map = self.inner.inputs.write();
            let stale: Vec<String> = map.keys().filter(|k| !inputs.contains(*k)).cloned().collect();
            stale.into_iter().filter_map(|k| map.remove(&k)).collect()
        };
        for input in gone_inputs {
            input.close();
        }

        self.open_channels().await
    }

    pub(super) fn close_channels(&self) {
        let outputs: Vec<_> = self.inner.outputs.write().drain().collect();
        for (name, output) in outputs {
            output.close();
            self.inner.ss.unregister_channel(&name);
        }
        let inputs: Vec<_> = self.inner.inputs.write().drain().collect();
        for (_, input) in inputs {
            input.close();
        }
    }

    /// Follow changes of `connectedOutputChannels` in an applied
    /// reconfiguration.
    pub(super) fn reconnect_inputs(&self, changes: &Hash) {
        let inputs: Vec<(String, Arc<InputChannel>)> = self
            .inner
            .inputs
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        for (name, input) in inputs {
            let key = format!("{name}.connectedOutputChannels");
            let Ok(wanted) = changes.get::<Vec<String>>(&key) else {
                continue;
            };
            let current = input.connected_outputs();
            for output in current.iter().filter(|o| !wanted.contains(o)) {
                input.disconnect_output(output);
            }
            for output in wanted.iter().filter(|o| !current.contains(o)) {
                input.connect_output(output);
            }
            debug!(device_id = %self.device_id(), channel = %name, outputs = ?wanted, "Input reconnected");
        }
    }

    /// Wake inputs waiting for an instance that just appeared.
    pub(super) fn spawn_topology_watch(&self) {
        let weak = self.downgrade();
        let mut events = self.inner.ss.subscribe_events();
        let mut closed = self.inner.closed.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = closed.changed() => return,
                };
                match event {
                    Ok(InstanceEvent::New { instance_id, .. }) => {
                        let Some(device) = weak.upgrade() else {
                            return;
                        };
                        for input in device.inner.inputs.read().values() {
                            input.wake(&instance_id);
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }
}

async fn read_input(device: WeakDevice, channel: String, input: Arc<InputChannel>) {
    while let Some(event) = input.read().await {
        let Some(device) = device.upgrade() else {
            return;
        };
        let logic = Arc::clone(&device.inner.logic);
        let result = match event {
            InputEvent::Data { items, .. } => logic.on_data(&device, &channel, items).await,
            InputEvent::EndOfStream => {
                let respond = device
                    .get::<bool>(&format!("{channel}.respondToEndOfStream"))
                    .unwrap_or(true);
                if respond {
                    logic.on_end_of_stream(&device, &channel).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            warn!(device_id = %device.device_id(), channel = %channel, error = %e, "Input handler failed");
        }
    }
    debug!(channel = %channel, "Input reader finished");
}

/// Keep `<channel>.missingConnections` current.
async fn watch_connections(device: WeakDevice, channel: String, input: Arc<InputChannel>) {
    let mut changes = input.connection_changes();
    let key = format!("{channel}.missingConnections");
    let mut last: Option<Vec<String>> = None;
    loop {
        if input.is_closed() {
            return;
        }
        let Some(device) = device.upgrade() else {
            return;
        };
        let missing = input.missing_connections();
        if last.as_ref() != Some(&missing) {
            if let Err(e) = device.set(&key, missing.clone()).await {
                debug!(channel = %channel, error = %e, "missingConnections not updated");
            }
            last = Some(missing);
        }
        let mut closed = device.inner.closed.subscribe();
        drop(device);
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = closed.wait_for(|c| *c) => return,
        }
    }
}
