//! # Device
//!
//! A [`SignalSlotable`] with a schema-validated configuration, a state and
//! optionally a state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! Device::new ──► start ──► (running) ──► kill
//!   validate        register slots         destroy hook (5 s grace)
//!   config          enter initial state    running slots (5 s grace, then aborted)
//!                   open channels          close channels
//!                   go online              slotDeviceGone to server
//!                   initialize hook        go offline
//! ```
//!
//! Every value written through the device is validated against the
//! effective schema and stamped with the current time and train id; one
//! write produces one `signalChanged` (or `signalStateChanged` when the
//! state or a reconfigurable parameter is part of it).

mod channels;
pub mod class;
pub mod parameters;
mod slots;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use karabo_bus::{Broker, SignalSlotable, SignalSlotableConfig, SlotCall};
use karabo_data::time::TrainClock;
use karabo_data::{
    Epochstamp, FromValue, Hash, KaraboError, Result, Schema, State, Timestamp, ValidationRules,
    Validator, Value,
};
use karabo_pipeline::{InputChannel, OutputChannel};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::fsm::{Fsm, Outcome, ERROR_FOUND};

pub use class::{DeviceClass, DeviceLogic, Effects};
pub use parameters::{class_schema, NO_SERVER};

use parameters::{Parameters, DEFAULT_HEARTBEAT_SECS};

/// How long the destroy hook, and after it any slot still running, may
/// take before the device goes offline anyway.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Handle to a running device. Cheap to clone.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

/// Non-owning handle, used by slot bodies and background tasks.
#[derive(Clone)]
pub struct WeakDevice {
    inner: Weak<DeviceInner>,
}

impl WeakDevice {
    #[must_use]
    pub fn upgrade(&self) -> Option<Device> {
        self.inner.upgrade().map(|inner| Device { inner })
    }
}

struct DeviceInner {
    ss: SignalSlotable,
    device_id: String,
    server_id: String,
    class_id: String,
    logic: Arc<dyn DeviceLogic>,
    params: RwLock<Parameters>,
    fsm: Mutex<Option<Fsm<Effects>>>,
    outputs: RwLock<HashMap<String, Arc<OutputChannel>>>,
    inputs: RwLock<HashMap<String, Arc<InputChannel>>>,
    /// Serializes external reconfiguration and schema injection.
    reconfigure: tokio::sync::Mutex<()>,
    closed: watch::Sender<bool>,
    clock: &'static TrainClock,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.inner.device_id)
            .field("class_id", &self.inner.class_id)
            .field("state", &self.state())
            .finish()
    }
}

fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl Device {
    /// Build a device of `class` from `config`. The configuration must
    /// carry a non-empty `_deviceId_` or `deviceId`.
    pub fn new(class: &dyn DeviceClass, config: Hash, broker: Arc<dyn Broker>) -> Result<Self> {
        Self::with_bus_config(class, config, broker, SignalSlotableConfig::default())
    }

    /// Like [`new`](Self::new) with explicit messaging settings; the
    /// heartbeat interval always comes from the configuration.
    pub fn with_bus_config(
        class: &dyn DeviceClass,
        config: Hash,
        broker: Arc<dyn Broker>,
        bus: SignalSlotableConfig,
    ) -> Result<Self> {
        let schema = class_schema(class)?;
        let clock = TrainClock::global();
        let timestamp = clock.timestamp(Epochstamp::now());
        let mut config = Validator::new(ValidationRules::initialization())
            .with_timestamp(timestamp)
            .validate(&schema, &config)
            .into_result()?;

        let device_id = ["_deviceId_", "deviceId"]
            .iter()
            .filter_map(|key| config.get::<String>(key).ok())
            .find(|id| !id.is_empty())
            .ok_or_else(|| KaraboError::Parse("configuration has no deviceId".into()))?;
        let server_id = config
            .get::<String>("_serverId_")
            .unwrap_or_else(|_| NO_SERVER.to_string());
        let heartbeat = config
            .get_as::<i32>("heartbeatInterval")
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);
        let visibility = config.get_as::<i32>("visibility").unwrap_or(0);

        let fsm = class.state_machine().map(Fsm::new);
        let initial = fsm.as_ref().map_or_else(|| class.initial_state(), Fsm::state);
        let host = local_host();

        let identity = Hash::new()
            .with("deviceId", device_id.as_str())
            .with("serverId", server_id.as_str())
            .with("classId", class.class_id())
            .with("classVersion", class.class_version())
            .with("hostName", host.as_str())
            .with("pid", i32::try_from(std::process::id()).unwrap_or(i32::MAX))
            .with("state", initial.name());
        let identity = Validator::new(ValidationRules::internal())
            .with_timestamp(timestamp)
            .validate(&schema, &identity)
            .into_result()?;
        config.merge(&identity, karabo_data::MergePolicy::ReplaceAttributes);

        let logic = class.create(&config)?;
        let ss = SignalSlotable::new(
            &device_id,
            broker,
            SignalSlotableConfig {
                heartbeat_interval: Duration::from_secs(u64::try_from(heartbeat).unwrap_or(1)),
                ..bus
            },
        );
        ss.set_instance_info(
            &Hash::new()
                .with("type", "device")
                .with("classId", class.class_id())
                .with("serverId", server_id.as_str())
                .with("visibility", visibility)
                .with("host", host.as_str())
                .with("status", "ok"),
        );

        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(DeviceInner {
                ss,
                device_id,
                server_id,
                class_id: class.class_id().to_string(),
                logic,
                params: RwLock::new(Parameters::new(schema, config)),
                fsm: Mutex::new(fsm),
                outputs: RwLock::new(HashMap::new()),
                inputs: RwLock::new(HashMap::new()),
                reconfigure: tokio::sync::Mutex::new(()),
                closed,
                clock,
            }),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the device online.
    ///
    /// Fails with `Fatal` when the id is taken; an error of the
    /// `initialize` hook only moves the device to `ERROR`.
    pub async fn start(&self) -> Result<()> {
        self.register_builtin_slots();
        Arc::clone(&self.inner.logic).register(self)?;
        self.start_state_machine().await?;
        self.open_channels().await?;
        if let Err(e) = self.inner.ss.start().await {
            self.close_channels();
            return Err(e);
        }
        self.spawn_topology_watch();
        info!(
            device_id = %self.inner.device_id,
            class_id = %self.inner.class_id,
            state = %self.state(),
            "Device online"
        );

        if let Err(e) = self.inner.logic.initialize(self).await {
            self.error_found("Initialization failed", &e.to_string()).await;
        }
        Ok(())
    }

    async fn start_state_machine(&self) -> Result<()> {
        let started = {
            let mut guard = self.inner.fsm.lock();
            guard.as_mut().map(|fsm| {
                let mut effects = Effects::new();
                let result = fsm.start(&mut effects);
                (result, effects)
            })
        };
        let Some((result, effects)) = started else {
            return Ok(());
        };
        match result {
            Ok(state) => self.update_state_with(state, effects.into_hash()).await,
            Err(e) => {
                self.error_found("State machine failed to start", &e.to_string())
                    .await;
                Ok(())
            }
        }
    }

    /// Take the device offline. Idempotent.
    pub async fn kill(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        info!(device_id = %self.inner.device_id, "Device shutting down");
        if tokio::time::timeout(KILL_GRACE, self.inner.logic.destroy(self))
            .await
            .is_err()
        {
            warn!(device_id = %self.inner.device_id, "Destroy hook did not finish in time");
        }
        self.inner.ss.drain_slots(KILL_GRACE).await;
        self.close_channels();
        if self.inner.server_id != NO_SERVER && !self.inner.server_id.is_empty() {
            if let Err(e) = self
                .inner
                .ss
                .call(
                    &self.inner.server_id,
                    "slotDeviceGone",
                    (self.inner.device_id.clone(),),
                )
                .await
            {
                warn!(device_id = %self.inner.device_id, error = %e, "Could not notify server");
            }
        }
        self.inner.ss.stop().await;
    }

    /// Kill from inside a slot body, where awaiting the shutdown would
    /// wait on the body itself.
    pub(crate) fn spawn_kill(&self) {
        let device = self.clone();
        tokio::spawn(async move { device.kill().await });
    }

    /// Resolves once [`kill`](Self::kill) has started.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    // =========================================================================
    // Identity
    // =========================================================================

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    #[must_use]
    pub fn class_id(&self) -> &str {
        &self.inner.class_id
    }

    #[must_use]
    pub fn signal_slotable(&self) -> &SignalSlotable {
        &self.inner.ss
    }

    /// True when both handles refer to the same device instance.
    #[must_use]
    pub fn same_instance(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakDevice {
        WeakDevice {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Now, with the train id extrapolated from the last time tick.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.inner.clock.timestamp(Epochstamp::now())
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn get<T: FromValue>(&self, key: &str) -> Result<T> {
        self.inner.params.read().config.get(key)
    }

    pub fn get_as<T: FromValue>(&self, key: &str) -> Result<T> {
        self.inner.params.read().config.get_as(key)
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn configuration(&self) -> Hash {
        self.inner.params.read().config.clone()
    }

    #[must_use]
    pub fn configuration_slice(&self, paths: &[String]) -> Hash {
        self.inner.params.read().slice(paths)
    }

    /// Static schema with everything injected so far.
    #[must_use]
    pub fn full_schema(&self) -> Schema {
        self.inner.params.read().full.clone()
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.get::<String>("state")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(State::Unknown)
    }

    /// Write one value.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.set_hash(Hash::new().with(key, value)).await
    }

    /// Write several values as one change.
    pub async fn set_hash(&self, changes: Hash) -> Result<()> {
        let report = {
            let params = self.inner.params.read();
            Validator::new(ValidationRules::internal())
                .with_timestamp(self.timestamp())
                .validate(&params.full, &changes)
        };
        let reconfigurable = report.has_reconfigurable_parameter();
        self.publish(report.into_result()?, reconfigurable).await
    }

    pub async fn set_status(&self, status: &str) -> Result<()> {
        self.set("status", status).await
    }

    pub async fn update_state(&self, state: State) -> Result<()> {
        self.update_state_with(state, Hash::new()).await
    }

    /// Change the state together with other values.
    pub async fn update_state_with(&self, state: State, mut changes: Hash) -> Result<()> {
        changes.set("state", state.name());
        self.set_hash(changes).await
    }

    /// Apply already validated changes and tell the world.
    async fn publish(&self, changes: Hash, reconfigurable: bool) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.inner.params.write().apply(&changes);
        let signal = if reconfigurable || changes.has("state") {
            "signalStateChanged"
        } else {
            "signalChanged"
        };
        self.inner
            .ss
            .emit(signal, (changes, self.inner.device_id.clone()))
            .await
    }

    // =========================================================================
    // State machine
    // =========================================================================

    /// Offer `event` to the state machine. Returns the state afterwards.
    ///
    /// A failing action leaves the device in `ERROR` with the failure as
    /// status, and returns it.
    pub async fn process_event(&self, event: &str, args: &Hash) -> Result<State> {
        let (result, state, effects) = {
            let mut guard = self.inner.fsm.lock();
            let Some(fsm) = guard.as_mut() else {
                return Err(KaraboError::NotFound(format!(
                    "{} has no state machine",
                    self.inner.device_id
                )));
            };
            let mut effects = Effects::new();
            let result = fsm.process(event, args, &mut effects);
            (result, fsm.state(), effects)
        };
        let mut changes = effects.into_hash();
        match &result {
            Ok(Outcome::Transitioned { .. }) => {
                changes.set("state", state.name());
            }
            Ok(Outcome::NoTransition { .. }) => {}
            Err(e) => {
                changes.set("state", state.name());
                changes.set("status", e.to_string());
            }
        }
        if !changes.is_empty() {
            self.set_hash(changes).await?;
        }
        result.map(|_| state)
    }

    /// Move to `ERROR` (through the state machine when there is one) and
    /// show `short` as status.
    pub async fn error_found(&self, short: &str, detailed: &str) {
        error!(
            device_id = %self.inner.device_id,
            short = short,
            detailed = detailed,
            "Error found"
        );
        {
            let mut guard = self.inner.fsm.lock();
            if let Some(fsm) = guard.as_mut() {
                let args = Hash::new().with("a1", short).with("a2", detailed);
                if let Err(e) = fsm.process(ERROR_FOUND, &args, &mut Effects::new()) {
                    warn!(
                        device_id = %self.inner.device_id,
                        error = %e,
                        "State machine refused errorFound"
                    );
                }
            }
        }
        let changes = Hash::new().with("status", short);
        if let Err(e) = self.update_state_with(State::Error, changes).await {
            warn!(device_id = %self.inner.device_id, error = %e, "Could not publish ERROR state");
        }
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// Register a slot of the device.
    ///
    /// Before `handler` runs, the call is checked against the slot's
    /// `allowedStates` and required access level in the effective schema
    /// and against the device lock; a refused call fails with
    /// `DisallowedState` and changes nothing. Admitted calls are recorded
    /// in `lastCommand`.
    pub fn register_slot<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Device, SlotCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Hash>> + Send + 'static,
    {
        let weak = self.downgrade();
        let handler = Arc::new(handler);
        let slot = name.to_string();
        self.inner.ss.register_slot(name, move |call: SlotCall| {
            let weak = weak.clone();
            let handler = Arc::clone(&handler);
            let slot = slot.clone();
            async move {
                let device = weak
                    .upgrade()
                    .ok_or_else(|| KaraboError::Canceled("device is gone".into()))?;
                device.admit(&slot, &call)?;
                device
                    .set("lastCommand", format!("{slot} <- {}", call.caller))
                    .await?;
                let result = handler(device.clone(), call).await;
                if let Err(KaraboError::Fatal(detail)) = &result {
                    error!(device_id = %device.device_id(), slot = %slot, detail = %detail, "Fatal error in slot");
                    device.spawn_kill();
                }
                result
            }
        });
    }

    fn admit(&self, slot: &str, call: &SlotCall) -> Result<()> {
        let state = self.state();
        let params = self.inner.params.read();
        let allowed = params.full.allowed_states(slot);
        if !state.is_allowed_by(&allowed) {
            return Err(KaraboError::DisallowedState(format!(
                "{slot} is not allowed in state {state} (allowed: {})",
                allowed.join(",")
            )));
        }
        let required = params.full.required_access_level(slot);
        if call.access_level() < required {
            return Err(KaraboError::DisallowedState(format!(
                "{slot} requires access level {required:?}"
            )));
        }
        let locked_by = params.config.get::<String>("lockedBy").unwrap_or_default();
        if !locked_by.is_empty() && locked_by != call.caller {
            return Err(KaraboError::DisallowedState(format!(
                "{} is locked by {locked_by}",
                self.inner.device_id
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Schema injection
    // =========================================================================

    /// Merge `schema` into the effective schema. Existing values stay.
    pub async fn append_schema(&self, schema: &Schema) -> Result<()> {
        let _serial = self.inner.reconfigure.lock().await;
        let added = self.inner.params.write().append(schema, self.timestamp());
        self.schema_changed(added).await
    }

    /// Replace everything injected before by `schema`.
    pub async fn update_schema(&self, schema: &Schema) -> Result<()> {
        let _serial = self.inner.reconfigure.lock().await;
        let added = self
            .inner
            .params
            .write()
            .replace_injected(schema, self.timestamp());
        self.schema_changed(added).await
    }

    async fn schema_changed(&self, added: Hash) -> Result<()> {
        let full = self.full_schema();
        self.sync_channels().await?;
        self.inner
            .ss
            .emit(
                "signalSchemaUpdated",
                (full, self.inner.device_id.clone()),
            )
            .await?;
        self.publish(added, false).await
    }
}
