//! # Device Server
//!
//! Hosts devices of the classes in its [`DeviceRegistry`].
//!
//! ## Slots
//!
//! | Slot | Arguments | Reply |
//! |------|-----------|-------|
//! | `slotStartDevice` | classId, deviceId, configuration | (ok, message) |
//! | `slotKillDevice` | deviceId | () |
//! | `slotKillServer` | | () |
//! | `slotGetClassSchema` | classId | (schema, classId, serverId) |
//! | `slotDeviceGone` | deviceId | () |
//! | `slotTimeTick` | id, sec, frac, period | () |
//!
//! Starting and killing require the caller's access level to be at least
//! the server's `visibility`.
//!
//! Every device runs in a child task that lives until the device is
//! killed. When a child task ends any other way while the device is still
//! announced, the server stops it so `slotInstanceGone` goes out.

pub mod config;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use karabo_bus::{reply, Broker, SignalSlotable, SignalSlotableConfig, SlotCall};
use karabo_data::time::{TimeTick, TrainClock};
use karabo_data::{Hash, KaraboError, Result, Schema};
use parking_lot::RwLock;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::device::Device;
use crate::plugins;
use crate::registry::DeviceRegistry;

pub use config::{ServerConfig, SERVER_CLASS_ID};

/// Handle to a device server. Cheap to clone.
#[derive(Clone)]
pub struct DeviceServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    ss: SignalSlotable,
    config: ServerConfig,
    registry: Arc<DeviceRegistry>,
    broker: Arc<dyn Broker>,
    bus: SignalSlotableConfig,
    children: RwLock<HashMap<String, Device>>,
    next_index: AtomicU64,
    stopping: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl std::fmt::Debug for DeviceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceServer")
            .field("server_id", &self.inner.config.server_id)
            .field("devices", &self.device_ids())
            .finish()
    }
}

impl DeviceServer {
    pub fn new(config: ServerConfig, registry: Arc<DeviceRegistry>, broker: Arc<dyn Broker>) -> Self {
        Self::with_bus_config(config, registry, broker, SignalSlotableConfig::default())
    }

    /// `bus` applies to the server and to every device it starts; the
    /// server's heartbeat interval comes from `config`.
    pub fn with_bus_config(
        config: ServerConfig,
        registry: Arc<DeviceRegistry>,
        broker: Arc<dyn Broker>,
        bus: SignalSlotableConfig,
    ) -> Self {
        let ss = SignalSlotable::new(
            &config.server_id,
            Arc::clone(&broker),
            SignalSlotableConfig {
                heartbeat_interval: config.heartbeat_interval,
                ..bus.clone()
            },
        );
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                ss,
                config,
                registry,
                broker,
                bus,
                children: RwLock::new(HashMap::new()),
                next_index: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
                stopped,
            }),
        }
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn signal_slotable(&self) -> &SignalSlotable {
        &self.inner.ss
    }

    /// Ids of the devices running here, sorted.
    #[must_use]
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.children.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.inner.children.read().get(device_id).cloned()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load plugins, go online and start the `init` devices.
    ///
    /// Fails when a plugin cannot be loaded or the server id is taken.
    pub async fn start(&self) -> Result<()> {
        let config = &self.inner.config;
        if config.scan_plugins {
            plugins::load(&self.inner.registry, &config.plugin_directory)?;
        }
        if !config.device_classes.is_empty() {
            self.inner.registry.retain(&config.device_classes);
        }
        let classes = self.inner.registry.class_ids();
        self.inner.ss.set_instance_info(
            &Hash::new()
                .with("type", "server")
                .with("serverId", config.server_id.as_str())
                .with("deviceClasses", classes.clone())
                .with("visibility", config.visibility.as_i32())
                .with("status", "ok"),
        );
        self.register_slots();
        self.inner.ss.start().await?;
        info!(server_id = %config.server_id, classes = ?classes, "Device server online");

        if let Some(time_server) = &config.time_server_id {
            match self
                .inner
                .ss
                .connect(time_server, "signalTimeTick", &config.server_id, "slotTimeTick")
                .await
            {
                Ok(true) => info!(time_server = %time_server, "Following time server"),
                Ok(false) => warn!(time_server = %time_server, "Time server has no signalTimeTick"),
                Err(e) => warn!(time_server = %time_server, error = %e, "Time server not reachable"),
            }
        }

        for node in &config.init {
            let device_id = node.key().to_string();
            let mut device_config = node.value().as_hash().cloned().unwrap_or_default();
            let class_id = device_config.get::<String>("classId").unwrap_or_default();
            device_config.erase("classId");
            if let Err(e) = self.start_device(&class_id, &device_id, device_config).await {
                error!(device_id = %device_id, class_id = %class_id, error = %e, "Auto-start failed");
            }
        }
        Ok(())
    }

    /// Kill every device and go offline. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            self.wait_for_shutdown().await;
            return;
        }
        info!(server_id = %self.server_id(), "Device server shutting down");
        let children: Vec<Device> = self.inner.children.read().values().cloned().collect();
        futures::future::join_all(children.iter().map(|d| d.kill())).await;
        self.inner.children.write().clear();
        self.inner.ss.stop().await;
        self.inner.stopped.send_replace(true);
        info!(server_id = %self.server_id(), "Device server stopped");
    }

    /// Resolves once a [`shutdown`](Self::shutdown) has completed.
    pub async fn wait_for_shutdown(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        let _ = stopped.wait_for(|s| *s).await;
    }

    fn downgrade(&self) -> Weak<ServerInner> {
        Arc::downgrade(&self.inner)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Validate, construct and start a device. An empty `device_id` gets a
    /// generated one. Returns the id once the device is online.
    pub async fn start_device(&self, class_id: &str, device_id: &str, mut config: Hash) -> Result<String> {
        let class = self
            .inner
            .registry
            .get(class_id)
            .ok_or_else(|| KaraboError::NotFound(format!("device class {class_id}")))?;
        let device_id = if device_id.is_empty() {
            let n = self.inner.next_index.fetch_add(1, Ordering::Relaxed);
            format!("{}_{class_id}_{n}", self.server_id())
        } else {
            device_id.to_string()
        };
        config.set("_deviceId_", device_id.as_str());
        config.set("_serverId_", self.server_id());
        if !config.has("heartbeatInterval") {
            let secs = i32::try_from(self.inner.config.heartbeat_interval.as_secs()).unwrap_or(i32::MAX);
            config.set("heartbeatInterval", secs);
        }
        let device = Device::with_bus_config(
            class.as_ref(),
            config,
            Arc::clone(&self.inner.broker),
            self.inner.bus.clone(),
        )?;
        {
            let mut children = self.inner.children.write();
            if children.contains_key(&device_id) {
                return Err(KaraboError::Fatal(format!("{device_id} already runs on this server")));
            }
            children.insert(device_id.clone(), device.clone());
        }

        let (started_tx, started_rx) = oneshot::channel();
        let running = device.clone();
        let child = tokio::spawn(async move {
            let result = running.start().await;
            let online = result.is_ok();
            let _ = started_tx.send(result);
            if online {
                running.closed().await;
            }
        });
        let server = self.downgrade();
        let watched = device.clone();
        tokio::spawn(async move {
            let lost = child.await.is_err();
            if let Some(inner) = server.upgrade() {
                DeviceServer { inner }.child_finished(&watched, lost).await;
            }
        });

        match started_rx.await {
            Ok(Ok(())) => {
                info!(device_id = %device_id, class_id = %class_id, "Device started");
                Ok(device_id)
            }
            Ok(Err(e)) => {
                self.forget(&device);
                Err(e)
            }
            Err(_) => {
                self.forget(&device);
                Err(KaraboError::Fatal(format!("{device_id} died while starting")))
            }
        }
    }

    /// Drop `device` from the children unless its id was reused since.
    fn forget(&self, device: &Device) {
        let mut children = self.inner.children.write();
        if children
            .get(device.device_id())
            .is_some_and(|current| current.same_instance(device))
        {
            children.remove(device.device_id());
        }
    }

    /// Kill a device of this server, or ask another instance to.
    pub async fn kill_device(&self, device_id: &str) -> Result<()> {
        let local = self.inner.children.read().get(device_id).cloned();
        match local {
            Some(device) => {
                device.kill().await;
                self.forget(&device);
                Ok(())
            }
            None => {
                info!(device_id = %device_id, "Forwarding kill request");
                self.inner.ss.call(device_id, "slotKillDevice", ()).await
            }
        }
    }

    /// The device's child task ended. A device that is still announced on
    /// the bus was never killed, so stopping it broadcasts
    /// `slotInstanceGone` on its behalf.
    async fn child_finished(&self, device: &Device, lost: bool) {
        self.forget(device);
        let ss = device.signal_slotable();
        if lost {
            warn!(device_id = %device.device_id(), "Device task died");
        }
        if ss.is_running() {
            warn!(device_id = %device.device_id(), "Device ended without being killed");
            ss.stop().await;
        }
    }

    pub fn class_schema(&self, class_id: &str) -> Result<Schema> {
        self.inner.registry.class_schema(class_id)
    }

    // =========================================================================
    // Slots
    // =========================================================================

    fn check_visibility(&self, call: &SlotCall) -> Result<()> {
        let required = self.inner.config.visibility;
        if call.access_level() < required {
            return Err(KaraboError::DisallowedState(format!(
                "{} requires access level {required:?}",
                call.slot
            )));
        }
        Ok(())
    }

    fn slot<F, Fut>(&self, name: &str, body: F)
    where
        F: Fn(DeviceServer, SlotCall) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Hash>> + Send + 'static,
    {
        let server = self.downgrade();
        self.inner.ss.register_slot(name, move |call| {
            let fut = server.upgrade().map(|inner| body(DeviceServer { inner }, call));
            async move {
                match fut {
                    Some(fut) => fut.await,
                    None => Err(KaraboError::Canceled("server is gone".into())),
                }
            }
        });
    }

    fn register_slots(&self) {
        self.slot("slotStartDevice", |server, call| async move {
            server.check_visibility(&call)?;
            let (class_id, device_id, config) = call.args::<(String, String, Hash)>()?;
            match server.start_device(&class_id, &device_id, config).await {
                Ok(id) => reply((true, id)),
                Err(e) => {
                    warn!(class_id = %class_id, device_id = %device_id, error = %e, "Device start failed");
                    reply((false, e.to_string()))
                }
            }
        });

        self.slot("slotKillDevice", |server, call| async move {
            server.check_visibility(&call)?;
            let (device_id,) = call.args::<(String,)>()?;
            server.kill_device(&device_id).await?;
            reply(())
        });

        self.slot("slotKillServer", |server, call| async move {
            server.check_visibility(&call)?;
            info!(server_id = %server.server_id(), caller = %call.caller, "Kill server requested");
            tokio::spawn(async move { server.shutdown().await });
            reply(())
        });

        self.slot("slotGetClassSchema", |server, call| async move {
            let (class_id,) = call.args::<(String,)>()?;
            let schema = server.class_schema(&class_id)?;
            reply((schema, class_id, server.server_id().to_string()))
        });

        self.slot("slotDeviceGone", |server, call| async move {
            let (device_id,) = call.args::<(String,)>()?;
            if server.inner.children.write().remove(&device_id).is_some() {
                info!(device_id = %device_id, "Device gone");
            }
            reply(())
        });

        self.slot("slotTimeTick", |server, call| async move {
            let (train_id, sec, frac, period_us) = call.args::<(u64, u64, u64, u64)>()?;
            TrainClock::global().tick(TimeTick {
                train_id,
                sec,
                frac,
                period_us,
            });
            for device_id in server.device_ids() {
                server
                    .inner
                    .ss
                    .call(&device_id, "slotTimeTick", (train_id, sec, frac, period_us))
                    .await?;
            }
            reply(())
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use karabo_bus::InMemoryBroker;
    use karabo_data::schema::elements::Int32Element;
    use karabo_data::AccessLevel;

    use super::*;
    use crate::device::{DeviceClass, DeviceLogic};

    struct Counter;

    struct Idle;

    impl DeviceLogic for Idle {}

    impl DeviceClass for Counter {
        fn class_id(&self) -> &str {
            "Counter"
        }

        fn expected_parameters(&self, schema: &mut Schema) -> Result<()> {
            Int32Element::new(schema)
                .key("count")
                .assignment_optional()
                .default_value(0)
                .reconfigurable()
                .commit()
        }

        fn create(&self, _config: &Hash) -> Result<Arc<dyn DeviceLogic>> {
            Ok(Arc::new(Idle))
        }
    }

    fn quick() -> SignalSlotableConfig {
        SignalSlotableConfig {
            check_uniqueness: false,
            request_timeout: Duration::from_secs(2),
            ..SignalSlotableConfig::default()
        }
    }

    async fn setup(visibility: AccessLevel) -> (DeviceServer, SignalSlotable) {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new("server-tests"));
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(Arc::new(Counter));
        let mut config = ServerConfig::new("srv").unwrap();
        config.scan_plugins = false;
        config.visibility = visibility;
        let server = DeviceServer::with_bus_config(config, registry, Arc::clone(&broker), quick());
        server.start().await.unwrap();
        let client = SignalSlotable::new("client", broker, quick());
        client.start().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_start_device_through_slot() {
        let (server, client) = setup(AccessLevel::Observer).await;
        let (ok, id) = client
            .request(
                "srv",
                "slotStartDevice",
                ("Counter".to_string(), "c1".to_string(), Hash::new().with("count", 4i32)),
            )
            .receive::<(bool, String)>()
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(id, "c1");
        assert_eq!(server.device_ids(), vec!["c1"]);

        let (config, device_id) = client
            .request("c1", "slotGetConfiguration", ())
            .receive::<(Hash, String)>()
            .await
            .unwrap();
        assert_eq!(device_id, "c1");
        assert_eq!(config.get::<String>("serverId").unwrap(), "srv");
        assert_eq!(config.get::<i32>("count").unwrap(), 4);
    }

    #[tokio::test]
    async fn test_start_failures_are_replied() {
        let (server, client) = setup(AccessLevel::Observer).await;
        let (ok, message) = client
            .request("srv", "slotStartDevice", ("Nope".to_string(), String::new(), Hash::new()))
            .receive::<(bool, String)>()
            .await
            .unwrap();
        assert!(!ok);
        assert!(message.contains("Nope"));

        let (ok, _) = client
            .request(
                "srv",
                "slotStartDevice",
                ("Counter".to_string(), "c2".to_string(), Hash::new().with("count", "many")),
            )
            .receive::<(bool, String)>()
            .await
            .unwrap();
        assert!(!ok);
        assert!(server.device_ids().is_empty());
    }

    #[tokio::test]
    async fn test_generated_device_ids() {
        let (server, _client) = setup(AccessLevel::Observer).await;
        let first = server.start_device("Counter", "", Hash::new()).await.unwrap();
        let second = server.start_device("Counter", "", Hash::new()).await.unwrap();
        assert_eq!(first, "srv_Counter_0");
        assert_eq!(second, "srv_Counter_1");
        assert!(server.start_device("Counter", &first, Hash::new()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_reserve_the_id_once() {
        let (server, _client) = setup(AccessLevel::Observer).await;
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let server = server.clone();
                tokio::spawn(async move { server.start_device("Counter", "twin", Hash::new()).await })
            })
            .collect();
        let mut started = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(server.device_ids(), vec!["twin"]);
        assert!(server.device("twin").unwrap().is_alive());
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_device_ending_without_kill_is_announced_gone() {
        let (server, client) = setup(AccessLevel::Observer).await;
        server.start_device("Counter", "c1", Hash::new()).await.unwrap();
        let device = server.device("c1").unwrap();
        assert!(wait_until(|| client.topology().contains("c1")).await);

        server.child_finished(&device, false).await;
        assert!(!device.signal_slotable().is_running());
        assert!(server.device_ids().is_empty());
        assert!(wait_until(|| !client.topology().contains("c1")).await);
    }

    #[tokio::test]
    async fn test_finished_child_leaves_a_reused_id_alone() {
        let (server, _client) = setup(AccessLevel::Observer).await;
        server.start_device("Counter", "c1", Hash::new()).await.unwrap();
        let first = server.device("c1").unwrap();
        server.kill_device("c1").await.unwrap();
        server.start_device("Counter", "c1", Hash::new()).await.unwrap();

        server.child_finished(&first, false).await;
        let second = server.device("c1").unwrap();
        assert!(!second.same_instance(&first));
        assert!(second.signal_slotable().is_running());
    }

    #[tokio::test]
    async fn test_kill_device() {
        let (server, client) = setup(AccessLevel::Observer).await;
        server.start_device("Counter", "c1", Hash::new()).await.unwrap();
        let device = server.device("c1").unwrap();

        client
            .request("srv", "slotKillDevice", ("c1".to_string(),))
            .receive_hash()
            .await
            .unwrap();
        assert!(!device.is_alive());
        assert!(server.device_ids().is_empty());
    }

    #[tokio::test]
    async fn test_visibility_refuses_low_access_levels() {
        let (server, client) = setup(AccessLevel::Expert).await;
        let err = client
            .request("srv", "slotStartDevice", ("Counter".to_string(), "c1".to_string(), Hash::new()))
            .access_level(AccessLevel::User)
            .receive_hash()
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::DisallowedState(_)));
        assert!(server.device_ids().is_empty());

        let (ok, _) = client
            .request("srv", "slotStartDevice", ("Counter".to_string(), "c1".to_string(), Hash::new()))
            .access_level(AccessLevel::Expert)
            .receive::<(bool, String)>()
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_class_schema() {
        let (_server, client) = setup(AccessLevel::Observer).await;
        let (schema, class_id, server_id) = client
            .request("srv", "slotGetClassSchema", ("Counter".to_string(),))
            .receive::<(Schema, String, String)>()
            .await
            .unwrap();
        assert!(schema.has("count"));
        assert!(schema.has("state"));
        assert_eq!((class_id.as_str(), server_id.as_str()), ("Counter", "srv"));

        let err = client
            .request("srv", "slotGetClassSchema", ("Missing".to_string(),))
            .receive_hash()
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_init_devices_and_shutdown() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new("server-tests"));
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(Arc::new(Counter));
        let config = ServerConfig::from_args([
            "serverId=srv",
            "scanPlugins=false",
            r#"init={"a": {"classId": "Counter", "count": 7}, "b": {"classId": "Counter"}}"#,
        ])
        .unwrap();
        let server = DeviceServer::with_bus_config(config, registry, broker, quick());
        server.start().await.unwrap();
        assert_eq!(server.device_ids(), vec!["a", "b"]);
        let a = server.device("a").unwrap();
        assert_eq!(a.get::<i32>("count").unwrap(), 7);

        server.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), server.wait_for_shutdown())
            .await
            .unwrap();
        assert!(!a.is_alive());
        assert!(server.device_ids().is_empty());
        assert!(!server.signal_slotable().is_running());
    }
}
