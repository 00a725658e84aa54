//! # SignalSlotable
//!
//! The RPC and eventing layer every Karabo instance is built on.
//!
//! ## Dispatch
//!
//! ```text
//! broker ──► dispatcher ──┬─► pending replies (__reply__)
//!                         └─► strand[caller] ──► worker permit ──► slot body ──► reply
//! ```
//!
//! One dispatcher task per instance reads the broker subscription. Calls are
//! queued on a strand per caller, so calls from one sender run in the order
//! they were sent, while calls from different senders run concurrently on at
//! most `workers` slot bodies at a time.
//!
//! ## Liveness
//!
//! After [`SignalSlotable::start`] the instance announces itself with
//! `slotInstanceNew`, then broadcasts `signalHeartbeat` every
//! `heartbeat_interval`. Instances silent for three of their intervals are
//! declared gone locally.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture, FutureExt};
use karabo_data::{AccessLevel, Hash, KaraboError, MergePolicy, Result, Value};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::args::{arg, SlotArgs};
use crate::broker::{Broker, Subscription};
use crate::message::{header, Message, BROADCAST, HEARTBEAT_SIGNAL};
use crate::pending::PendingReplies;
use crate::topology::{HeartbeatOutcome, InstanceEvent, Topology};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKERS: usize = 4;

const EVENT_CAPACITY: usize = 256;

/// Boxed future returned by slot bodies.
pub type SlotFuture = BoxFuture<'static, Result<Hash>>;

type SlotHandler = Arc<dyn Fn(SlotCall) -> SlotFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SignalSlotableConfig {
    pub heartbeat_interval: Duration,
    /// Maximum number of slot bodies running at once.
    pub workers: usize,
    pub request_timeout: Duration,
    /// How long the id-uniqueness check waits for an answer.
    pub ping_timeout: Duration,
    pub check_uniqueness: bool,
}

impl Default for SignalSlotableConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            workers: DEFAULT_WORKERS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ping_timeout: Duration::from_millis(300),
            check_uniqueness: true,
        }
    }
}

/// One invocation of a slot.
#[derive(Debug, Clone)]
pub struct SlotCall {
    /// Instance id of the sender.
    pub caller: String,
    pub slot: String,
    pub header: Hash,
    pub body: Hash,
}

impl SlotCall {
    /// Positional arguments.
    pub fn args<A: SlotArgs>(&self) -> Result<A> {
        A::from_body(&self.body)
    }

    /// Access level the caller claims; `Admin` when it claims none.
    #[must_use]
    pub fn access_level(&self) -> AccessLevel {
        self.header
            .get_as::<i32>(header::ACCESS_LEVEL)
            .ok()
            .and_then(AccessLevel::from_i32)
            .unwrap_or(AccessLevel::Admin)
    }
}

/// Reply body for positional return values.
pub fn reply<A: SlotArgs>(values: A) -> Result<Hash> {
    Ok(values.into_body())
}

#[derive(Debug, Clone)]
enum ReplyRoute {
    None,
    Reply { target: String, reply_id: String },
    Function { target: String, slot: String },
}

impl ReplyRoute {
    fn of(message: &Message) -> Self {
        let target = message.sender().to_string();
        if let Ok(slot) = message.header.get::<String>(header::REPLY_FUNCTION) {
            if !slot.is_empty() {
                return Self::Function { target, slot };
            }
        }
        match message.reply_id() {
            Some(id) => Self::Reply {
                target,
                reply_id: id.to_string(),
            },
            None => Self::None,
        }
    }
}

struct Job {
    handler: SlotHandler,
    call: SlotCall,
    route: ReplyRoute,
}

struct Inner {
    instance_id: String,
    broker: Arc<dyn Broker>,
    config: SignalSlotableConfig,
    session_token: String,
    instance_info: RwLock<Hash>,
    slots: RwLock<HashMap<String, SlotHandler>>,
    /// signal -> subscribers `(instance, slot)`
    signals: RwLock<HashMap<String, Vec<(String, String)>>>,
    /// `(signalInstance, signal)` pairs this instance listens to.
    remote_signals: RwLock<HashSet<(String, String)>>,
    channels: RwLock<HashMap<String, Hash>>,
    pending: PendingReplies,
    topology: Topology,
    events: broadcast::Sender<InstanceEvent>,
    workers: Arc<Semaphore>,
    strands: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    /// Slot bodies currently running, by job number.
    active: Mutex<HashMap<u64, AbortHandle>>,
    active_count: watch::Sender<usize>,
    next_job: AtomicU64,
    heartbeat_counter: AtomicU32,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Handle on a SignalSlotable instance. Clones share the instance.
#[derive(Clone)]
pub struct SignalSlotable {
    inner: Arc<Inner>,
}

/// Non-owning handle, for slot bodies that need their own instance.
#[derive(Clone)]
pub struct WeakSignalSlotable {
    inner: Weak<Inner>,
}

impl WeakSignalSlotable {
    #[must_use]
    pub fn upgrade(&self) -> Option<SignalSlotable> {
        self.inner.upgrade().map(|inner| SignalSlotable { inner })
    }
}

impl std::fmt::Debug for SignalSlotable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSlotable")
            .field("instance_id", &self.inner.instance_id)
            .field("topic", &self.inner.broker.topic())
            .finish_non_exhaustive()
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl SignalSlotable {
    /// Create an instance on `broker`. Nothing is sent before [`start`](Self::start).
    #[must_use]
    pub fn new(instance_id: &str, broker: Arc<dyn Broker>, config: SignalSlotableConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let (active_count, _) = watch::channel(0);
        let info = Hash::new()
            .with("type", "client")
            .with("host", local_hostname())
            .with("heartbeatInterval", config.heartbeat_interval.as_secs() as i32);
        let inner = Arc::new(Inner {
            instance_id: instance_id.to_string(),
            broker,
            session_token: Uuid::new_v4().to_string(),
            instance_info: RwLock::new(info),
            slots: RwLock::new(HashMap::new()),
            signals: RwLock::new(HashMap::new()),
            remote_signals: RwLock::new(HashSet::new()),
            channels: RwLock::new(HashMap::new()),
            pending: PendingReplies::new(),
            topology: Topology::new(config.heartbeat_interval),
            events,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            strands: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            active_count,
            next_job: AtomicU64::new(0),
            heartbeat_counter: AtomicU32::new(0),
            running: AtomicBool::new(false),
            shutdown,
            config,
        });
        register_system_slots(&inner);
        Self { inner }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.inner.broker.topic()
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    #[must_use]
    pub fn config(&self) -> &SignalSlotableConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    #[must_use]
    pub fn pending_replies(&self) -> &PendingReplies {
        &self.inner.pending
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSignalSlotable {
        WeakSignalSlotable {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn heartbeat_counter(&self) -> u32 {
        self.inner.heartbeat_counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn instance_info(&self) -> Hash {
        self.inner.info()
    }

    /// Merge `changes` into the instance info without announcing it.
    pub fn set_instance_info(&self, changes: &Hash) {
        self.inner
            .instance_info
            .write()
            .merge(changes, MergePolicy::ReplaceAttributes);
    }

    /// Merge `changes` into the instance info and broadcast
    /// `slotInstanceUpdated` when running.
    pub async fn update_instance_info(&self, changes: &Hash) -> Result<()> {
        self.set_instance_info(changes);
        if !self.is_running() {
            return Ok(());
        }
        let body = (self.inner.instance_id.clone(), self.inner.info()).into_body();
        self.inner
            .publish(Message::broadcast(&self.inner.instance_id, "slotInstanceUpdated", body))
            .await
    }

    /// Local changes in the set of known instances.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.inner.events.subscribe()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register (or replace) the slot `name`.
    pub fn register_slot<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(SlotCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Hash>> + Send + 'static,
    {
        self.inner
            .add_slot(name, Arc::new(move |call| handler(call).boxed()));
    }

    pub fn unregister_slot(&self, name: &str) -> bool {
        self.inner.slots.write().remove(name).is_some()
    }

    #[must_use]
    pub fn has_slot(&self, name: &str) -> bool {
        self.inner.slots.read().contains_key(name)
    }

    /// Declare the signal `name`. Existing subscribers are kept.
    pub fn register_signal(&self, name: &str) {
        self.inner
            .signals
            .write()
            .entry(name.to_string())
            .or_default();
    }

    /// Subscribers of `signal` as `(instance, slot)`.
    #[must_use]
    pub fn signal_subscribers(&self, signal: &str) -> Vec<(String, String)> {
        self.inner
            .signals
            .read()
            .get(signal)
            .cloned()
            .unwrap_or_default()
    }

    /// Publish the connection details of an output channel for
    /// `slotGetOutputChannelInformation`.
    pub fn register_channel(&self, name: &str, info: Hash) {
        self.inner.channels.write().insert(name.to_string(), info);
    }

    pub fn unregister_channel(&self, name: &str) {
        self.inner.channels.write().remove(name);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribe to the broker, verify the instance id is unused, announce
    /// the instance and start heartbeats. A stopped instance cannot be
    /// started again.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if *inner.shutdown.borrow() {
            return Err(KaraboError::Canceled(format!(
                "instance {} was stopped",
                inner.instance_id
            )));
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let subscription = inner.broker.subscribe(&inner.instance_id)?;
        tokio::spawn(run_dispatcher(
            Arc::downgrade(inner),
            subscription,
            inner.shutdown.subscribe(),
        ));

        if inner.config.check_uniqueness {
            if let Err(e) = self.check_uniqueness().await {
                inner.running.store(false, Ordering::SeqCst);
                inner.shutdown.send_replace(true);
                return Err(e);
            }
        }

        inner.announce().await?;
        tokio::spawn(run_heartbeat(
            Arc::downgrade(inner),
            inner.config.heartbeat_interval,
            inner.shutdown.subscribe(),
        ));
        info!(
            instance_id = %inner.instance_id,
            topic = inner.broker.topic(),
            "Instance started"
        );
        Ok(())
    }

    async fn check_uniqueness(&self) -> Result<()> {
        let id = self.inner.instance_id.clone();
        let check = self
            .request(&id, "slotPing", (id.clone(), false))
            .timeout(self.inner.config.ping_timeout)
            .with_header(header::UNIQUENESS_TOKEN, self.inner.session_token.as_str());
        match check.receive_hash().await {
            Ok(_) => Err(KaraboError::Fatal(format!(
                "instance id '{id}' is already in use on topic '{}'",
                self.topic()
            ))),
            Err(KaraboError::Timeout(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Broadcast `slotInstanceGone` and stop dispatching.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let body = (inner.instance_id.clone(), inner.info()).into_body();
        if let Err(e) = inner
            .publish(Message::broadcast(&inner.instance_id, "slotInstanceGone", body))
            .await
        {
            warn!(instance_id = %inner.instance_id, error = %e, "Failed to announce shutdown");
        }
        inner.shutdown.send_replace(true);
        inner.strands.lock().clear();
        info!(instance_id = %inner.instance_id, "Instance stopped");
    }

    /// Number of slot bodies running right now.
    #[must_use]
    pub fn running_slots(&self) -> usize {
        *self.inner.active_count.borrow()
    }

    /// Wait up to `grace` for running slot bodies to finish, then abort the
    /// rest. Returns how many were aborted.
    pub async fn drain_slots(&self, grace: Duration) -> usize {
        let mut count = self.inner.active_count.subscribe();
        let idle = matches!(
            tokio::time::timeout(grace, count.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if idle {
            return 0;
        }
        let handles: Vec<AbortHandle> = {
            let mut active = self.inner.active.lock();
            let handles = active.drain().map(|(_, handle)| handle).collect();
            self.inner.active_count.send_replace(0);
            handles
        };
        for handle in &handles {
            handle.abort();
        }
        warn!(
            instance_id = %self.inner.instance_id,
            aborted = handles.len(),
            "Aborted slots still running after grace period"
        );
        handles.len()
    }

    /// Broadcast one heartbeat now.
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.inner.send_heartbeat().await
    }

    /// Ask every instance on the topic to answer with `slotPingAnswer`.
    pub async fn discover(&self) -> Result<()> {
        let body = (self.inner.instance_id.clone(), true).into_body();
        self.inner
            .publish(Message::broadcast(&self.inner.instance_id, "slotPing", body))
            .await
    }

    // =========================================================================
    // Calls, requests, signals
    // =========================================================================

    /// Fire-and-forget call of `slot` on `target` (`*` for everyone).
    pub async fn call<A: SlotArgs>(&self, target: &str, slot: &str, args: A) -> Result<()> {
        self.inner
            .publish(Message::call(&self.inner.instance_id, target, slot, args.into_body()))
            .await
    }

    /// Request with a reply. Nothing is sent until the returned
    /// [`Requestor`] is awaited.
    #[must_use]
    pub fn request<A: SlotArgs>(&self, target: &str, slot: &str, args: A) -> Requestor {
        Requestor {
            inner: Arc::clone(&self.inner),
            target: target.to_string(),
            slot: slot.to_string(),
            body: args.into_body(),
            header: Hash::new(),
            timeout: self.inner.config.request_timeout,
        }
    }

    /// Call `slot` on `target`; its reply arrives as a call of our
    /// `reply_slot`.
    pub async fn request_no_wait<A: SlotArgs>(
        &self,
        target: &str,
        slot: &str,
        reply_slot: &str,
        args: A,
    ) -> Result<()> {
        let mut message = Message::call(&self.inner.instance_id, target, slot, args.into_body());
        message.header.set(header::REPLY_FUNCTION, reply_slot);
        self.inner.publish(message).await
    }

    /// Send `signal` to its subscribers.
    pub async fn emit<A: SlotArgs>(&self, signal: &str, args: A) -> Result<()> {
        let subscribers = self
            .inner
            .signals
            .read()
            .get(signal)
            .cloned()
            .ok_or_else(|| KaraboError::NotFound(format!("signal {signal} is not registered")))?;
        if subscribers.is_empty() {
            return Ok(());
        }
        self.inner
            .publish(Message::signal(
                &self.inner.instance_id,
                signal,
                &subscribers,
                args.into_body(),
            ))
            .await
    }

    /// Subscribe `slot_instance.slot` to `signal_instance.signal`.
    /// Returns false if the emitter does not know the signal.
    pub async fn connect(
        &self,
        signal_instance: &str,
        signal: &str,
        slot_instance: &str,
        slot: &str,
    ) -> Result<bool> {
        let connected = if signal_instance == self.instance_id() {
            self.inner.connect_local(signal, slot_instance, slot)
        } else {
            let (ok,) = self
                .request(
                    signal_instance,
                    "slotConnectToSignal",
                    (signal.to_string(), slot_instance.to_string(), slot.to_string()),
                )
                .receive::<(bool,)>()
                .await?;
            ok
        };
        if !connected {
            warn!(
                signal_instance = signal_instance,
                signal = signal,
                "Connect to unknown signal"
            );
            return Ok(false);
        }
        if slot_instance == self.instance_id() {
            self.inner
                .remote_signals
                .write()
                .insert((signal_instance.to_string(), signal.to_string()));
        } else {
            self.call(
                slot_instance,
                "slotSubscribeRemoteSignal",
                (signal_instance.to_string(), signal.to_string()),
            )
            .await?;
        }
        Ok(true)
    }

    /// Inverse of [`connect`](Self::connect). Returns whether the
    /// subscription existed.
    pub async fn disconnect(
        &self,
        signal_instance: &str,
        signal: &str,
        slot_instance: &str,
        slot: &str,
    ) -> Result<bool> {
        let removed = if signal_instance == self.instance_id() {
            self.inner.disconnect_local(signal, slot_instance, slot)
        } else {
            let (ok,) = self
                .request(
                    signal_instance,
                    "slotDisconnectFromSignal",
                    (signal.to_string(), slot_instance.to_string(), slot.to_string()),
                )
                .receive::<(bool,)>()
                .await?;
            ok
        };
        if slot_instance == self.instance_id() {
            self.inner
                .remote_signals
                .write()
                .remove(&(signal_instance.to_string(), signal.to_string()));
        } else if removed {
            self.call(
                slot_instance,
                "slotUnsubscribeRemoteSignal",
                (signal_instance.to_string(), signal.to_string()),
            )
            .await?;
        }
        Ok(removed)
    }

    /// Signals of other instances this instance is connected to.
    #[must_use]
    pub fn remote_signals(&self) -> Vec<(String, String)> {
        self.inner.remote_signals.read().iter().cloned().collect()
    }

    /// Cache the configuration of `device_id` in the topology and keep it
    /// current through its `signalChanged` and `signalStateChanged`.
    pub async fn track_device(&self, device_id: &str) -> Result<Hash> {
        let (id, info) = self
            .request(device_id, "slotPing", (device_id.to_string(), false))
            .receive::<(String, Hash)>()
            .await?;
        if self.inner.topology.upsert(&id, &info) {
            self.inner.emit_event(InstanceEvent::New {
                instance_id: id.clone(),
                info,
            });
        }
        if !self
            .connect(device_id, "signalChanged", self.instance_id(), "slotChanged")
            .await?
        {
            return Err(KaraboError::NotFound(format!(
                "{device_id} has no signalChanged"
            )));
        }
        self.connect(device_id, "signalStateChanged", self.instance_id(), "slotChanged")
            .await?;
        let (configuration,) = self
            .request(device_id, "slotGetConfiguration", ())
            .receive::<(Hash,)>()
            .await?;
        self.inner
            .topology
            .set_configuration(device_id, configuration.clone());
        Ok(configuration)
    }
}

/// A request under construction; send it with one of the `receive` methods.
pub struct Requestor {
    inner: Arc<Inner>,
    target: String,
    slot: String,
    body: Hash,
    header: Hash,
    timeout: Duration,
}

impl Requestor {
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Claim `level` for the call (checked by devices and servers).
    #[must_use]
    pub fn access_level(self, level: AccessLevel) -> Self {
        self.with_header(header::ACCESS_LEVEL, level as i32)
    }

    pub(crate) fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.header.set(key, value);
        self
    }

    /// Send and await the raw reply body.
    pub async fn receive_hash(self) -> Result<Hash> {
        let Self {
            inner,
            target,
            slot,
            body,
            header: extra,
            timeout,
        } = self;
        let (reply_id, rx) = inner.pending.register(&slot, timeout);
        let mut message = Message::call(&inner.instance_id, &target, &slot, body);
        message.header.merge(&extra, MergePolicy::MergeAttributes);
        message.header.set(header::REPLY_ID, reply_id.as_str());
        message.header.set(header::REPLY_TO, target.as_str());
        if let Err(e) = inner.publish(message).await {
            inner.pending.remove(&reply_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KaraboError::Canceled(format!(
                "request {slot} on {target} abandoned"
            ))),
            Err(_) => {
                inner.pending.remove(&reply_id);
                debug!(reply_id = %reply_id, target = %target, slot = %slot, "Request timed out");
                Err(KaraboError::Timeout(format!(
                    "no reply from {target}.{slot} within {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Send and await typed positional return values.
    pub async fn receive<R: SlotArgs>(self) -> Result<R> {
        R::from_body(&self.receive_hash().await?)
    }

    /// Send and hand the reply (or failure) to `handler` on a task.
    pub fn receive_async<R, F>(self, handler: F)
    where
        R: SlotArgs,
        F: FnOnce(Result<R>) + Send + 'static,
    {
        tokio::spawn(async move { handler(self.receive::<R>().await) });
    }
}

impl Inner {
    fn info(&self) -> Hash {
        self.instance_info.read().clone()
    }

    fn add_slot(&self, name: &str, handler: SlotHandler) {
        self.slots.write().insert(name.to_string(), handler);
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.broker.publish(message).await
    }

    fn emit_event(&self, event: InstanceEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn announce(&self) -> Result<()> {
        let body = (self.instance_id.clone(), self.info()).into_body();
        self.publish(Message::broadcast(&self.instance_id, "slotInstanceNew", body))
            .await
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let counter = self
            .heartbeat_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        if counter == 0 {
            info!(instance_id = %self.instance_id, "Heartbeat counter wrapped, re-announcing");
            self.announce().await?;
        }
        let body = (self.instance_id.clone(), counter, self.info()).into_body();
        let targets = [(BROADCAST.to_string(), "slotHeartbeat".to_string())];
        self.publish(Message::signal(&self.instance_id, HEARTBEAT_SIGNAL, &targets, body))
            .await
    }

    fn connect_local(&self, signal: &str, slot_instance: &str, slot: &str) -> bool {
        let mut signals = self.signals.write();
        let Some(subscribers) = signals.get_mut(signal) else {
            return false;
        };
        let entry = (slot_instance.to_string(), slot.to_string());
        if !subscribers.contains(&entry) {
            subscribers.push(entry);
        }
        true
    }

    fn disconnect_local(&self, signal: &str, slot_instance: &str, slot: &str) -> bool {
        let mut signals = self.signals.write();
        let Some(subscribers) = signals.get_mut(signal) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(i, s)| i != slot_instance || s != slot);
        subscribers.len() != before
    }

    fn on_instance_new(&self, instance_id: &str, info: Hash) {
        self.topology.upsert(instance_id, &info);
        self.emit_event(InstanceEvent::New {
            instance_id: instance_id.to_string(),
            info,
        });
    }

    fn on_instance_gone(&self, instance_id: &str) {
        for subscribers in self.signals.write().values_mut() {
            subscribers.retain(|(i, _)| i != instance_id);
        }
        self.remote_signals.write().retain(|(i, _)| i != instance_id);
        self.strands.lock().remove(instance_id);
        if let Some(info) = self.topology.remove(instance_id) {
            info!(instance_id = %self.instance_id, gone = %instance_id, "Instance gone");
            self.emit_event(InstanceEvent::Gone {
                instance_id: instance_id.to_string(),
                info,
            });
        }
    }

    fn expire_silent(&self) {
        for id in self.topology.expired(Instant::now()) {
            warn!(
                instance_id = %self.instance_id,
                silent = %id,
                "Instance missed its heartbeats"
            );
            self.on_instance_gone(&id);
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        if message.header.get::<String>(header::UNIQUENESS_TOKEN).ok().as_deref()
            == Some(self.session_token.as_str())
        {
            return;
        }
        if message.is_reply() {
            if let Some(reply_id) = message.reply_id().map(str::to_string) {
                self.pending.complete(&reply_id, message.into_result());
            }
            return;
        }

        let caller = message.sender().to_string();
        let slots = message.slots_for(&self.instance_id);
        let mut route = Some(ReplyRoute::of(&message));
        let Message { header, body } = message;
        for slot in slots {
            let route = route.take().unwrap_or(ReplyRoute::None);
            let handler = self.slots.read().get(&slot).cloned();
            let Some(handler) = handler else {
                warn!(
                    instance_id = %self.instance_id,
                    caller = %caller,
                    slot = %slot,
                    "Call of unknown slot"
                );
                if let ReplyRoute::Reply { target, reply_id } = route {
                    let error = KaraboError::NotFound(format!(
                        "slot {slot} on {}",
                        self.instance_id
                    ));
                    let reply = Message::reply(&self.instance_id, &target, &reply_id, Err(error));
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = inner.publish(reply).await {
                            warn!(error = %e, "Failed to send error reply");
                        }
                    });
                }
                continue;
            };
            self.enqueue(Job {
                handler,
                call: SlotCall {
                    caller: caller.clone(),
                    slot,
                    header: header.clone(),
                    body: body.clone(),
                },
                route,
            });
        }
    }

    fn enqueue(self: &Arc<Self>, job: Job) {
        let mut strands = self.strands.lock();
        let job = match strands.get(&job.call.caller) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        let caller = job.call.caller.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_ok() {
            tokio::spawn(run_strand(Arc::downgrade(self), rx));
            strands.insert(caller, tx);
        }
    }

    fn track_slot(&self, handle: AbortHandle) -> u64 {
        let job = self.next_job.fetch_add(1, Ordering::Relaxed);
        let mut active = self.active.lock();
        active.insert(job, handle);
        self.active_count.send_replace(active.len());
        job
    }

    fn untrack_slot(&self, job: u64) {
        let mut active = self.active.lock();
        if active.remove(&job).is_some() {
            self.active_count.send_replace(active.len());
        }
    }

    async fn finish(&self, slot: &str, route: ReplyRoute, result: Result<Hash>) {
        if let Err(e) = &result {
            warn!(instance_id = %self.instance_id, slot = slot, error = %e, "Slot failed");
        }
        let message = match route {
            ReplyRoute::None => return,
            ReplyRoute::Reply { target, reply_id } => {
                Message::reply(&self.instance_id, &target, &reply_id, result)
            }
            ReplyRoute::Function {
                target,
                slot: reply_slot,
            } => match result {
                Ok(body) => Message::call(&self.instance_id, &target, &reply_slot, body),
                Err(_) => return,
            },
        };
        if let Err(e) = self.publish(message).await {
            warn!(instance_id = %self.instance_id, slot = slot, error = %e, "Failed to send reply");
        }
    }
}

async fn run_dispatcher(
    inner: Weak<Inner>,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            message = subscription.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(message);
    }
    debug!(instance_id = subscription.instance_id(), "Dispatcher stopped");
}

async fn run_strand(inner: Weak<Inner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(Job {
        handler,
        call,
        route,
    }) = jobs.recv().await
    {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let Ok(_permit) = Arc::clone(&inner.workers).acquire_owned().await else {
            break;
        };
        let slot = call.slot.clone();
        let body = tokio::spawn(handler(call));
        let job = inner.track_slot(body.abort_handle());
        let result = match body.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(KaraboError::Canceled(format!("slot {slot} aborted"))),
            Err(e) => Err(KaraboError::Fatal(format!("slot {slot} panicked: {e}"))),
        };
        inner.untrack_slot(job);
        inner.finish(&slot, route, result).await;
    }
}

async fn run_heartbeat(inner: Weak<Inner>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.send_heartbeat().await {
            warn!(instance_id = %inner.instance_id, error = %e, "Heartbeat failed");
        }
        inner.expire_silent();
        inner.pending.remove_expired();
    }
}

// =============================================================================
// System slots
// =============================================================================

fn system_slot<F, Fut>(inner: &Arc<Inner>, name: &str, body: F)
where
    F: Fn(Arc<Inner>, SlotCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Hash>> + Send + 'static,
{
    let weak = Arc::downgrade(inner);
    inner.add_slot(
        name,
        Arc::new(move |call| match weak.upgrade() {
            Some(inner) => body(inner, call).boxed(),
            None => future::ready(Err(KaraboError::Canceled("instance dropped".to_string()))).boxed(),
        }),
    );
}

fn register_system_slots(inner: &Arc<Inner>) {
    system_slot(inner, "slotPing", slot_ping);
    system_slot(inner, "slotPingAnswer", slot_ping_answer);
    system_slot(inner, "slotInstanceNew", slot_instance_new);
    system_slot(inner, "slotInstanceUpdated", slot_instance_updated);
    system_slot(inner, "slotInstanceGone", slot_instance_gone);
    system_slot(inner, "slotHeartbeat", slot_heartbeat);
    system_slot(inner, "slotConnectToSignal", slot_connect_to_signal);
    system_slot(inner, "slotDisconnectFromSignal", slot_disconnect_from_signal);
    system_slot(inner, "slotSubscribeRemoteSignal", slot_subscribe_remote_signal);
    system_slot(inner, "slotUnsubscribeRemoteSignal", slot_unsubscribe_remote_signal);
    system_slot(inner, "slotGetAvailableFunctions", slot_get_available_functions);
    system_slot(inner, "slotGetOutputChannelInformation", slot_get_output_channel_information);
    system_slot(inner, "slotChanged", slot_changed);
}

/// `(instanceId, track) -> (instanceId, instanceInfo)`; with `track` the
/// caller also gets a `slotPingAnswer`.
async fn slot_ping(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let track = arg::<bool>(&call.body, "a2").unwrap_or(false);
    if track && call.caller != inner.instance_id {
        let body = (inner.instance_id.clone(), inner.info()).into_body();
        inner
            .publish(Message::call(&inner.instance_id, &call.caller, "slotPingAnswer", body))
            .await?;
    }
    reply((inner.instance_id.clone(), inner.info()))
}

async fn slot_ping_answer(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (id, info) = call.args::<(String, Hash)>()?;
    if inner.topology.upsert(&id, &info) {
        inner.emit_event(InstanceEvent::New { instance_id: id, info });
    }
    Ok(Hash::new())
}

async fn slot_instance_new(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (id, info) = call.args::<(String, Hash)>()?;
    if id != inner.instance_id {
        debug!(instance_id = %inner.instance_id, new = %id, "Instance new");
        inner.on_instance_new(&id, info);
    }
    Ok(Hash::new())
}

async fn slot_instance_updated(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (id, info) = call.args::<(String, Hash)>()?;
    if id != inner.instance_id {
        inner.topology.upsert(&id, &info);
        inner.emit_event(InstanceEvent::Updated { instance_id: id, info });
    }
    Ok(Hash::new())
}

async fn slot_instance_gone(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (id,) = call.args::<(String,)>()?;
    if id != inner.instance_id {
        inner.on_instance_gone(&id);
    }
    Ok(Hash::new())
}

async fn slot_heartbeat(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (id, counter, info) = call.args::<(String, u32, Hash)>()?;
    if id == inner.instance_id {
        return Ok(Hash::new());
    }
    match inner.topology.heartbeat(&id, counter) {
        HeartbeatOutcome::Known => {}
        HeartbeatOutcome::Unknown => {
            inner.on_instance_new(&id, info);
            inner.topology.heartbeat(&id, counter);
        }
        HeartbeatOutcome::Restarted => {
            info!(instance_id = %inner.instance_id, restarted = %id, "Instance restarted");
            inner.on_instance_new(&id, info);
            inner.topology.heartbeat(&id, counter);
        }
    }
    Ok(Hash::new())
}

async fn slot_connect_to_signal(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (signal, slot_instance, slot) = call.args::<(String, String, String)>()?;
    reply((inner.connect_local(&signal, &slot_instance, &slot),))
}

async fn slot_disconnect_from_signal(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (signal, slot_instance, slot) = call.args::<(String, String, String)>()?;
    reply((inner.disconnect_local(&signal, &slot_instance, &slot),))
}

async fn slot_subscribe_remote_signal(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (signal_instance, signal) = call.args::<(String, String)>()?;
    let added = inner.remote_signals.write().insert((signal_instance, signal));
    reply((added,))
}

async fn slot_unsubscribe_remote_signal(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (signal_instance, signal) = call.args::<(String, String)>()?;
    let removed = inner.remote_signals.write().remove(&(signal_instance, signal));
    reply((removed,))
}

async fn slot_get_available_functions(inner: Arc<Inner>, _call: SlotCall) -> Result<Hash> {
    let mut slots: Vec<String> = inner.slots.read().keys().cloned().collect();
    let mut signals: Vec<String> = inner.signals.read().keys().cloned().collect();
    slots.sort();
    signals.sort();
    reply((Hash::new().with("slots", slots).with("signals", signals),))
}

/// `(channelName) -> (found, info)`; `channelName` may carry an
/// `instanceId:` prefix.
async fn slot_get_output_channel_information(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (name,) = call.args::<(String,)>()?;
    let name = name.rsplit_once(':').map_or(name.as_str(), |(_, n)| n);
    match inner.channels.read().get(name) {
        Some(info) => reply((true, info.clone())),
        None => reply((false, Hash::new())),
    }
}

/// `signalChanged(configuration, deviceId)` of a tracked device. The cache
/// entry is picked by the sender, never by the deviceId argument.
async fn slot_changed(inner: Arc<Inner>, call: SlotCall) -> Result<Hash> {
    let (changes,) = call.args::<(Hash,)>()?;
    let device_id = call.caller;
    if !inner.topology.update_configuration(&device_id, &changes) {
        debug!(device_id = %device_id, "Change of untracked or gone device ignored");
    }
    Ok(Hash::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use tokio::time::timeout;

    fn quick() -> SignalSlotableConfig {
        SignalSlotableConfig {
            check_uniqueness: false,
            request_timeout: Duration::from_secs(2),
            ..SignalSlotableConfig::default()
        }
    }

    async fn started(id: &str, broker: &Arc<InMemoryBroker>) -> SignalSlotable {
        let ss = SignalSlotable::new(id, broker.clone(), quick());
        ss.start().await.unwrap();
        ss
    }

    #[tokio::test]
    async fn test_request_reply_with_typed_arguments() {
        let broker = Arc::new(InMemoryBroker::default());
        let a = started("a", &broker).await;
        let b = started("b", &broker).await;
        a.register_slot("slotAdd", |call: SlotCall| async move {
            let (x, y) = call.args::<(i32, i32)>()?;
            reply((x + y,))
        });

        let (sum,) = b
            .request("a", "slotAdd", (2i32, 3i32))
            .receive::<(i32,)>()
            .await
            .unwrap();
        assert_eq!(sum, 5);
        assert_eq!(b.pending_replies().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_to_nobody_times_out_and_evicts() {
        let broker = Arc::new(InMemoryBroker::default());
        let b = started("b", &broker).await;

        let result = b
            .request("noone", "slotX", ())
            .timeout(Duration::from_millis(200))
            .receive::<(i32,)>()
            .await;
        assert!(matches!(result, Err(KaraboError::Timeout(_))));
        assert_eq!(b.pending_replies().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_slot_errors_reach_the_caller() {
        let broker = Arc::new(InMemoryBroker::default());
        let a = started("a", &broker).await;
        let b = started("b", &broker).await;
        a.register_slot("slotRefuse", |_call: SlotCall| async move {
            Err::<Hash, _>(KaraboError::DisallowedState("not now".to_string()))
        });

        let err = b.request("a", "slotRefuse", ()).receive_hash().await.unwrap_err();
        assert_eq!(err, KaraboError::DisallowedState("not now".to_string()));
        let err = b.request("a", "slotMissing", ()).receive_hash().await.unwrap_err();
        assert!(matches!(err, KaraboError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_calls_from_one_sender_run_in_order() {
        let broker = Arc::new(InMemoryBroker::default());
        let a = started("a", &broker).await;
        let b = started("b", &broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.register_slot("slotRecord", move |call: SlotCall| {
            let tx = tx.clone();
            async move {
                let (n,) = call.args::<(i32,)>()?;
                let _ = tx.send(n);
                Ok::<_, KaraboError>(Hash::new())
            }
        });

        for n in 0..20i32 {
            b.call("a", "slotRecord", (n,)).await.unwrap();
        }
        let mut seen = Vec::new();
        while seen.len() < 20 {
            seen.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_drain_aborts_slow_slots_and_replies_canceled() {
        let broker = Arc::new(InMemoryBroker::default());
        let a = started("a", &broker).await;
        let b = started("b", &broker).await;
        a.register_slot("slotQuick", |_call: SlotCall| async move { reply(()) });
        a.register_slot("slotSlow", |_call: SlotCall| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            reply(())
        });

        b.request("a", "slotQuick", ()).receive_hash().await.unwrap();
        assert_eq!(a.drain_slots(Duration::from_millis(50)).await, 0);

        let slow = tokio::spawn({
            let b = b.clone();
            async move { b.request("a", "slotSlow", ()).receive_hash().await }
        });
        timeout(Duration::from_secs(2), async {
            while a.running_slots() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(a.drain_slots(Duration::from_millis(100)).await, 1);
        assert_eq!(a.running_slots(), 0);
        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, KaraboError::Canceled(_)));
    }

    #[tokio::test]
    async fn test_signal_reaches_subscribers_until_they_are_gone() {
        let broker = Arc::new(InMemoryBroker::default());
        let emitter = started("emitter", &broker).await;
        let listener = started("listener", &broker).await;
        emitter.register_signal("signalValue");
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.register_slot("slotValue", move |call: SlotCall| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(call.args::<(i32,)>()?.0);
                Ok::<_, KaraboError>(Hash::new())
            }
        });

        assert!(listener
            .connect("emitter", "signalValue", "listener", "slotValue")
            .await
            .unwrap());
        assert!(!listener
            .connect("emitter", "signalNope", "listener", "slotValue")
            .await
            .unwrap());
        emitter.emit("signalValue", (42i32,)).await.unwrap();
        assert_eq!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap(), Some(42));

        listener.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(emitter.signal_subscribers("signalValue").is_empty());
        assert!(emitter.emit("signalUnknown", ()).await.is_err());
    }

    #[tokio::test]
    async fn test_request_no_wait_calls_back() {
        let broker = Arc::new(InMemoryBroker::default());
        let a = started("a", &broker).await;
        let b = started("b", &broker).await;
        a.register_slot("slotDouble", |call: SlotCall| async move {
            reply((call.args::<(i32,)>()?.0 * 2,))
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_slot("slotDoubled", move |call: SlotCall| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(call.args::<(i32,)>()?.0);
                Ok::<_, KaraboError>(Hash::new())
            }
        });

        b.request_no_wait("a", "slotDouble", "slotDoubled", (21i32,))
            .await
            .unwrap();
        assert_eq!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_receive_async_delivers_timeout_to_handler() {
        let broker = Arc::new(InMemoryBroker::default());
        let b = started("b", &broker).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        b.request("noone", "slotX", ())
            .timeout(Duration::from_millis(50))
            .receive_async::<(i32,), _>(move |result| {
                let _ = tx.send(result);
            });
        let result = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(KaraboError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_duplicate_instance_id_is_refused() {
        let broker = Arc::new(InMemoryBroker::default());
        let config = SignalSlotableConfig {
            ping_timeout: Duration::from_millis(100),
            ..SignalSlotableConfig::default()
        };
        let first = SignalSlotable::new("dup", broker.clone(), config.clone());
        first.start().await.unwrap();

        let second = SignalSlotable::new("dup", broker.clone(), config);
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, KaraboError::Fatal(_)));
        assert!(!second.is_running());
        assert!(first.is_running());
    }

    #[tokio::test]
    async fn test_topology_follows_announcements() {
        let broker = Arc::new(InMemoryBroker::default());
        let observer = started("observer", &broker).await;
        let mut events = observer.subscribe_events();

        let device = SignalSlotable::new("dev", broker.clone(), quick());
        device.set_instance_info(&Hash::new().with("type", "device"));
        device.start().await.unwrap();

        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(&event, InstanceEvent::New { instance_id, .. } if instance_id == "dev"));
        assert_eq!(observer.topology().instances_of("device"), vec!["dev"]);

        device
            .update_instance_info(&Hash::new().with("status", "busy"))
            .await
            .unwrap();
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, InstanceEvent::Updated { .. }));
        assert_eq!(
            observer.topology().info("dev").unwrap().get::<String>("status").unwrap(),
            "busy"
        );

        device.stop().await;
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, InstanceEvent::Gone { .. }));
        assert!(!observer.topology().contains("dev"));
    }

    #[tokio::test]
    async fn test_changes_are_applied_to_the_sender_only() {
        let broker = Arc::new(InMemoryBroker::default());
        let observer = started("observer", &broker).await;
        let mut events = observer.subscribe_events();
        let device = started("dev", &broker).await;
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(&event, InstanceEvent::New { instance_id, .. } if instance_id == "dev"));
        observer
            .topology()
            .set_configuration("dev", Hash::new().with("speed", 1i32));
        let impostor = started("impostor", &broker).await;

        impostor
            .request("observer", "slotChanged", (Hash::new().with("speed", 9i32), "dev".to_string()))
            .receive_hash()
            .await
            .unwrap();
        let cached = observer.topology().configuration("dev").unwrap();
        assert_eq!(cached.get::<i32>("speed").unwrap(), 1);

        device
            .request("observer", "slotChanged", (Hash::new().with("speed", 2i32), "other".to_string()))
            .receive_hash()
            .await
            .unwrap();
        let cached = observer.topology().configuration("dev").unwrap();
        assert_eq!(cached.get::<i32>("speed").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_silent_instance_is_declared_gone() {
        let broker = Arc::new(InMemoryBroker::default());
        let config = SignalSlotableConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..quick()
        };
        let observer = SignalSlotable::new("observer", broker.clone(), config.clone());
        observer.start().await.unwrap();
        let mut events = observer.subscribe_events();

        let victim = SignalSlotable::new("victim", broker.clone(), config);
        victim.start().await.unwrap();
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, InstanceEvent::New { .. }));

        // Dropped without stop: no slotInstanceGone, heartbeats just cease.
        drop(victim);
        let gone = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(InstanceEvent::Gone { instance_id, .. }) = events.recv().await {
                    return instance_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(gone, "victim");
    }

    #[tokio::test]
    async fn test_heartbeat_wrap_reannounces() {
        let broker = Arc::new(InMemoryBroker::default());
        let observer = started("observer", &broker).await;
        let ss = started("wrapper", &broker).await;
        let mut events = observer.subscribe_events();
        ss.inner.heartbeat_counter.store(u32::MAX, Ordering::Relaxed);

        ss.send_heartbeat().await.unwrap();
        assert_eq!(ss.heartbeat_counter(), 0);
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(&event, InstanceEvent::New { instance_id, .. } if instance_id == "wrapper"));
    }

    #[tokio::test]
    async fn test_output_channel_information() {
        let broker = Arc::new(InMemoryBroker::default());
        let a = started("a", &broker).await;
        let b = started("b", &broker).await;
        a.register_channel("output", Hash::new().with("port", 4321i32));

        let (found, info) = b
            .request("a", "slotGetOutputChannelInformation", ("a:output".to_string(),))
            .receive::<(bool, Hash)>()
            .await
            .unwrap();
        assert!(found);
        assert_eq!(info.get::<i32>("port").unwrap(), 4321);

        let (found, _) = b
            .request("a", "slotGetOutputChannelInformation", ("other".to_string(),))
            .receive::<(bool, Hash)>()
            .await
            .unwrap();
        assert!(!found);
    }
}
