//! # Input Channel
//!
//! Reads chunks from one or more output channels.
//!
//! The input is the connecting side: for every configured output it
//! resolves the output's address, connects, sends its handshake and keeps
//! reconnecting with backoff when the connection drops. A chunk is only
//! requested when the consumer calls [`InputChannel::read`], so a slow
//! consumer leaves chunks on the producer side where its `onSlowness`
//! policy applies.
//!
//! Every connection attempt gets a new epoch; chunks tagged with an older
//! epoch are discarded on read.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use karabo_bus::Backoff;
use karabo_data::{Hash, KaraboError, Result};
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::config::{Handshake, InputChannelConfig};
use crate::frame::{read_control, read_frame, write_control, ChunkMeta, Frame, Payload};
use crate::output::HANDSHAKE_TIMEOUT;
use crate::resolver::{split_channel_id, ChannelResolver};

/// What [`InputChannel::read`] hands to the consumer.
#[derive(Debug, Clone)]
pub enum InputEvent {
    Data {
        /// Output the chunk came from.
        output: String,
        items: Vec<(Payload, ChunkMeta)>,
    },
    /// Every connected output has ended its stream.
    EndOfStream,
}

type Delivery = (String, u64, Frame);

struct Connection {
    output_id: String,
    epoch: AtomicU64,
    connected: AtomicBool,
    /// A read request is on the wire and not yet answered.
    outstanding: AtomicBool,
    requests: Mutex<Option<mpsc::UnboundedSender<()>>>,
    reconnect: Notify,
    stop: watch::Sender<bool>,
}

impl Connection {
    fn new(output_id: &str) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            output_id: output_id.to_string(),
            epoch: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            outstanding: AtomicBool::new(false),
            requests: Mutex::new(None),
            reconnect: Notify::new(),
            stop,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn request_one(&self) {
        if !self.is_connected() || self.outstanding.swap(true, Ordering::AcqRel) {
            return;
        }
        let sent = self
            .requests
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(()).is_ok());
        if !sent {
            self.outstanding.store(false, Ordering::Release);
        }
    }
}

struct InputInner {
    channel_id: String,
    config: InputChannelConfig,
    resolver: Arc<dyn ChannelResolver>,
    backoff: Backoff,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    ended: Mutex<HashSet<String>>,
    state_changed: Notify,
    connected_count: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
}

/// Consumer side of a point-to-point channel.
pub struct InputChannel {
    inner: Arc<InputInner>,
}

impl std::fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputChannel")
            .field("channel_id", &self.inner.channel_id)
            .field("outputs", &self.inner.config.connected_output_channels)
            .finish_non_exhaustive()
    }
}

impl InputChannel {
    /// Start connecting to every configured output. `channel_id` is
    /// `instanceId:channelName`.
    pub fn open(channel_id: &str, config: InputChannelConfig, resolver: Arc<dyn ChannelResolver>) -> Self {
        Self::open_with(channel_id, config, resolver, Backoff::default())
    }

    pub fn open_with(
        channel_id: &str,
        config: InputChannelConfig,
        resolver: Arc<dyn ChannelResolver>,
        backoff: Backoff,
    ) -> Self {
        let (deliveries, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let (connected_count, _) = watch::channel(0);
        let outputs = config.connected_output_channels.clone();
        let inner = Arc::new(InputInner {
            channel_id: channel_id.to_string(),
            config,
            resolver,
            backoff,
            connections: RwLock::new(HashMap::new()),
            deliveries,
            receiver: tokio::sync::Mutex::new(receiver),
            ended: Mutex::new(HashSet::new()),
            state_changed: Notify::new(),
            connected_count,
            shutdown,
        });
        let channel = Self { inner };
        for output in &outputs {
            channel.connect_output(output);
        }
        channel
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    #[must_use]
    pub fn config(&self) -> &InputChannelConfig {
        &self.inner.config
    }

    /// Add an output at runtime; a no-op if it is already configured.
    pub fn connect_output(&self, output_id: &str) {
        let conn = {
            let mut connections = self.inner.connections.write();
            if connections.contains_key(output_id) {
                return;
            }
            let conn = Arc::new(Connection::new(output_id));
            connections.insert(output_id.to_string(), Arc::clone(&conn));
            conn
        };
        tokio::spawn(run_connection(Arc::downgrade(&self.inner), conn));
    }

    /// Stop reading from `output_id`.
    pub fn disconnect_output(&self, output_id: &str) -> bool {
        let removed = self.inner.connections.write().remove(output_id);
        match removed {
            Some(conn) => {
                conn.stop.send_replace(true);
                self.inner.ended.lock().remove(output_id);
                self.inner.publish_connected();
                true
            }
            None => false,
        }
    }

    /// Outputs with a live connection.
    #[must_use]
    pub fn connected_outputs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.output_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Configured outputs without a live connection.
    #[must_use]
    pub fn missing_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .connections
            .read()
            .values()
            .filter(|c| !c.is_connected())
            .map(|c| c.output_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Retry now, skipping the backoff, for every output of `instance_id`.
    /// Called when that instance (re)appears in the topology.
    pub fn wake(&self, instance_id: &str) {
        for conn in self.inner.connections.read().values() {
            let owner = split_channel_id(&conn.output_id).map(|(i, _)| i);
            if owner.is_ok_and(|i| i == instance_id) && !conn.is_connected() {
                conn.reconnect.notify_one();
            }
        }
    }

    /// Wait until every configured output is connected.
    pub async fn wait_connected(&self, timeout: std::time::Duration) -> Result<()> {
        let mut count = self.inner.connected_count.subscribe();
        let inner = Arc::clone(&self.inner);
        let wanted = move || inner.connections.read().len();
        let result = tokio::time::timeout(timeout, count.wait_for(|n| *n >= wanted()))
            .await
            .map_err(|_| {
                KaraboError::Timeout(format!(
                    "{} still waiting for {:?}",
                    self.inner.channel_id,
                    self.missing_connections()
                ))
            })?
            .map(|_| ())
            .map_err(|_| KaraboError::Canceled("input channel closed".into()));
        result
    }

    /// Next chunk or end-of-stream. `None` once the channel is closed.
    pub async fn read(&self) -> Option<InputEvent> {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return None;
        }
        let mut receiver = inner.receiver.lock().await;
        loop {
            inner.request_more();
            let (output, epoch, frame) = tokio::select! {
                delivery = receiver.recv() => delivery?,
                () = inner.state_changed.notified() => continue,
                _ = shutdown.changed() => return None,
            };
            let current = inner
                .connections
                .read()
                .get(&output)
                .map(|c| c.epoch.load(Ordering::Acquire));
            if current != Some(epoch) {
                debug!(channel = %inner.channel_id, output = %output, "Stale chunk discarded");
                continue;
            }
            if !frame.end_of_stream {
                return Some(InputEvent::Data {
                    output,
                    items: frame.items,
                });
            }
            debug!(channel = %inner.channel_id, output = %output, "End of stream received");
            if inner.all_ended(output) {
                info!(channel = %inner.channel_id, "All outputs ended their stream");
                return Some(InputEvent::EndOfStream);
            }
        }
    }

    /// Changes whenever the number of connected outputs changes.
    #[must_use]
    pub fn connection_changes(&self) -> watch::Receiver<usize> {
        self.inner.connected_count.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Disconnect from every output.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
        for conn in self.inner.connections.read().values() {
            conn.stop.send_replace(true);
        }
    }
}

impl Drop for InputChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl InputInner {
    fn request_more(&self) {
        for conn in self.connections.read().values() {
            conn.request_one();
        }
    }

    /// Record an end-of-stream from `output`; true (and reset) once every
    /// connected output has sent one.
    fn all_ended(&self, output: String) -> bool {
        let mut ended = self.ended.lock();
        ended.insert(output);
        let all = self
            .connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .all(|c| ended.contains(&c.output_id));
        if all {
            ended.clear();
        }
        all
    }

    fn publish_connected(&self) {
        let n = self
            .connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .count();
        self.connected_count.send_replace(n);
    }
}

async fn open_connection(
    resolver: &dyn ChannelResolver,
    output_id: &str,
    handshake: &Handshake,
) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let info = resolver.resolve(output_id).await?;
    let host = info.get::<String>("hostname")?;
    let port = u16::try_from(info.get_as::<u32>("port")?)
        .map_err(|_| KaraboError::Protocol(format!("bad port for {output_id}")))?;
    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| KaraboError::Io(format!("{host}:{port}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| KaraboError::Io(e.to_string()))?;
    let (mut rd, mut wr) = stream.into_split();
    write_control(&mut wr, &handshake.to_hash()).await?;
    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_control(&mut rd))
        .await
        .map_err(|_| KaraboError::Timeout(format!("handshake with {output_id}")))??;
    if !reply.get::<bool>("ok").unwrap_or(false) {
        return Err(KaraboError::Protocol(format!(
            "{output_id} refused the connection: {}",
            reply.get::<String>("error").unwrap_or_default()
        )));
    }
    Ok((rd, wr))
}

async fn run_connection(inner: Weak<InputInner>, conn: Arc<Connection>) {
    let mut stop = conn.stop.subscribe();
    let mut backoff = match inner.upgrade() {
        Some(strong) => strong.backoff.clone(),
        None => return,
    };
    loop {
        if *stop.borrow() {
            break;
        }
        let Some(strong) = inner.upgrade() else {
            break;
        };
        let resolver = Arc::clone(&strong.resolver);
        let handshake = Handshake::new(&strong.channel_id, &strong.config);
        drop(strong);

        match open_connection(resolver.as_ref(), &conn.output_id, &handshake).await {
            Ok((rd, wr)) => {
                backoff.reset();
                let epoch = conn.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                let (requests, request_rx) = mpsc::unbounded_channel();
                *conn.requests.lock() = Some(requests);
                conn.outstanding.store(false, Ordering::Release);
                conn.connected.store(true, Ordering::Release);
                if let Some(strong) = inner.upgrade() {
                    strong.ended.lock().remove(&conn.output_id);
                    strong.publish_connected();
                    strong.state_changed.notify_one();
                    info!(channel = %strong.channel_id, output = %conn.output_id, epoch, "Connected to output");
                }

                let result = serve(&inner, &conn, epoch, rd, wr, request_rx, &mut stop).await;

                conn.connected.store(false, Ordering::Release);
                *conn.requests.lock() = None;
                if let Some(strong) = inner.upgrade() {
                    strong.publish_connected();
                    strong.state_changed.notify_one();
                }
                match result {
                    Ok(()) => debug!(output = %conn.output_id, "Connection to output closed"),
                    Err(e) => warn!(output = %conn.output_id, error = %e, "Connection to output lost"),
                }
            }
            Err(e) => {
                debug!(output = %conn.output_id, error = %e, "Output not reachable");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = conn.reconnect.notified() => backoff.reset(),
            _ = stop.changed() => break,
        }
    }
    debug!(output = %conn.output_id, "Connection task finished");
}

async fn serve(
    inner: &Weak<InputInner>,
    conn: &Connection,
    epoch: u64,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    mut requests: mpsc::UnboundedReceiver<()>,
    stop: &mut watch::Receiver<bool>,
) -> Result<()> {
    tokio::select! {
        r = forward_frames(inner, conn, epoch, &mut rd) => r,
        r = send_requests(&mut wr, &mut requests) => r,
        _ = stop.changed() => Ok(()),
    }
}

async fn forward_frames(
    inner: &Weak<InputInner>,
    conn: &Connection,
    epoch: u64,
    rd: &mut OwnedReadHalf,
) -> Result<()> {
    loop {
        let frame = read_frame(rd).await?;
        conn.outstanding.store(false, Ordering::Release);
        let Some(strong) = inner.upgrade() else {
            return Ok(());
        };
        if strong
            .deliveries
            .send((conn.output_id.clone(), epoch, frame))
            .is_err()
        {
            return Ok(());
        }
    }
}

async fn send_requests(wr: &mut OwnedWriteHalf, requests: &mut mpsc::UnboundedReceiver<()>) -> Result<()> {
    let update = Hash::new().with("reason", "update");
    while requests.recv().await.is_some() {
        write_control(wr, &update).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataDistribution, OnSlowness, OutputChannelConfig};
    use crate::output::OutputChannel;
    use crate::resolver::StaticResolver;
    use karabo_data::Timestamp;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn local() -> OutputChannelConfig {
        OutputChannelConfig {
            hostname: "127.0.0.1".to_string(),
            ..OutputChannelConfig::default()
        }
    }

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(20), Duration::from_millis(100))
    }

    fn input_config(outputs: &[&str]) -> InputChannelConfig {
        InputChannelConfig {
            connected_output_channels: outputs.iter().map(|s| s.to_string()).collect(),
            on_slowness: OnSlowness::Wait,
            max_queue_length: 4,
            ..InputChannelConfig::default()
        }
    }

    fn value(event: &InputEvent) -> i32 {
        match event {
            InputEvent::Data { items, .. } => items[0].0.as_hash().unwrap().get::<i32>("n").unwrap(),
            InputEvent::EndOfStream => -1,
        }
    }

    async fn send(output: &OutputChannel, n: i32) {
        output
            .write_chunk(
                Hash::new().with("n", n),
                ChunkMeta::new(output.channel_id(), Timestamp::default()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reads_in_order_then_end_of_stream() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let resolver = Arc::new(StaticResolver::new());
        resolver.insert("p:output", output.info());
        let input = InputChannel::open_with("c:input", input_config(&["p:output"]), resolver, fast());
        input.wait_connected(WAIT).await.unwrap();
        output.wait_for_inputs(1, WAIT).await.unwrap();

        let producer = tokio::spawn(async move {
            for n in 0..6 {
                send(&output, n).await;
            }
            output.signal_end_of_stream().await.unwrap();
            output
        });

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(WAIT, input.read()).await.unwrap().unwrap();
            if matches!(event, InputEvent::EndOfStream) {
                break;
            }
            seen.push(value(&event));
        }
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
        drop(producer.await.unwrap());
    }

    #[tokio::test]
    async fn test_end_of_stream_waits_for_every_output() {
        let a = OutputChannel::bind("a:output", local()).await.unwrap();
        let b = OutputChannel::bind("b:output", local()).await.unwrap();
        let resolver = Arc::new(StaticResolver::new());
        resolver.insert("a:output", a.info());
        resolver.insert("b:output", b.info());
        let input = InputChannel::open_with(
            "c:input",
            input_config(&["a:output", "b:output"]),
            resolver,
            fast(),
        );
        input.wait_connected(WAIT).await.unwrap();
        a.wait_for_inputs(1, WAIT).await.unwrap();
        b.wait_for_inputs(1, WAIT).await.unwrap();

        a.signal_end_of_stream().await.unwrap();
        send(&b, 7).await;
        let first = tokio::time::timeout(WAIT, input.read()).await.unwrap().unwrap();
        assert_eq!(value(&first), 7);

        b.signal_end_of_stream().await.unwrap();
        let last = tokio::time::timeout(WAIT, input.read()).await.unwrap().unwrap();
        assert!(matches!(last, InputEvent::EndOfStream));
    }

    #[tokio::test]
    async fn test_reconnects_after_output_restarts() {
        let resolver = Arc::new(StaticResolver::new());
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        resolver.insert("p:output", output.info());
        let input = InputChannel::open_with(
            "c:input",
            input_config(&["p:output"]),
            Arc::clone(&resolver) as Arc<dyn ChannelResolver>,
            fast(),
        );
        input.wait_connected(WAIT).await.unwrap();
        drop(output);

        let restarted = OutputChannel::bind("p:output", local()).await.unwrap();
        resolver.insert("p:output", restarted.info());
        input.wake("p");
        restarted.wait_for_inputs(1, WAIT).await.unwrap();
        input.wait_connected(WAIT).await.unwrap();

        send(&restarted, 42).await;
        let event = tokio::time::timeout(WAIT, input.read()).await.unwrap().unwrap();
        assert_eq!(value(&event), 42);
    }

    #[tokio::test]
    async fn test_unreachable_output_is_reported_missing() {
        let resolver = Arc::new(StaticResolver::new());
        let input = InputChannel::open_with("c:input", input_config(&["ghost:output"]), resolver, fast());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(input.missing_connections(), vec!["ghost:output".to_string()]);
        assert!(input.connected_outputs().is_empty());
    }

    #[tokio::test]
    async fn test_shared_inputs_split_the_stream() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let resolver = Arc::new(StaticResolver::new());
        resolver.insert("p:output", output.info());
        let config = InputChannelConfig {
            data_distribution: DataDistribution::Shared,
            ..input_config(&["p:output"])
        };
        let first = InputChannel::open_with("c1:input", config.clone(), resolver.clone(), fast());
        let second = InputChannel::open_with("c2:input", config, resolver, fast());
        output.wait_for_inputs(2, WAIT).await.unwrap();

        for n in 0..4 {
            send(&output, n).await;
        }
        let mut got = Vec::new();
        for input in [&first, &second, &first, &second] {
            let event = tokio::time::timeout(WAIT, input.read()).await.unwrap().unwrap();
            got.push(value(&event));
        }
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }
}
