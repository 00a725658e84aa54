//! # Output Channel
//!
//! A named TCP endpoint that distributes chunks to connected inputs.
//!
//! Each input gets a bounded [`ChunkQueue`]. Chunks leave a queue only when
//! the input asks for one (`reason = update`), so a chunk the consumer has
//! not read still occupies its slot. When a queue is full the input's
//! `onSlowness` policy decides: wait, drop, drop the oldest, or fail.
//!
//! ```text
//! write()+update() ──► copy inputs:   every queue
//!                  └─► shared inputs: one queue (round-robin | load-balanced)
//!
//! per input:  queue ──(on request)──► socket
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use karabo_data::{Hash, KaraboError, Result};
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::{
    DataDistribution, DistributionMode, Handshake, OnSlowness, OutputChannelConfig, DEFAULT_HOSTNAME,
};
use crate::frame::{read_control, write_control, write_frame, ChunkMeta, EncodedFrame, Frame, Payload};
use crate::queue::{ChunkQueue, PushOutcome};

/// How long an accepted connection may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters of an output channel.
#[derive(Debug, Default)]
pub struct OutputStats {
    pub chunks_written: AtomicU64,
    /// Chunk copies discarded by `drop`/`queueDrop` policies.
    pub chunks_dropped: AtomicU64,
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// One connected input as seen by the output.
struct InputHandle {
    handshake: Handshake,
    queue: Mutex<ChunkQueue>,
    /// Read requests not yet answered.
    demand: AtomicU32,
    wake_writer: Notify,
    space: Notify,
    closed: AtomicBool,
}

impl InputHandle {
    fn new(handshake: Handshake) -> Self {
        Self {
            queue: Mutex::new(ChunkQueue::new(handshake.max_queue_length)),
            handshake,
            demand: AtomicU32::new(0),
            wake_writer: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn id(&self) -> &str {
        &self.handshake.instance_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake_writer.notify_one();
        self.space.notify_waiters();
        self.space.notify_one();
    }
}

struct OutputInner {
    channel_id: String,
    config: OutputChannelConfig,
    local_addr: SocketAddr,
    advertised_host: String,
    inputs: RwLock<Vec<Arc<InputHandle>>>,
    inputs_changed: watch::Sender<usize>,
    pending: Mutex<Vec<(Payload, ChunkMeta)>>,
    next_shared: AtomicUsize,
    stats: OutputStats,
    shutdown: watch::Sender<bool>,
}

/// Producer side of a point-to-point channel.
pub struct OutputChannel {
    inner: Arc<OutputInner>,
}

impl std::fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChannel")
            .field("channel_id", &self.inner.channel_id)
            .field("local_addr", &self.inner.local_addr)
            .finish_non_exhaustive()
    }
}

fn io_error(e: std::io::Error) -> KaraboError {
    KaraboError::Io(e.to_string())
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl OutputChannel {
    /// Bind the listener and start accepting inputs. `channel_id` is
    /// `instanceId:channelName`.
    pub async fn bind(channel_id: &str, config: OutputChannelConfig) -> Result<Self> {
        let any = config.hostname == DEFAULT_HOSTNAME;
        let bind_host = if any { "0.0.0.0" } else { config.hostname.as_str() };
        let listener = TcpListener::bind((bind_host, config.port))
            .await
            .map_err(io_error)?;
        let local_addr = listener.local_addr().map_err(io_error)?;
        let advertised_host = if any { host_name() } else { config.hostname.clone() };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (inputs_changed, _) = watch::channel(0);
        let inner = Arc::new(OutputInner {
            channel_id: channel_id.to_string(),
            config,
            local_addr,
            advertised_host,
            inputs: RwLock::new(Vec::new()),
            inputs_changed,
            pending: Mutex::new(Vec::new()),
            next_shared: AtomicUsize::new(0),
            stats: OutputStats::default(),
            shutdown,
        });
        tokio::spawn(accept_loop(Arc::downgrade(&inner), listener, shutdown_rx));
        info!(channel = %channel_id, addr = %local_addr, "Output channel listening");
        Ok(Self { inner })
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Connection details handed out by `slotGetOutputChannelInformation`.
    #[must_use]
    pub fn info(&self) -> Hash {
        Hash::new()
            .with("connectionType", "tcp")
            .with("hostname", self.inner.advertised_host.as_str())
            .with("port", u32::from(self.inner.local_addr.port()))
            .with("memoryLocation", "remote")
    }

    #[must_use]
    pub fn stats(&self) -> &OutputStats {
        &self.inner.stats
    }

    /// Ids of the connected inputs.
    #[must_use]
    pub fn connected_inputs(&self) -> Vec<String> {
        self.inner
            .inputs
            .read()
            .iter()
            .map(|i| i.id().to_string())
            .collect()
    }

    /// Unread data chunks queued for `input_id`.
    #[must_use]
    pub fn queued(&self, input_id: &str) -> Option<usize> {
        self.inner
            .inputs
            .read()
            .iter()
            .find(|i| i.id() == input_id)
            .map(|i| i.queue.lock().len())
    }

    /// Wait until at least `count` inputs are connected.
    pub async fn wait_for_inputs(&self, count: usize, timeout: Duration) -> Result<()> {
        let mut changes = self.inner.inputs_changed.subscribe();
        let result = tokio::time::timeout(timeout, changes.wait_for(|n| *n >= count))
            .await
            .map_err(|_| {
                KaraboError::Timeout(format!(
                    "{} inputs on {} after {} ms",
                    self.inner.inputs.read().len(),
                    self.inner.channel_id,
                    timeout.as_millis()
                ))
            })?
            .map(|_| ())
            .map_err(|_| KaraboError::Canceled("output channel closed".into()));
        result
    }

    /// Add an item to the chunk under construction.
    pub fn write(&self, payload: impl Into<Payload>, meta: ChunkMeta) {
        self.inner.pending.lock().push((payload.into(), meta));
    }

    /// Send the chunk under construction to the inputs.
    pub async fn update(&self) -> Result<()> {
        let items = std::mem::take(&mut *self.inner.pending.lock());
        if items.is_empty() {
            return Ok(());
        }
        let frame = Frame {
            items,
            end_of_stream: false,
        }
        .encode()?;
        self.inner.stats.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.inner.distribute(frame).await
    }

    /// `write` + `update` for a single item.
    pub async fn write_chunk(&self, payload: impl Into<Payload>, meta: ChunkMeta) -> Result<()> {
        self.write(payload, meta);
        self.update().await
    }

    /// Flush, then queue an end-of-stream marker for every input.
    pub async fn signal_end_of_stream(&self) -> Result<()> {
        self.update().await?;
        let eos = Frame::end_of_stream().encode()?;
        for input in self.inner.inputs.read().iter() {
            input.queue.lock().push_end_of_stream(eos.clone());
            input.wake_writer.notify_one();
        }
        debug!(channel = %self.inner.channel_id, "End of stream queued");
        Ok(())
    }

    /// Stop accepting and disconnect every input.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
        for input in self.inner.inputs.write().drain(..) {
            input.close();
        }
        self.inner.inputs_changed.send_replace(0);
    }
}

impl Drop for OutputChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl OutputInner {
    fn attach(&self, handshake: Handshake) -> Arc<InputHandle> {
        let handle = Arc::new(InputHandle::new(handshake));
        let mut inputs = self.inputs.write();
        if let Some(pos) = inputs.iter().position(|i| i.id() == handle.id()) {
            warn!(channel = %self.channel_id, input = %handle.id(), "Input reconnected, replacing");
            inputs.remove(pos).close();
        }
        inputs.push(Arc::clone(&handle));
        self.inputs_changed.send_replace(inputs.len());
        info!(
            channel = %self.channel_id,
            input = %handle.id(),
            distribution = %handle.handshake.data_distribution,
            on_slowness = %handle.handshake.on_slowness,
            max_queue = handle.handshake.max_queue_length,
            "Input connected"
        );
        handle
    }

    fn detach(&self, handle: &Arc<InputHandle>) {
        handle.close();
        let mut inputs = self.inputs.write();
        let before = inputs.len();
        inputs.retain(|i| !Arc::ptr_eq(i, handle));
        if inputs.len() != before {
            self.inputs_changed.send_replace(inputs.len());
            info!(channel = %self.channel_id, input = %handle.id(), "Input disconnected");
        }
    }

    async fn distribute(&self, frame: EncodedFrame) -> Result<()> {
        let inputs = self.inputs.read().clone();
        let (copies, shared): (Vec<_>, Vec<_>) = inputs
            .into_iter()
            .partition(|i| i.handshake.data_distribution == DataDistribution::Copy);
        for input in &copies {
            self.deliver(input, &frame).await?;
        }
        if shared.is_empty() {
            return Ok(());
        }
        match self.config.distribution_mode {
            DistributionMode::RoundRobin => {
                let start = self.next_shared.fetch_add(1, Ordering::Relaxed) % shared.len();
                let chosen = &shared[start];
                if chosen.handshake.on_slowness != OnSlowness::Drop {
                    return self.deliver(chosen, &frame).await;
                }
                let ready = (0..shared.len())
                    .map(|k| &shared[(start + k) % shared.len()])
                    .find(|i| !i.queue.lock().is_full());
                match ready {
                    Some(input) => self.deliver(input, &frame).await,
                    None => {
                        self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(channel = %self.channel_id, "No shared input ready, chunk dropped");
                        Ok(())
                    }
                }
            }
            DistributionMode::LoadBalanced => {
                let chosen = shared
                    .iter()
                    .min_by_key(|i| i.queue.lock().len())
                    .map(Arc::clone);
                match chosen {
                    Some(input) => self.deliver(&input, &frame).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Queue `frame` for one input under its `onSlowness` policy.
    async fn deliver(&self, input: &Arc<InputHandle>, frame: &EncodedFrame) -> Result<()> {
        let policy = input.handshake.on_slowness;
        loop {
            if input.is_closed() {
                return Ok(());
            }
            let outcome = input.queue.lock().push(frame.clone(), policy);
            match outcome {
                PushOutcome::Queued => {
                    input.wake_writer.notify_one();
                    return Ok(());
                }
                PushOutcome::DroppedOldest => {
                    self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    input.wake_writer.notify_one();
                    return Ok(());
                }
                PushOutcome::Dropped => {
                    self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                PushOutcome::Full if policy == OnSlowness::Throw => {
                    return Err(KaraboError::Backpressure(format!(
                        "input {} of {} has {} unread chunks",
                        input.id(),
                        self.channel_id,
                        input.handshake.max_queue_length
                    )));
                }
                PushOutcome::Full => input.space.notified().await,
            }
        }
    }
}

async fn accept_loop(inner: Weak<OutputInner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_input(inner.clone(), stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Output channel listener closed");
}

async fn serve_input(inner: Weak<OutputInner>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Could not disable Nagle");
    }
    let (mut rd, mut wr) = stream.into_split();
    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_control(&mut rd)).await {
        Ok(Ok(hello)) => Handshake::from_hash(&hello),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(KaraboError::Timeout("handshake".into())),
    };
    let handshake = match handshake {
        Ok(h) => h,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejecting input connection");
            let refusal = Hash::new().with("ok", false).with("error", e.to_string());
            let _ = write_control(&mut wr, &refusal).await;
            return;
        }
    };
    if let Err(e) = write_control(&mut wr, &Hash::new().with("ok", true)).await {
        warn!(peer = %peer, error = %e, "Handshake reply failed");
        return;
    }
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let handle = strong.attach(handshake);
    drop(strong);

    let result = tokio::select! {
        r = read_requests(&handle, &mut rd) => r,
        r = write_chunks(&inner, &handle, &mut wr) => r,
    };
    if let Err(e) = result {
        warn!(peer = %peer, input = %handle.id(), error = %e, "Input connection closed");
    }
    if let Some(strong) = inner.upgrade() {
        strong.detach(&handle);
    } else {
        handle.close();
    }
}

async fn read_requests(handle: &InputHandle, rd: &mut OwnedReadHalf) -> Result<()> {
    loop {
        let request = read_control(rd).await?;
        match request.get::<String>("reason").as_deref() {
            Ok("update") => {
                handle.demand.fetch_add(1, Ordering::AcqRel);
                handle.wake_writer.notify_one();
            }
            Ok("close") => return Ok(()),
            _ => debug!(input = %handle.id(), "Ignoring control message {}", request),
        }
    }
}

async fn write_chunks(inner: &Weak<OutputInner>, handle: &InputHandle, wr: &mut OwnedWriteHalf) -> Result<()> {
    loop {
        if handle.is_closed() {
            return Ok(());
        }
        let frame = if handle.demand.load(Ordering::Acquire) > 0 {
            handle.queue.lock().pop()
        } else {
            None
        };
        let Some(frame) = frame else {
            handle.wake_writer.notified().await;
            continue;
        };
        handle.demand.fetch_sub(1, Ordering::AcqRel);
        handle.space.notify_one();
        write_frame(wr, &frame).await?;
        if let Some(inner) = inner.upgrade() {
            inner.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            inner
                .stats
                .bytes_sent
                .fetch_add(frame.wire_len() as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputChannelConfig;
    use crate::frame::read_frame;
    use karabo_data::Timestamp;

    fn local() -> OutputChannelConfig {
        OutputChannelConfig {
            hostname: "127.0.0.1".to_string(),
            ..OutputChannelConfig::default()
        }
    }

    async fn raw_input(
        output: &OutputChannel,
        id: &str,
        config: &InputChannelConfig,
    ) -> (OwnedReadHalf, OwnedWriteHalf) {
        let stream = TcpStream::connect(output.local_addr()).await.unwrap();
        let (mut rd, mut wr) = stream.into_split();
        write_control(&mut wr, &Handshake::new(id, config).to_hash())
            .await
            .unwrap();
        assert!(read_control(&mut rd).await.unwrap().get::<bool>("ok").unwrap());
        (rd, wr)
    }

    fn item(n: i32) -> (Hash, ChunkMeta) {
        (Hash::new().with("n", n), ChunkMeta::new("p:output", Timestamp::default()))
    }

    #[tokio::test]
    async fn test_drop_policy_keeps_queue_bound_without_error() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let config = InputChannelConfig::default();
        let _conn = raw_input(&output, "c:input", &config).await;
        output.wait_for_inputs(1, Duration::from_secs(2)).await.unwrap();

        for n in 0..10 {
            let (data, meta) = item(n);
            output.write_chunk(data, meta).await.unwrap();
        }
        assert_eq!(output.queued("c:input"), Some(2));
        assert_eq!(output.stats().chunks_dropped.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_throw_policy_raises_backpressure() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let config = InputChannelConfig {
            on_slowness: OnSlowness::Throw,
            max_queue_length: 1,
            ..InputChannelConfig::default()
        };
        let _conn = raw_input(&output, "c:input", &config).await;
        output.wait_for_inputs(1, Duration::from_secs(2)).await.unwrap();

        let (data, meta) = item(0);
        output.write_chunk(data, meta).await.unwrap();
        let (data, meta) = item(1);
        let err = output.write_chunk(data, meta).await.unwrap_err();
        assert!(matches!(err, KaraboError::Backpressure(_)));
    }

    #[tokio::test]
    async fn test_chunks_flow_on_request_in_order() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let config = InputChannelConfig {
            on_slowness: OnSlowness::Wait,
            max_queue_length: 4,
            ..InputChannelConfig::default()
        };
        let (mut rd, mut wr) = raw_input(&output, "c:input", &config).await;
        output.wait_for_inputs(1, Duration::from_secs(2)).await.unwrap();

        for n in 0..3 {
            let (data, meta) = item(n);
            output.write_chunk(data, meta).await.unwrap();
        }
        output.signal_end_of_stream().await.unwrap();

        let mut seen = Vec::new();
        loop {
            write_control(&mut wr, &Hash::new().with("reason", "update"))
                .await
                .unwrap();
            let frame = read_frame(&mut rd).await.unwrap();
            if frame.end_of_stream {
                break;
            }
            let n = frame.items[0].0.as_hash().unwrap().get::<i32>("n").unwrap();
            seen.push(n);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_shared_inputs_take_turns() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let config = InputChannelConfig {
            data_distribution: DataDistribution::Shared,
            max_queue_length: 10,
            ..InputChannelConfig::default()
        };
        let _a = raw_input(&output, "a:input", &config).await;
        let _b = raw_input(&output, "b:input", &config).await;
        output.wait_for_inputs(2, Duration::from_secs(2)).await.unwrap();

        for n in 0..4 {
            let (data, meta) = item(n);
            output.write_chunk(data, meta).await.unwrap();
        }
        assert_eq!(output.queued("a:input"), Some(2));
        assert_eq!(output.queued("b:input"), Some(2));
    }

    #[tokio::test]
    async fn test_bad_handshake_is_refused() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let stream = TcpStream::connect(output.local_addr()).await.unwrap();
        let (mut rd, mut wr) = stream.into_split();
        write_control(&mut wr, &Hash::new().with("reason", "hello"))
            .await
            .unwrap();
        let reply = read_control(&mut rd).await.unwrap();
        assert!(!reply.get::<bool>("ok").unwrap());
        assert!(output.connected_inputs().is_empty());
    }

    #[tokio::test]
    async fn test_info_advertises_port() {
        let output = OutputChannel::bind("p:output", local()).await.unwrap();
        let info = output.info();
        assert_eq!(info.get::<String>("hostname").unwrap(), "127.0.0.1");
        assert_eq!(
            info.get::<u32>("port").unwrap(),
            u32::from(output.local_addr().port())
        );
    }
}
