//! TCP broker: a hub process fanning frames out per topic, and its client.
//!
//! Wire: every frame is `u32 length (little endian) | payload`. The first
//! frame a client sends is the binary Hash `Hash("topic", topic)`; every
//! later frame in either direction is one encoded [`Message`]. The hub
//! forwards each frame to every connection of the same topic, the sender's
//! included, and clients filter by addressing.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use karabo_data::io::{decode_hash, encode_hash};
use karabo_data::{Hash, KaraboError, Result};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{Broker, Subscribers, Subscription};
use crate::backoff::Backoff;
use crate::message::Message;

const MAX_FRAME: usize = 64 * 1024 * 1024;

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME}"),
        ));
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_u32_le(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn broker_error(context: &str, e: impl std::fmt::Display) -> KaraboError {
    KaraboError::Broker(format!("{context}: {e}"))
}

// =============================================================================
// Client
// =============================================================================

/// Client connection to a [`BrokerHub`].
///
/// The connection is re-established with backoff when it drops; publishing
/// while disconnected fails with a `Broker` error.
pub struct TcpBroker {
    topic: String,
    subscribers: Arc<Subscribers>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl TcpBroker {
    /// Connect to the first reachable of `addresses` (`host:port`).
    pub async fn connect(addresses: &[String], topic: &str) -> Result<Self> {
        let stream = first_reachable(addresses).await?;
        let subscribers = Arc::new(Subscribers::default());
        let connected = Arc::new(AtomicBool::new(true));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_client(
            stream,
            ClientContext {
                addresses: addresses.to_vec(),
                topic: topic.to_string(),
                subscribers: subscribers.clone(),
                connected: connected.clone(),
            },
            outgoing_rx,
            shutdown_rx,
        ));

        info!(topic = topic, "Connected to broker");
        Ok(Self {
            topic: topic.to_string(),
            subscribers,
            outgoing,
            connected,
            shutdown,
        })
    }

    /// Close the connection for good.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for TcpBroker {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Broker for TcpBroker {
    fn subscribe(&self, instance_id: &str) -> Result<Subscription> {
        Ok(self.subscribers.add(instance_id))
    }

    async fn publish(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(KaraboError::Broker("not connected".into()));
        }
        let bytes = message.encode()?;
        self.outgoing
            .send(bytes)
            .map_err(|_| KaraboError::Broker("connection closed".into()))
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

struct ClientContext {
    addresses: Vec<String>,
    topic: String,
    subscribers: Arc<Subscribers>,
    connected: Arc<AtomicBool>,
}

enum Exit {
    Shutdown,
    Closed,
}

async fn first_reachable(addresses: &[String]) -> Result<TcpStream> {
    for address in addresses {
        match TcpStream::connect(address.as_str()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => warn!(address = %address, error = %e, "Broker not reachable"),
        }
    }
    Err(KaraboError::Broker(format!(
        "no broker reachable at {}",
        addresses.join(",")
    )))
}

async fn run_client(
    mut stream: TcpStream,
    ctx: ClientContext,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::default();
    loop {
        ctx.connected.store(true, Ordering::Release);
        let outcome = serve(stream, &ctx, &mut outgoing, &mut shutdown).await;
        ctx.connected.store(false, Ordering::Release);
        match outcome {
            Ok(Exit::Shutdown) => {
                debug!(topic = %ctx.topic, "Broker client stopped");
                return;
            }
            Ok(Exit::Closed) => warn!(topic = %ctx.topic, "Broker closed the connection"),
            Err(e) => error!(topic = %ctx.topic, error = %e, "Broker connection failed"),
        }

        stream = loop {
            let delay = backoff.next_delay();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            match first_reachable(&ctx.addresses).await {
                Ok(s) => {
                    backoff.reset();
                    info!(topic = %ctx.topic, "Reconnected to broker");
                    break s;
                }
                Err(e) => warn!(error = %e, retry_in_secs = delay.as_secs(), "Broker reconnect failed"),
            }
        };
    }
}

async fn read_loop(mut reader: OwnedReadHalf, subscribers: Arc<Subscribers>) -> io::Result<()> {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match Message::decode(&frame) {
            Ok(message) => {
                subscribers.deliver(&message);
            }
            Err(e) => warn!(error = %e, "Dropping undecodable broker frame"),
        }
    }
}

async fn serve(
    stream: TcpStream,
    ctx: &ClientContext,
    outgoing: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<Exit> {
    let (rd, mut wr) = stream.into_split();
    let hello = encode_hash(&Hash::new().with("topic", ctx.topic.as_str()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    write_frame(&mut wr, &hello).await?;

    let mut reader = tokio::spawn(read_loop(rd, ctx.subscribers.clone()));
    let outcome = loop {
        tokio::select! {
            finished = &mut reader => {
                break match finished {
                    Ok(Ok(())) => Ok(Exit::Closed),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
                };
            }
            bytes = outgoing.recv() => match bytes {
                Some(bytes) => {
                    if let Err(e) = write_frame(&mut wr, &bytes).await {
                        break Err(e);
                    }
                }
                None => break Ok(Exit::Shutdown),
            },
            _ = shutdown.changed() => break Ok(Exit::Shutdown),
        }
    };
    reader.abort();
    outcome
}

// =============================================================================
// Hub
// =============================================================================

#[derive(Default)]
struct HubState {
    next: AtomicU64,
    topics: RwLock<HashMap<String, HashMap<u64, mpsc::UnboundedSender<Bytes>>>>,
}

impl HubState {
    fn forward(&self, topic: &str, frame: &Bytes) {
        if let Some(peers) = self.topics.read().get(topic) {
            for tx in peers.values() {
                let _ = tx.send(frame.clone());
            }
        }
    }

    fn connection_count(&self) -> usize {
        self.topics.read().values().map(HashMap::len).sum()
    }
}

/// Standalone broker serving `tcp://` clients.
pub struct BrokerHub {
    local_addr: SocketAddr,
    state: Arc<HubState>,
    shutdown: watch::Sender<bool>,
}

impl BrokerHub {
    /// Listen on `address` (`host:port`; port 0 picks a free port).
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| broker_error(address, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| broker_error(address, e))?;
        let state = Arc::new(HubState::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, state.clone(), shutdown_rx));
        info!(address = %local_addr, "Broker hub listening");
        Ok(Self {
            local_addr,
            state,
            shutdown,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients connect to.
    #[must_use]
    pub fn url(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    /// Stop accepting and drop every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Resolves once [`shutdown`](Self::shutdown) was called.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for BrokerHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<HubState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_peer(stream, peer, state.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Broker hub stopped accepting");
}

async fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<HubState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let topic = match read_frame(&mut rd)
        .await
        .map_err(|e| e.to_string())
        .and_then(|f| decode_hash(&f).map_err(|e| e.to_string()))
        .and_then(|h| h.get::<String>("topic").map_err(|e| e.to_string()))
    {
        Ok(topic) => topic,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejecting client without topic greeting");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let id = state.next.fetch_add(1, Ordering::Relaxed);
    state.topics.write().entry(topic.clone()).or_default().insert(id, tx);
    info!(peer = %peer, topic = %topic, "Broker client connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut wr, &frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = read_frame(&mut rd) => match frame {
                Ok(frame) => state.forward(&topic, &Bytes::from(frame)),
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        warn!(peer = %peer, error = %e, "Broker client failed");
                    }
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    {
        let mut topics = state.topics.write();
        if let Some(peers) = topics.get_mut(&topic) {
            peers.remove(&id);
            if peers.is_empty() {
                topics.remove(&topic);
            }
        }
    }
    writer.abort();
    info!(peer = %peer, topic = %topic, "Broker client disconnected");
}
