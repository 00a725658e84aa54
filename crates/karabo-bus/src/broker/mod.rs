//! # Broker Port
//!
//! The transport every SignalSlotable publishes to and receives from.
//! Messages are scoped to a topic; within a topic each subscriber receives
//! the messages addressed to its instance id (or broadcast) in the order
//! they were published.
//!
//! Adapters:
//! - [`InMemoryBroker`]: one process, no I/O
//! - [`TcpBroker`]: client of a [`BrokerHub`] reachable by `tcp://` URL

mod memory;
mod tcp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use karabo_data::{KaraboError, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

pub use memory::InMemoryBroker;
pub use tcp::{BrokerHub, TcpBroker};

use crate::config::{BrokerConfig, BrokerScheme};
use crate::message::Message;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Start receiving messages addressed to `instance_id`. Dropping the
    /// subscription ends it.
    fn subscribe(&self, instance_id: &str) -> Result<Subscription>;

    /// Send a message to its recipients.
    async fn publish(&self, message: Message) -> Result<()>;

    fn topic(&self) -> &str;

    /// Whether messages can currently be published.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Connect to the broker named by `config`.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.scheme()? {
        BrokerScheme::Tcp => Ok(Arc::new(
            TcpBroker::connect(&config.addresses(), &config.topic).await?,
        )),
        BrokerScheme::Amqp => Err(KaraboError::Broker(format!(
            "no AMQP client available for '{}'",
            config.urls.join(",")
        ))),
    }
}

/// Receiving end of a broker subscription.
pub struct Subscription {
    instance_id: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Next message, or `None` once the broker went away.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

/// Local fan-out table shared by the adapters.
#[derive(Default)]
pub(crate) struct Subscribers {
    next: AtomicU64,
    entries: RwLock<HashMap<u64, (String, mpsc::UnboundedSender<Message>)>>,
}

impl Subscribers {
    pub(crate) fn add(&self, instance_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(key, (instance_id.to_string(), tx));
        debug!(instance_id = instance_id, "Broker subscription added");
        Subscription {
            instance_id: instance_id.to_string(),
            receiver: rx,
        }
    }

    /// Hand `message` to every matching subscriber. Returns the number of
    /// recipients.
    pub(crate) fn deliver(&self, message: &Message) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let entries = self.entries.read();
            for (key, (id, tx)) in entries.iter() {
                if !message.is_addressed_to(id) {
                    continue;
                }
                if tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*key);
                }
            }
        }
        if !closed.is_empty() {
            let mut entries = self.entries.write();
            for key in closed {
                if let Some((id, _)) = entries.remove(&key) {
                    debug!(instance_id = %id, "Broker subscription dropped");
                }
            }
        }
        delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
