//! Single-process broker.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use karabo_data::Result;
use tracing::debug;

use super::{Broker, Subscribers, Subscription};
use crate::message::Message;

/// In-memory implementation of the broker.
///
/// Delivery happens synchronously inside `publish`, so messages from one
/// sender reach each recipient in publish order. Share one instance (in an
/// `Arc`) between all SignalSlotables of a process.
pub struct InMemoryBroker {
    topic: String,
    subscribers: Subscribers,
    published: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("karabo")
    }
}

impl InMemoryBroker {
    #[must_use]
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            subscribers: Subscribers::default(),
            published: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn subscribe(&self, instance_id: &str) -> Result<Subscription> {
        Ok(self.subscribers.add(instance_id))
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        let recipients = self.subscribers.deliver(&message);
        debug!(
            sender = message.sender(),
            function = message.signal_function(),
            recipients = recipients,
            "Published message"
        );
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
