//! # Karabo Bus
//!
//! Messaging between Karabo instances over a topic-scoped broker.
//!
//! - [`broker`]: the broker port plus in-memory and TCP adapters
//! - [`message`]: the header routing fields of a broker message
//! - [`signal_slotable`]: slots, signals, request/reply, heartbeats
//! - [`topology`]: the live directory of known instances
//!
//! ```text
//! let broker = Arc::new(InMemoryBroker::default());
//! let ss = SignalSlotable::new("motor", broker, SignalSlotableConfig::default());
//! ss.register_slot("slotMove", |call| async move { ... });
//! ss.start().await?;
//! ```

pub mod args;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod message;
pub mod pending;
pub mod signal_slotable;
pub mod topology;

pub use args::{arg, SlotArgs};
pub use backoff::Backoff;
pub use broker::{connect, Broker, BrokerHub, InMemoryBroker, Subscription, TcpBroker};
pub use config::{BrokerConfig, BrokerScheme};
pub use message::Message;
pub use pending::{PendingReplies, PendingStats};
pub use signal_slotable::{
    reply, Requestor, SignalSlotable, SignalSlotableConfig, SlotCall, SlotFuture,
    WeakSignalSlotable,
};
pub use topology::{HeartbeatOutcome, InstanceEvent, Topology};
