//! # Karabo Pipeline
//!
//! Point-to-point data channels between devices, outside the broker.
//!
//! An [`OutputChannel`] listens on TCP and pushes chunks to the inputs that
//! connected to it; an [`InputChannel`] connects to the outputs named in its
//! `connectedOutputChannels` and pulls chunks as the consumer reads them.
//!
//! ## Wire format
//!
//! Control messages (`hello`, `update`) are a single `u32 LE length | Hash`.
//! Data frames are `u32 LE length | header Hash | u32 LE length | body`: the
//! header lists per-item metadata and the body concatenates the serialized
//! items.

pub mod config;
pub mod frame;
pub mod input;
pub mod output;
pub mod queue;
pub mod resolver;

pub use config::{
    DataDistribution, DistributionMode, Handshake, InputChannelConfig, OnSlowness, OutputChannelConfig,
    DEFAULT_HOSTNAME, DEFAULT_MAX_QUEUE_LENGTH,
};
pub use frame::{ChunkMeta, EncodedFrame, Frame, Payload};
pub use input::{InputChannel, InputEvent};
pub use output::{OutputChannel, OutputStats};
pub use queue::{ChunkQueue, PushOutcome};
pub use resolver::{split_channel_id, ChannelResolver, StaticResolver};
