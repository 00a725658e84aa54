//! # Karabo Core
//!
//! The device runtime on top of the bus and the pipeline:
//!
//! - [`fsm`]: table-driven hierarchical state machine
//! - [`device`]: [`Device`], the [`DeviceClass`] / [`DeviceLogic`] extension points
//! - [`registry`] and [`plugins`]: device classes known to a server
//! - [`server`]: the [`DeviceServer`] hosting devices
//!
//! ```text
//! DeviceServer ──slotStartDevice──► DeviceRegistry ──► Device
//!                                                       ├─ SignalSlotable (slots, signals)
//!                                                       ├─ Fsm (state)
//!                                                       └─ Output/Input channels
//! ```

pub mod device;
pub mod fsm;
pub mod plugins;
pub mod registry;
pub mod server;

pub use device::{class_schema, Device, DeviceClass, DeviceLogic, Effects, WeakDevice};
pub use fsm::{Fsm, Machine, MachineBuilder, Outcome, ERROR_FOUND};
pub use plugins::PluginManifest;
pub use registry::{ClassFactory, DeviceRegistry};
pub use server::{DeviceServer, ServerConfig};
