//! # Karabo Test Suite
//!
//! Cross-crate scenarios that need more than one layer of the stack.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── codec.rs        # Hash order and codec properties, file formats
//!     ├── validation.rs   # Validator idempotence, schema injection
//!     ├── messaging.rs    # request/reply and signals over the TCP hub
//!     ├── pipeline.rs     # device to device data flow
//!     └── server.rs       # device server driven over the broker
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p karabo-tests
//! cargo test -p karabo-tests integration::pipeline::
//! ```

pub mod integration;
