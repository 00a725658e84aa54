//! # Karabo Data
//!
//! The data layer shared by every Karabo process:
//!
//! - [`Hash`]: ordered, path-addressable tree of typed, attributed values
//! - [`ReferenceType`] and [`cast`]: the closed type system and its conversions
//! - [`io`]: binary and XML codecs, file persistence
//! - [`Schema`] with its element builders, and the [`validator`]
//! - [`time`]: epoch and train stamps
//! - [`State`]: the state vocabulary with its derivation tree

pub mod cast;
pub mod errors;
pub mod hash;
pub mod io;
pub mod schema;
pub mod state;
pub mod time;
pub mod types;
pub mod validator;
pub mod value;

pub use errors::{ErrorKind, KaraboError, Result, Violation, ViolationKind};
pub use hash::{Attributes, Hash, MergePolicy, Node};
pub use schema::{AccessLevel, AccessMode, AssemblyRules, Assignment, NodeType, Schema};
pub use state::State;
pub use time::{Epochstamp, Timestamp, Trainstamp};
pub use types::ReferenceType;
pub use validator::{ValidationContext, ValidationReport, ValidationRules, Validator};
pub use value::{Complex, FromValue, Value};
