//! # Serializers
//!
//! Two interchangeable codecs for [`Hash`] and [`Schema`]:
//!
//! - [`BinarySerializer`]: length-prefixed little-endian wire format used on
//!   the broker and p2p channels
//! - [`XmlSerializer`]: the canonical `<root KRB_Artificial="">` text form
//!
//! Both encode a top-level vector of Hash as a one-key Hash holding a
//! `KRB_Sequence` entry. [`file`] picks a codec from a file extension.

mod binary;
pub mod file;
mod xml;

pub use binary::{decode_hash, encode_hash, BinarySerializer};
pub use file::{load_from_file, load_schema_from_file, save_schema_to_file, save_to_file};
pub use xml::XmlSerializer;

use crate::errors::{KaraboError, Result};
use crate::hash::Hash;
use crate::schema::Schema;
use crate::value::Value;

/// Key wrapping a top-level vector of Hash.
pub const SEQUENCE_KEY: &str = "KRB_Sequence";

/// A Hash/Schema codec.
pub trait HashSerializer {
    /// Encode a Hash.
    fn save(&self, hash: &Hash) -> Result<Vec<u8>>;

    /// Decode a Hash.
    fn load(&self, data: &[u8]) -> Result<Hash>;

    /// Encode a Schema.
    fn save_schema(&self, schema: &Schema) -> Result<Vec<u8>>;

    /// Decode a Schema.
    fn load_schema(&self, data: &[u8]) -> Result<Schema>;

    /// Encode a vector of Hash under the sequence convention.
    fn save_sequence(&self, items: &[Hash]) -> Result<Vec<u8>> {
        let mut wrapper = Hash::new();
        wrapper.set_key(SEQUENCE_KEY, Value::VectorHash(items.to_vec()));
        self.save(&wrapper)
    }

    /// Decode a vector of Hash written by [`save_sequence`](Self::save_sequence).
    fn load_sequence(&self, data: &[u8]) -> Result<Vec<Hash>> {
        let mut hash = self.load(data)?;
        unwrap_sequence(&mut hash)
            .ok_or_else(|| KaraboError::Parse(format!("no {SEQUENCE_KEY} found")))
    }
}

/// Take the vector out of a one-key sequence wrapper.
pub(crate) fn unwrap_sequence(hash: &mut Hash) -> Option<Vec<Hash>> {
    if hash.len() != 1 {
        return None;
    }
    match hash.get_value_mut(SEQUENCE_KEY).ok()? {
        Value::VectorHash(items) => Some(std::mem::take(items)),
        _ => None,
    }
}
