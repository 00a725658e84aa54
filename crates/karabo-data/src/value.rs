//! # Values
//!
//! [`Value`] is the tagged union stored in every [`Hash`] node and attribute.
//! One variant exists per [`ReferenceType`]; the variant *is* the type tag.
//!
//! ## Typed access
//!
//! [`FromValue`] extracts a Rust value from the variant of exactly its own
//! type. Conversions across types go through [`crate::cast`].

use bytes::Bytes;

use crate::hash::Hash;
use crate::schema::Schema;
use crate::types::ReferenceType;

/// A complex number with real and imaginary part.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    #[must_use]
    pub fn new(re: T, im: T) -> Self {
        Self { re, im }
    }
}

/// A typed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    Bool(bool),
    VectorBool(Vec<bool>),
    /// Single byte character.
    Char(u8),
    VectorChar(Vec<u8>),
    Int8(i8),
    VectorInt8(Vec<i8>),
    UInt8(u8),
    VectorUInt8(Vec<u8>),
    Int16(i16),
    VectorInt16(Vec<i16>),
    UInt16(u16),
    VectorUInt16(Vec<u16>),
    Int32(i32),
    VectorInt32(Vec<i32>),
    UInt32(u32),
    VectorUInt32(Vec<u32>),
    Int64(i64),
    VectorInt64(Vec<i64>),
    UInt64(u64),
    VectorUInt64(Vec<u64>),
    Float(f32),
    VectorFloat(Vec<f32>),
    Double(f64),
    VectorDouble(Vec<f64>),
    ComplexFloat(Complex<f32>),
    VectorComplexFloat(Vec<Complex<f32>>),
    ComplexDouble(Complex<f64>),
    VectorComplexDouble(Vec<Complex<f64>>),
    String(String),
    VectorString(Vec<String>),
    Hash(Hash),
    VectorHash(Vec<Hash>),
    Schema(Schema),
    #[default]
    None,
    ByteArray(Bytes),
}

impl Value {
    /// The type tag of this value.
    #[must_use]
    pub fn value_type(&self) -> ReferenceType {
        match self {
            Self::Bool(_) => ReferenceType::Bool,
            Self::VectorBool(_) => ReferenceType::VectorBool,
            Self::Char(_) => ReferenceType::Char,
            Self::VectorChar(_) => ReferenceType::VectorChar,
            Self::Int8(_) => ReferenceType::Int8,
            Self::VectorInt8(_) => ReferenceType::VectorInt8,
            Self::UInt8(_) => ReferenceType::UInt8,
            Self::VectorUInt8(_) => ReferenceType::VectorUInt8,
            Self::Int16(_) => ReferenceType::Int16,
            Self::VectorInt16(_) => ReferenceType::VectorInt16,
            Self::UInt16(_) => ReferenceType::UInt16,
            Self::VectorUInt16(_) => ReferenceType::VectorUInt16,
            Self::Int32(_) => ReferenceType::Int32,
            Self::VectorInt32(_) => ReferenceType::VectorInt32,
            Self::UInt32(_) => ReferenceType::UInt32,
            Self::VectorUInt32(_) => ReferenceType::VectorUInt32,
            Self::Int64(_) => ReferenceType::Int64,
            Self::VectorInt64(_) => ReferenceType::VectorInt64,
            Self::UInt64(_) => ReferenceType::UInt64,
            Self::VectorUInt64(_) => ReferenceType::VectorUInt64,
            Self::Float(_) => ReferenceType::Float,
            Self::VectorFloat(_) => ReferenceType::VectorFloat,
            Self::Double(_) => ReferenceType::Double,
            Self::VectorDouble(_) => ReferenceType::VectorDouble,
            Self::ComplexFloat(_) => ReferenceType::ComplexFloat,
            Self::VectorComplexFloat(_) => ReferenceType::VectorComplexFloat,
            Self::ComplexDouble(_) => ReferenceType::ComplexDouble,
            Self::VectorComplexDouble(_) => ReferenceType::VectorComplexDouble,
            Self::String(_) => ReferenceType::String,
            Self::VectorString(_) => ReferenceType::VectorString,
            Self::Hash(_) => ReferenceType::Hash,
            Self::VectorHash(_) => ReferenceType::VectorHash,
            Self::Schema(_) => ReferenceType::Schema,
            Self::None => ReferenceType::None,
            Self::ByteArray(_) => ReferenceType::ByteArray,
        }
    }

    #[must_use]
    pub fn is_hash(&self) -> bool {
        matches!(self, Self::Hash(_))
    }

    #[must_use]
    pub fn as_hash(&self) -> Option<&Hash> {
        match self {
            Self::Hash(h) => Some(h),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_hash_mut(&mut self) -> Option<&mut Hash> {
        match self {
            Self::Hash(h) => Some(h),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vector_hash(&self) -> Option<&Vec<Hash>> {
        match self {
            Self::VectorHash(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vector_hash_mut(&mut self) -> Option<&mut Vec<Hash>> {
        match self {
            Self::VectorHash(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Number of elements of a vector value; `None` for scalars.
    #[must_use]
    pub fn vector_len(&self) -> Option<usize> {
        Some(match self {
            Self::VectorBool(v) => v.len(),
            Self::VectorChar(v) | Self::VectorUInt8(v) => v.len(),
            Self::VectorInt8(v) => v.len(),
            Self::VectorInt16(v) => v.len(),
            Self::VectorUInt16(v) => v.len(),
            Self::VectorInt32(v) => v.len(),
            Self::VectorUInt32(v) => v.len(),
            Self::VectorInt64(v) => v.len(),
            Self::VectorUInt64(v) => v.len(),
            Self::VectorFloat(v) => v.len(),
            Self::VectorDouble(v) => v.len(),
            Self::VectorComplexFloat(v) => v.len(),
            Self::VectorComplexDouble(v) => v.len(),
            Self::VectorString(v) => v.len(),
            Self::VectorHash(v) => v.len(),
            Self::ByteArray(b) => b.len(),
            _ => return None,
        })
    }

    /// Make this value a Hash (replacing anything else) and return it.
    pub(crate) fn make_hash(&mut self) -> &mut Hash {
        if !self.is_hash() {
            *self = Self::Hash(Hash::new());
        }
        match self {
            Self::Hash(h) => h,
            _ => unreachable!("value was just made a hash"),
        }
    }

    /// Make this value a vector of Hash (replacing anything else) and return it.
    pub(crate) fn make_vector_hash(&mut self) -> &mut Vec<Hash> {
        if !matches!(self, Self::VectorHash(_)) {
            *self = Self::VectorHash(Vec::new());
        }
        match self {
            Self::VectorHash(v) => v,
            _ => unreachable!("value was just made a vector of hash"),
        }
    }
}

/// Extraction of a Rust value from the [`Value`] variant of its own type.
pub trait FromValue: Sized {
    /// The type tag this Rust type maps to.
    const TYPE: ReferenceType;

    /// Exact-type extraction; `None` for any other variant.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! value_mapping {
    ($t:ty, $scalar:ident, $vector:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$scalar(v)
            }
        }

        impl From<Vec<$t>> for Value {
            fn from(v: Vec<$t>) -> Self {
                Value::$vector(v)
            }
        }

        impl FromValue for $t {
            const TYPE: ReferenceType = ReferenceType::$scalar;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$scalar(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl FromValue for Vec<$t> {
            const TYPE: ReferenceType = ReferenceType::$vector;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$vector(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

value_mapping!(bool, Bool, VectorBool);
value_mapping!(i8, Int8, VectorInt8);
value_mapping!(u8, UInt8, VectorUInt8);
value_mapping!(i16, Int16, VectorInt16);
value_mapping!(u16, UInt16, VectorUInt16);
value_mapping!(i32, Int32, VectorInt32);
value_mapping!(u32, UInt32, VectorUInt32);
value_mapping!(i64, Int64, VectorInt64);
value_mapping!(u64, UInt64, VectorUInt64);
value_mapping!(f32, Float, VectorFloat);
value_mapping!(f64, Double, VectorDouble);
value_mapping!(Complex<f32>, ComplexFloat, VectorComplexFloat);
value_mapping!(Complex<f64>, ComplexDouble, VectorComplexDouble);
value_mapping!(String, String, VectorString);
value_mapping!(Hash, Hash, VectorHash);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<Vec<&str>> for Value {
    fn from(v: Vec<&str>) -> Self {
        Value::VectorString(v.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Value {
    fn from(v: &[&str]) -> Self {
        Value::VectorString(v.iter().map(|s| (*s).to_string()).collect())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::ByteArray(v)
    }
}

impl From<Schema> for Value {
    fn from(v: Schema) -> Self {
        Value::Schema(v)
    }
}

impl From<&Hash> for Value {
    fn from(v: &Hash) -> Self {
        Value::Hash(v.clone())
    }
}

impl FromValue for Bytes {
    const TYPE: ReferenceType = ReferenceType::ByteArray;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::ByteArray(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromValue for Schema {
    const TYPE: ReferenceType = ReferenceType::Schema;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Schema(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for Value {
    const TYPE: ReferenceType = ReferenceType::None;

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_is_type_tag() {
        assert_eq!(Value::from(12345i16).value_type(), ReferenceType::Int16);
        assert_eq!(Value::from("x").value_type(), ReferenceType::String);
        assert_eq!(
            Value::from(vec![Hash::new()]).value_type(),
            ReferenceType::VectorHash
        );
        assert_eq!(Value::default().value_type(), ReferenceType::None);
    }

    #[test]
    fn test_from_value_is_exact() {
        let v = Value::from(7i32);
        assert_eq!(i32::from_value(&v), Some(7));
        assert_eq!(i64::from_value(&v), None);
    }

    #[test]
    fn test_make_hash_replaces_scalar() {
        let mut v = Value::from(1u8);
        v.make_hash();
        assert!(v.is_hash());
    }
}
