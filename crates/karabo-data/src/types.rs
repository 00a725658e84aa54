//! # Type Tags
//!
//! The closed, wire-stable set of value types. Binary codes are fixed: new
//! types may only be appended at the end of the enumeration.

use std::fmt;
use std::str::FromStr;

use crate::errors::{KaraboError, Result};

/// Type tag of every value stored in a [`Hash`](crate::Hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ReferenceType {
    Bool = 0,
    VectorBool = 1,
    Char = 2,
    VectorChar = 3,
    Int8 = 4,
    VectorInt8 = 5,
    UInt8 = 6,
    VectorUInt8 = 7,
    Int16 = 8,
    VectorInt16 = 9,
    UInt16 = 10,
    VectorUInt16 = 11,
    Int32 = 12,
    VectorInt32 = 13,
    UInt32 = 14,
    VectorUInt32 = 15,
    Int64 = 16,
    VectorInt64 = 17,
    UInt64 = 18,
    VectorUInt64 = 19,
    Float = 20,
    VectorFloat = 21,
    Double = 22,
    VectorDouble = 23,
    ComplexFloat = 24,
    VectorComplexFloat = 25,
    ComplexDouble = 26,
    VectorComplexDouble = 27,
    String = 28,
    VectorString = 29,
    Hash = 30,
    VectorHash = 31,
    Schema = 32,
    None = 35,
    ByteArray = 37,
}

const ALL: [ReferenceType; 35] = [
    ReferenceType::Bool,
    ReferenceType::VectorBool,
    ReferenceType::Char,
    ReferenceType::VectorChar,
    ReferenceType::Int8,
    ReferenceType::VectorInt8,
    ReferenceType::UInt8,
    ReferenceType::VectorUInt8,
    ReferenceType::Int16,
    ReferenceType::VectorInt16,
    ReferenceType::UInt16,
    ReferenceType::VectorUInt16,
    ReferenceType::Int32,
    ReferenceType::VectorInt32,
    ReferenceType::UInt32,
    ReferenceType::VectorUInt32,
    ReferenceType::Int64,
    ReferenceType::VectorInt64,
    ReferenceType::UInt64,
    ReferenceType::VectorUInt64,
    ReferenceType::Float,
    ReferenceType::VectorFloat,
    ReferenceType::Double,
    ReferenceType::VectorDouble,
    ReferenceType::ComplexFloat,
    ReferenceType::VectorComplexFloat,
    ReferenceType::ComplexDouble,
    ReferenceType::VectorComplexDouble,
    ReferenceType::String,
    ReferenceType::VectorString,
    ReferenceType::Hash,
    ReferenceType::VectorHash,
    ReferenceType::Schema,
    ReferenceType::None,
    ReferenceType::ByteArray,
];

impl ReferenceType {
    /// Every known type, in code order.
    #[must_use]
    pub fn all() -> &'static [ReferenceType] {
        &ALL
    }

    /// Stable binary code.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a type by its binary code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Canonical upper-case name (`INT32`, `VECTOR_HASH`, ...).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::VectorBool => "VECTOR_BOOL",
            Self::Char => "CHAR",
            Self::VectorChar => "VECTOR_CHAR",
            Self::Int8 => "INT8",
            Self::VectorInt8 => "VECTOR_INT8",
            Self::UInt8 => "UINT8",
            Self::VectorUInt8 => "VECTOR_UINT8",
            Self::Int16 => "INT16",
            Self::VectorInt16 => "VECTOR_INT16",
            Self::UInt16 => "UINT16",
            Self::VectorUInt16 => "VECTOR_UINT16",
            Self::Int32 => "INT32",
            Self::VectorInt32 => "VECTOR_INT32",
            Self::UInt32 => "UINT32",
            Self::VectorUInt32 => "VECTOR_UINT32",
            Self::Int64 => "INT64",
            Self::VectorInt64 => "VECTOR_INT64",
            Self::UInt64 => "UINT64",
            Self::VectorUInt64 => "VECTOR_UINT64",
            Self::Float => "FLOAT",
            Self::VectorFloat => "VECTOR_FLOAT",
            Self::Double => "DOUBLE",
            Self::VectorDouble => "VECTOR_DOUBLE",
            Self::ComplexFloat => "COMPLEX_FLOAT",
            Self::VectorComplexFloat => "VECTOR_COMPLEX_FLOAT",
            Self::ComplexDouble => "COMPLEX_DOUBLE",
            Self::VectorComplexDouble => "VECTOR_COMPLEX_DOUBLE",
            Self::String => "STRING",
            Self::VectorString => "VECTOR_STRING",
            Self::Hash => "HASH",
            Self::VectorHash => "VECTOR_HASH",
            Self::Schema => "SCHEMA",
            Self::None => "NONE",
            Self::ByteArray => "BYTE_ARRAY",
        }
    }

    /// Look up a type by its canonical name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ALL.iter().copied().find(|t| t.name() == name)
    }

    /// True for the `VECTOR_*` family (including `VECTOR_HASH`).
    #[must_use]
    pub fn is_vector(self) -> bool {
        self.element_type().is_some()
    }

    /// Element type of a vector type.
    #[must_use]
    pub fn element_type(self) -> Option<Self> {
        Some(match self {
            Self::VectorBool => Self::Bool,
            Self::VectorChar => Self::Char,
            Self::VectorInt8 => Self::Int8,
            Self::VectorUInt8 => Self::UInt8,
            Self::VectorInt16 => Self::Int16,
            Self::VectorUInt16 => Self::UInt16,
            Self::VectorInt32 => Self::Int32,
            Self::VectorUInt32 => Self::UInt32,
            Self::VectorInt64 => Self::Int64,
            Self::VectorUInt64 => Self::UInt64,
            Self::VectorFloat => Self::Float,
            Self::VectorDouble => Self::Double,
            Self::VectorComplexFloat => Self::ComplexFloat,
            Self::VectorComplexDouble => Self::ComplexDouble,
            Self::VectorString => Self::String,
            Self::VectorHash => Self::Hash,
            _ => return None,
        })
    }

    /// Vector type whose elements are `self`.
    #[must_use]
    pub fn vector_type(self) -> Option<Self> {
        ALL.iter()
            .copied()
            .find(|t| t.element_type() == Some(self))
    }

    /// Scalars that take part in numeric promotion (bool and char included).
    #[must_use]
    pub fn is_numeric_scalar(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::Char
                | Self::Int8
                | Self::UInt8
                | Self::Int16
                | Self::UInt16
                | Self::Int32
                | Self::UInt32
                | Self::Int64
                | Self::UInt64
                | Self::Float
                | Self::Double
        )
    }

    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Self::ComplexFloat | Self::ComplexDouble)
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReferenceType {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| KaraboError::Parse(format!("unknown type name '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ReferenceType::Bool.code(), 0);
        assert_eq!(ReferenceType::Int16.code(), 8);
        assert_eq!(ReferenceType::String.code(), 28);
        assert_eq!(ReferenceType::Hash.code(), 30);
        assert_eq!(ReferenceType::VectorHash.code(), 31);
        assert_eq!(ReferenceType::Schema.code(), 32);
        assert_eq!(ReferenceType::None.code(), 35);
        assert_eq!(ReferenceType::ByteArray.code(), 37);
    }

    #[test]
    fn test_name_and_code_lookup_agree() {
        for t in ReferenceType::all() {
            assert_eq!(ReferenceType::from_code(t.code()), Some(*t));
            assert_eq!(ReferenceType::from_name(t.name()), Some(*t));
        }
        assert_eq!(ReferenceType::from_code(33), None);
    }

    #[test]
    fn test_vector_element_relation() {
        assert_eq!(
            ReferenceType::VectorInt32.element_type(),
            Some(ReferenceType::Int32)
        );
        assert_eq!(
            ReferenceType::Double.vector_type(),
            Some(ReferenceType::VectorDouble)
        );
        assert!(ReferenceType::VectorHash.is_vector());
        assert!(!ReferenceType::ByteArray.is_vector());
        assert_eq!(ReferenceType::Schema.vector_type(), None);
    }
}
