//! Binary codec.
//!
//! ```text
//! hash      := u32 count, entry*
//! entry     := u8 keyLen, key, u32 type, u32 attrCount, attr*, payload
//! attr      := u8 keyLen, key, u32 type, payload
//! string    := u32 byteLen, bytes
//! vector    := u32 count, element*
//! schema    := u32 rootNameLen, rootName, hash
//! none      := u32 0
//! ```
//!
//! All integers are little-endian; bools are one byte; complex values are
//! (re, im) pairs.

use bytes::{Buf, BufMut};

use crate::errors::{KaraboError, Result};
use crate::hash::{Attributes, Hash};
use crate::schema::Schema;
use crate::types::ReferenceType;
use crate::value::{Complex, Value};

use super::HashSerializer;

/// The binary [`HashSerializer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySerializer;

impl BinarySerializer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HashSerializer for BinarySerializer {
    fn save(&self, hash: &Hash) -> Result<Vec<u8>> {
        encode_hash(hash)
    }

    fn load(&self, data: &[u8]) -> Result<Hash> {
        decode_hash(data)
    }

    fn save_schema(&self, schema: &Schema) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        write_schema(&mut out, schema)?;
        Ok(out)
    }

    fn load_schema(&self, data: &[u8]) -> Result<Schema> {
        let mut reader = Reader::new(data);
        let schema = reader.schema()?;
        reader.finish()?;
        Ok(schema)
    }
}

/// Encode a Hash into a fresh buffer.
pub fn encode_hash(hash: &Hash) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    write_hash(&mut out, hash)?;
    Ok(out)
}

/// Decode a Hash occupying all of `data`.
pub fn decode_hash(data: &[u8]) -> Result<Hash> {
    let mut reader = Reader::new(data);
    let hash = reader.hash()?;
    reader.finish()?;
    Ok(hash)
}

// =============================================================================
// WRITING
// =============================================================================

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| KaraboError::Parse(format!("length {len} exceeds the u32 range")))?;
    out.put_u32_le(len);
    Ok(())
}

fn write_key(out: &mut Vec<u8>, key: &str) -> Result<()> {
    let len = u8::try_from(key.len())
        .map_err(|_| KaraboError::Parse(format!("key '{key}' is longer than 255 bytes")))?;
    out.put_u8(len);
    out.put_slice(key.as_bytes());
    Ok(())
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    write_len(out, s.len())?;
    out.put_slice(s.as_bytes());
    Ok(())
}

fn write_hash(out: &mut Vec<u8>, hash: &Hash) -> Result<()> {
    write_len(out, hash.len())?;
    for node in hash {
        write_key(out, node.key())?;
        out.put_u32_le(node.value_type().code());
        write_attributes(out, node.attributes())?;
        write_value(out, node.value())?;
    }
    Ok(())
}

fn write_attributes(out: &mut Vec<u8>, attributes: &Attributes) -> Result<()> {
    write_len(out, attributes.len())?;
    for (name, value) in attributes {
        write_key(out, name)?;
        out.put_u32_le(value.value_type().code());
        write_value(out, value)?;
    }
    Ok(())
}

fn write_schema(out: &mut Vec<u8>, schema: &Schema) -> Result<()> {
    write_str(out, schema.root_name())?;
    write_hash(out, schema.parameters())
}

fn write_vec<T>(out: &mut Vec<u8>, items: &[T], mut put: impl FnMut(&mut Vec<u8>, &T)) -> Result<()> {
    write_len(out, items.len())?;
    for item in items {
        put(out, item);
    }
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Bool(b) => out.put_u8(u8::from(*b)),
        Value::VectorBool(v) => write_vec(out, v, |o, b| o.put_u8(u8::from(*b)))?,
        Value::Char(c) => out.put_u8(*c),
        Value::VectorChar(v) => write_vec(out, v, |o, c| o.put_u8(*c))?,
        Value::Int8(x) => out.put_i8(*x),
        Value::VectorInt8(v) => write_vec(out, v, |o, x| o.put_i8(*x))?,
        Value::UInt8(x) => out.put_u8(*x),
        Value::VectorUInt8(v) => write_vec(out, v, |o, x| o.put_u8(*x))?,
        Value::Int16(x) => out.put_i16_le(*x),
        Value::VectorInt16(v) => write_vec(out, v, |o, x| o.put_i16_le(*x))?,
        Value::UInt16(x) => out.put_u16_le(*x),
        Value::VectorUInt16(v) => write_vec(out, v, |o, x| o.put_u16_le(*x))?,
        Value::Int32(x) => out.put_i32_le(*x),
        Value::VectorInt32(v) => write_vec(out, v, |o, x| o.put_i32_le(*x))?,
        Value::UInt32(x) => out.put_u32_le(*x),
        Value::VectorUInt32(v) => write_vec(out, v, |o, x| o.put_u32_le(*x))?,
        Value::Int64(x) => out.put_i64_le(*x),
        Value::VectorInt64(v) => write_vec(out, v, |o, x| o.put_i64_le(*x))?,
        Value::UInt64(x) => out.put_u64_le(*x),
        Value::VectorUInt64(v) => write_vec(out, v, |o, x| o.put_u64_le(*x))?,
        Value::Float(x) => out.put_f32_le(*x),
        Value::VectorFloat(v) => write_vec(out, v, |o, x| o.put_f32_le(*x))?,
        Value::Double(x) => out.put_f64_le(*x),
        Value::VectorDouble(v) => write_vec(out, v, |o, x| o.put_f64_le(*x))?,
        Value::ComplexFloat(c) => {
            out.put_f32_le(c.re);
            out.put_f32_le(c.im);
        }
        Value::VectorComplexFloat(v) => write_vec(out, v, |o, c| {
            o.put_f32_le(c.re);
            o.put_f32_le(c.im);
        })?,
        Value::ComplexDouble(c) => {
            out.put_f64_le(c.re);
            out.put_f64_le(c.im);
        }
        Value::VectorComplexDouble(v) => write_vec(out, v, |o, c| {
            o.put_f64_le(c.re);
            o.put_f64_le(c.im);
        })?,
        Value::String(s) => write_str(out, s)?,
        Value::VectorString(v) => {
            write_len(out, v.len())?;
            for s in v {
                write_str(out, s)?;
            }
        }
        Value::ByteArray(b) => {
            write_len(out, b.len())?;
            out.put_slice(b);
        }
        Value::Hash(h) => write_hash(out, h)?,
        Value::VectorHash(v) => {
            write_len(out, v.len())?;
            for h in v {
                write_hash(out, h)?;
            }
        }
        Value::Schema(s) => write_schema(out, s)?,
        Value::None => out.put_u32_le(0),
    }
    Ok(())
}

// =============================================================================
// READING
// =============================================================================

/// Bounds-checked cursor over an encoded buffer.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(KaraboError::Parse(format!(
                "truncated binary data: need {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(KaraboError::Parse(format!(
                "{} trailing bytes after binary data",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn len(&mut self) -> Result<usize> {
        let len = self.u32()? as usize;
        // every element occupies at least one byte
        if len > self.buf.remaining() {
            return Err(KaraboError::Parse(format!(
                "declared length {len} exceeds remaining {} bytes",
                self.buf.remaining()
            )));
        }
        Ok(len)
    }

    fn utf8(&mut self, n: usize) -> Result<String> {
        let raw = self.bytes(n)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| KaraboError::Parse(format!("invalid UTF-8: {e}")))
    }

    fn key(&mut self) -> Result<String> {
        let n = usize::from(self.u8()?);
        self.utf8(n)
    }

    fn string(&mut self) -> Result<String> {
        let n = self.len()?;
        self.utf8(n)
    }

    fn tag(&mut self) -> Result<ReferenceType> {
        let code = self.u32()?;
        ReferenceType::from_code(code)
            .ok_or_else(|| KaraboError::Parse(format!("unknown type code {code}")))
    }

    fn hash(&mut self) -> Result<Hash> {
        let count = self.len()?;
        let mut hash = Hash::new();
        for _ in 0..count {
            let key = self.key()?;
            let tag = self.tag()?;
            let attributes = self.attributes()?;
            let value = self.value(tag)?;
            if hash.find(&key).is_some() {
                return Err(KaraboError::Parse(format!("duplicate key '{key}'")));
            }
            hash.set_key(&key, value).set_attributes(attributes);
        }
        Ok(hash)
    }

    fn attributes(&mut self) -> Result<Attributes> {
        let count = self.len()?;
        let mut attributes = Attributes::new();
        for _ in 0..count {
            let name = self.key()?;
            let tag = self.tag()?;
            let value = self.value(tag)?;
            attributes.set(&name, value);
        }
        Ok(attributes)
    }

    fn schema(&mut self) -> Result<Schema> {
        let root = self.string()?;
        let parameters = self.hash()?;
        Ok(Schema::from_parameters(&root, parameters))
    }

    fn fixed<T>(&mut self, width: usize, get: impl Fn(&mut &'a [u8]) -> T) -> Result<T> {
        self.need(width)?;
        Ok(get(&mut self.buf))
    }

    fn vector<T>(&mut self, width: usize, get: impl Fn(&mut &'a [u8]) -> T) -> Result<Vec<T>> {
        let count = self.u32()? as usize;
        let total = count
            .checked_mul(width)
            .ok_or_else(|| KaraboError::Parse("vector length overflow".into()))?;
        self.need(total)?;
        Ok((0..count).map(|_| get(&mut self.buf)).collect())
    }

    fn value(&mut self, tag: ReferenceType) -> Result<Value> {
        use ReferenceType as T;
        Ok(match tag {
            T::Bool => Value::Bool(self.u8()? != 0),
            T::VectorBool => Value::VectorBool(self.vector(1, |b| b.get_u8() != 0)?),
            T::Char => Value::Char(self.u8()?),
            T::VectorChar => Value::VectorChar(self.vector(1, |b| b.get_u8())?),
            T::Int8 => Value::Int8(self.fixed(1, |b| b.get_i8())?),
            T::VectorInt8 => Value::VectorInt8(self.vector(1, |b| b.get_i8())?),
            T::UInt8 => Value::UInt8(self.u8()?),
            T::VectorUInt8 => Value::VectorUInt8(self.vector(1, |b| b.get_u8())?),
            T::Int16 => Value::Int16(self.fixed(2, |b| b.get_i16_le())?),
            T::VectorInt16 => Value::VectorInt16(self.vector(2, |b| b.get_i16_le())?),
            T::UInt16 => Value::UInt16(self.fixed(2, |b| b.get_u16_le())?),
            T::VectorUInt16 => Value::VectorUInt16(self.vector(2, |b| b.get_u16_le())?),
            T::Int32 => Value::Int32(self.fixed(4, |b| b.get_i32_le())?),
            T::VectorInt32 => Value::VectorInt32(self.vector(4, |b| b.get_i32_le())?),
            T::UInt32 => Value::UInt32(self.u32()?),
            T::VectorUInt32 => Value::VectorUInt32(self.vector(4, |b| b.get_u32_le())?),
            T::Int64 => Value::Int64(self.fixed(8, |b| b.get_i64_le())?),
            T::VectorInt64 => Value::VectorInt64(self.vector(8, |b| b.get_i64_le())?),
            T::UInt64 => Value::UInt64(self.fixed(8, |b| b.get_u64_le())?),
            T::VectorUInt64 => Value::VectorUInt64(self.vector(8, |b| b.get_u64_le())?),
            T::Float => Value::Float(self.fixed(4, |b| b.get_f32_le())?),
            T::VectorFloat => Value::VectorFloat(self.vector(4, |b| b.get_f32_le())?),
            T::Double => Value::Double(self.fixed(8, |b| b.get_f64_le())?),
            T::VectorDouble => Value::VectorDouble(self.vector(8, |b| b.get_f64_le())?),
            T::ComplexFloat => Value::ComplexFloat(
                self.fixed(8, |b| Complex::new(b.get_f32_le(), b.get_f32_le()))?,
            ),
            T::VectorComplexFloat => Value::VectorComplexFloat(
                self.vector(8, |b| Complex::new(b.get_f32_le(), b.get_f32_le()))?,
            ),
            T::ComplexDouble => Value::ComplexDouble(
                self.fixed(16, |b| Complex::new(b.get_f64_le(), b.get_f64_le()))?,
            ),
            T::VectorComplexDouble => Value::VectorComplexDouble(
                self.vector(16, |b| Complex::new(b.get_f64_le(), b.get_f64_le()))?,
            ),
            T::String => Value::String(self.string()?),
            T::VectorString => {
                let count = self.len()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.string()?);
                }
                Value::VectorString(items)
            }
            T::ByteArray => {
                let n = self.len()?;
                Value::ByteArray(bytes::Bytes::copy_from_slice(self.bytes(n)?))
            }
            T::Hash => Value::Hash(self.hash()?),
            T::VectorHash => {
                let count = self.len()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.hash()?);
                }
                Value::VectorHash(items)
            }
            T::Schema => Value::Schema(self.schema()?),
            T::None => {
                self.u32()?;
                Value::None
            }
        })
    }
}
