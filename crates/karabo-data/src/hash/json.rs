//! Bridge between [`Hash`] and `serde_json::Value`.
//!
//! Attributes are not represented in JSON. Integers map to `INT32` when they
//! fit, `INT64`/`UINT64` otherwise; other numbers to `DOUBLE`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{Map, Number, Value as Json};

use crate::errors::{KaraboError, Result};
use crate::value::Value;

use super::Hash;

impl Hash {
    /// Build a Hash from a JSON object.
    pub fn from_json(json: &Json) -> Result<Hash> {
        match json {
            Json::Object(map) => {
                let mut hash = Hash::new();
                for (key, item) in map {
                    hash.set_key(key, json_to_value(item, key)?);
                }
                Ok(hash)
            }
            other => Err(KaraboError::Parse(format!(
                "expected a JSON object, found {other}"
            ))),
        }
    }

    /// Parse JSON text into a Hash.
    pub fn from_json_str(text: &str) -> Result<Hash> {
        let json: Json =
            serde_json::from_str(text).map_err(|e| KaraboError::Parse(e.to_string()))?;
        Self::from_json(&json)
    }

    /// Render as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        for node in self {
            map.insert(node.key().to_string(), value_to_json(node.value()));
        }
        Json::Object(map)
    }
}

fn number_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        match i32::try_from(i) {
            Ok(small) => Value::Int32(small),
            Err(_) => Value::Int64(i),
        }
    } else if let Some(u) = n.as_u64() {
        Value::UInt64(u)
    } else {
        Value::Double(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn json_to_value(json: &Json, key: &str) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => number_value(n),
        Json::String(s) => Value::String(s.clone()),
        Json::Object(_) => Value::Hash(Hash::from_json(json)?),
        Json::Array(items) => array_to_value(items, key)?,
    })
}

fn array_to_value(items: &[Json], key: &str) -> Result<Value> {
    let mixed = || KaraboError::Parse(format!("array '{key}' mixes element types"));
    let Some(first) = items.first() else {
        return Ok(Value::VectorString(Vec::new()));
    };
    Ok(match first {
        Json::Bool(_) => Value::VectorBool(
            items
                .iter()
                .map(|i| i.as_bool().ok_or_else(mixed))
                .collect::<Result<_>>()?,
        ),
        Json::String(_) => Value::VectorString(
            items
                .iter()
                .map(|i| i.as_str().map(str::to_string).ok_or_else(mixed))
                .collect::<Result<_>>()?,
        ),
        Json::Object(_) => Value::VectorHash(
            items
                .iter()
                .map(|i| match i {
                    Json::Object(_) => Hash::from_json(i),
                    _ => Err(mixed()),
                })
                .collect::<Result<_>>()?,
        ),
        Json::Number(_) => {
            if items.iter().all(|i| i.as_i64().is_some()) {
                let ints: Vec<i64> = items.iter().filter_map(Json::as_i64).collect();
                if ints.iter().all(|i| i32::try_from(*i).is_ok()) {
                    Value::VectorInt32(ints.iter().filter_map(|i| i32::try_from(*i).ok()).collect())
                } else {
                    Value::VectorInt64(ints)
                }
            } else {
                Value::VectorDouble(
                    items
                        .iter()
                        .map(|i| i.as_f64().ok_or_else(mixed))
                        .collect::<Result<_>>()?,
                )
            }
        }
        Json::Null | Json::Array(_) => return Err(mixed()),
    })
}

fn float_json(x: f64) -> Json {
    Number::from_f64(x).map_or(Json::Null, Json::Number)
}

fn list<T>(items: &[T], f: impl Fn(&T) -> Json) -> Json {
    Json::Array(items.iter().map(f).collect())
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::VectorBool(v) => list(v, |b| Json::Bool(*b)),
        Value::Char(c) => Json::String(char::from(*c).to_string()),
        Value::VectorChar(v) => Json::String(BASE64.encode(v)),
        Value::ByteArray(b) => Json::String(BASE64.encode(b)),
        Value::Int8(v) => Json::from(*v),
        Value::VectorInt8(v) => list(v, |x| Json::from(*x)),
        Value::UInt8(v) => Json::from(*v),
        Value::VectorUInt8(v) => list(v, |x| Json::from(*x)),
        Value::Int16(v) => Json::from(*v),
        Value::VectorInt16(v) => list(v, |x| Json::from(*x)),
        Value::UInt16(v) => Json::from(*v),
        Value::VectorUInt16(v) => list(v, |x| Json::from(*x)),
        Value::Int32(v) => Json::from(*v),
        Value::VectorInt32(v) => list(v, |x| Json::from(*x)),
        Value::UInt32(v) => Json::from(*v),
        Value::VectorUInt32(v) => list(v, |x| Json::from(*x)),
        Value::Int64(v) => Json::from(*v),
        Value::VectorInt64(v) => list(v, |x| Json::from(*x)),
        Value::UInt64(v) => Json::from(*v),
        Value::VectorUInt64(v) => list(v, |x| Json::from(*x)),
        Value::Float(v) => float_json(f64::from(*v)),
        Value::VectorFloat(v) => list(v, |x| float_json(f64::from(*x))),
        Value::Double(v) => float_json(*v),
        Value::VectorDouble(v) => list(v, |x| float_json(*x)),
        Value::ComplexFloat(c) => list(&[c.re, c.im], |x| float_json(f64::from(*x))),
        Value::VectorComplexFloat(v) => list(v, |c| {
            list(&[c.re, c.im], |x| float_json(f64::from(*x)))
        }),
        Value::ComplexDouble(c) => list(&[c.re, c.im], |x| float_json(*x)),
        Value::VectorComplexDouble(v) => list(v, |c| list(&[c.re, c.im], |x| float_json(*x))),
        Value::String(s) => Json::String(s.clone()),
        Value::VectorString(v) => list(v, |s| Json::String(s.clone())),
        Value::Hash(h) => h.to_json(),
        Value::VectorHash(v) => list(v, Hash::to_json),
        Value::Schema(s) => s.parameters().to_json(),
    }
}
