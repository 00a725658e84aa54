//! # Type Coercion
//!
//! The deterministic cast table behind `Hash::get_as`.
//!
//! ## Rules
//!
//! - integer to wider integer always succeeds; narrowing only if the value fits
//! - integer to float only if representable exactly; float to integer only
//!   for integral, in-range values
//! - bool and integers map to 0/1
//! - any number to string yields its decimal text (`%.15g` for doubles)
//! - string to number parses the same grammar
//! - a scalar becomes a one-element vector; a one-element vector a scalar
//! - a vector becomes a comma-joined string
//! - byte arrays and char vectors are base64 text
//!
//! Anything that would lose bits or range fails with [`KaraboError::Cast`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;

use crate::errors::{KaraboError, Result};
use crate::types::ReferenceType;
use crate::value::{Complex, Value};

/// Convert `value` to `target`.
pub fn convert(value: &Value, target: ReferenceType) -> Result<Value> {
    let source = value.value_type();
    if source == target {
        return Ok(value.clone());
    }
    match (value, target) {
        (_, ReferenceType::String) => to_text(value).map(Value::String),
        (Value::String(s), _) => from_text(s, target),
        (Value::ByteArray(b), ReferenceType::VectorUInt8) => Ok(Value::VectorUInt8(b.to_vec())),
        (Value::ByteArray(b), ReferenceType::VectorChar) => Ok(Value::VectorChar(b.to_vec())),
        (Value::VectorUInt8(v) | Value::VectorChar(v), ReferenceType::ByteArray) => {
            Ok(Value::ByteArray(Bytes::from(v.clone())))
        }
        _ if is_scalar(source) && is_scalar(target) => scalar_to_scalar(value, target),
        _ if is_scalar(source) => match target.element_type() {
            Some(element) if is_scalar(element) => {
                let item = scalar_to_scalar(value, element)?;
                from_elements(target, vec![item])
            }
            _ => Err(cast_error(value, target)),
        },
        _ => match elements(value) {
            Some(items) if is_scalar(target) => {
                if items.len() == 1 {
                    scalar_to_scalar(&items[0], target)
                } else {
                    Err(cast_error(value, target))
                }
            }
            Some(items) => match target.element_type() {
                Some(element) if is_scalar(element) => {
                    let converted = items
                        .iter()
                        .map(|item| scalar_to_scalar(item, element))
                        .collect::<Result<Vec<_>>>()?;
                    from_elements(target, converted)
                }
                _ => Err(cast_error(value, target)),
            },
            None => Err(cast_error(value, target)),
        },
    }
}

/// True when `get` may silently convert between the two types.
///
/// Only numeric promotions qualify; everything else needs `get_as`.
#[must_use]
pub fn is_implicit(source: ReferenceType, target: ReferenceType) -> bool {
    let numeric = |t: ReferenceType| t.is_numeric_scalar() || t.is_complex();
    match (source.element_type(), target.element_type()) {
        (None, None) => numeric(source) && numeric(target),
        (Some(s), Some(t)) => numeric(s) && numeric(t),
        _ => false,
    }
}

fn is_scalar(t: ReferenceType) -> bool {
    t.is_numeric_scalar() || t.is_complex() || t == ReferenceType::String
}

fn cast_error(value: &Value, target: ReferenceType) -> KaraboError {
    KaraboError::Cast(format!("cannot cast {} to {}", value.value_type(), target))
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i128),
    Real(f64),
    Complex(f64, f64),
}

fn number_of(value: &Value) -> Option<Number> {
    Some(match value {
        Value::Bool(b) => Number::Int(i128::from(*b)),
        Value::Char(c) => Number::Int(i128::from(*c)),
        Value::Int8(v) => Number::Int(i128::from(*v)),
        Value::UInt8(v) => Number::Int(i128::from(*v)),
        Value::Int16(v) => Number::Int(i128::from(*v)),
        Value::UInt16(v) => Number::Int(i128::from(*v)),
        Value::Int32(v) => Number::Int(i128::from(*v)),
        Value::UInt32(v) => Number::Int(i128::from(*v)),
        Value::Int64(v) => Number::Int(i128::from(*v)),
        Value::UInt64(v) => Number::Int(i128::from(*v)),
        Value::Float(v) => Number::Real(f64::from(*v)),
        Value::Double(v) => Number::Real(*v),
        Value::ComplexFloat(c) => Number::Complex(f64::from(c.re), f64::from(c.im)),
        Value::ComplexDouble(c) => Number::Complex(c.re, c.im),
        _ => return None,
    })
}

fn scalar_to_scalar(value: &Value, target: ReferenceType) -> Result<Value> {
    if value.value_type() == target {
        return Ok(value.clone());
    }
    if let Value::String(s) = value {
        return from_text(s, target);
    }
    if target == ReferenceType::String {
        return to_text(value).map(Value::String);
    }
    let number = number_of(value).ok_or_else(|| cast_error(value, target))?;
    number_to(number, target).ok_or_else(|| cast_error(value, target))
}

fn integral(n: Number) -> Option<i128> {
    match n {
        Number::Int(i) => Some(i),
        Number::Real(x) => float_integral(x),
        Number::Complex(x, im) if im == 0.0 => float_integral(x),
        Number::Complex(..) => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn float_integral(x: f64) -> Option<i128> {
    (x.is_finite() && x.fract() == 0.0 && x.abs() < 1.0e38).then(|| x as i128)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn real(n: Number) -> Option<f64> {
    match n {
        Number::Int(i) => {
            let x = i as f64;
            (x as i128 == i).then_some(x)
        }
        Number::Real(x) => Some(x),
        Number::Complex(x, im) if im == 0.0 => Some(x),
        Number::Complex(..) => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn narrow_f32(x: f64) -> Option<f32> {
    let f = x as f32;
    (x.is_nan() || f64::from(f) == x).then_some(f)
}

fn number_to(n: Number, target: ReferenceType) -> Option<Value> {
    Some(match target {
        ReferenceType::Bool => match integral(n)? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => return None,
        },
        ReferenceType::Char => Value::Char(u8::try_from(integral(n)?).ok()?),
        ReferenceType::Int8 => Value::Int8(i8::try_from(integral(n)?).ok()?),
        ReferenceType::UInt8 => Value::UInt8(u8::try_from(integral(n)?).ok()?),
        ReferenceType::Int16 => Value::Int16(i16::try_from(integral(n)?).ok()?),
        ReferenceType::UInt16 => Value::UInt16(u16::try_from(integral(n)?).ok()?),
        ReferenceType::Int32 => Value::Int32(i32::try_from(integral(n)?).ok()?),
        ReferenceType::UInt32 => Value::UInt32(u32::try_from(integral(n)?).ok()?),
        ReferenceType::Int64 => Value::Int64(i64::try_from(integral(n)?).ok()?),
        ReferenceType::UInt64 => Value::UInt64(u64::try_from(integral(n)?).ok()?),
        ReferenceType::Float => Value::Float(narrow_f32(real(n)?)?),
        ReferenceType::Double => Value::Double(real(n)?),
        ReferenceType::ComplexFloat => {
            let (re, im) = match n {
                Number::Complex(re, im) => (re, im),
                other => (real(other)?, 0.0),
            };
            Value::ComplexFloat(Complex::new(narrow_f32(re)?, narrow_f32(im)?))
        }
        ReferenceType::ComplexDouble => {
            let (re, im) = match n {
                Number::Complex(re, im) => (re, im),
                other => (real(other)?, 0.0),
            };
            Value::ComplexDouble(Complex::new(re, im))
        }
        _ => return None,
    })
}

/// Split a vector value into scalar values.
fn elements(value: &Value) -> Option<Vec<Value>> {
    fn wrap<T: Clone>(v: &[T], f: impl Fn(T) -> Value) -> Vec<Value> {
        v.iter().cloned().map(f).collect()
    }
    Some(match value {
        Value::VectorBool(v) => wrap(v, Value::Bool),
        Value::VectorChar(v) => wrap(v, Value::Char),
        Value::VectorInt8(v) => wrap(v, Value::Int8),
        Value::VectorUInt8(v) => wrap(v, Value::UInt8),
        Value::VectorInt16(v) => wrap(v, Value::Int16),
        Value::VectorUInt16(v) => wrap(v, Value::UInt16),
        Value::VectorInt32(v) => wrap(v, Value::Int32),
        Value::VectorUInt32(v) => wrap(v, Value::UInt32),
        Value::VectorInt64(v) => wrap(v, Value::Int64),
        Value::VectorUInt64(v) => wrap(v, Value::UInt64),
        Value::VectorFloat(v) => wrap(v, Value::Float),
        Value::VectorDouble(v) => wrap(v, Value::Double),
        Value::VectorComplexFloat(v) => wrap(v, Value::ComplexFloat),
        Value::VectorComplexDouble(v) => wrap(v, Value::ComplexDouble),
        Value::VectorString(v) => wrap(v, Value::String),
        _ => return None,
    })
}

/// Rebuild a vector value of type `target` from scalars of its element type.
fn from_elements(target: ReferenceType, items: Vec<Value>) -> Result<Value> {
    macro_rules! collect {
        ($variant:ident, $vector:ident) => {
            Value::$vector(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::$variant(x) => Ok(x),
                        other => Err(cast_error(&other, target)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
        };
    }
    Ok(match target {
        ReferenceType::VectorBool => collect!(Bool, VectorBool),
        ReferenceType::VectorChar => collect!(Char, VectorChar),
        ReferenceType::VectorInt8 => collect!(Int8, VectorInt8),
        ReferenceType::VectorUInt8 => collect!(UInt8, VectorUInt8),
        ReferenceType::VectorInt16 => collect!(Int16, VectorInt16),
        ReferenceType::VectorUInt16 => collect!(UInt16, VectorUInt16),
        ReferenceType::VectorInt32 => collect!(Int32, VectorInt32),
        ReferenceType::VectorUInt32 => collect!(UInt32, VectorUInt32),
        ReferenceType::VectorInt64 => collect!(Int64, VectorInt64),
        ReferenceType::VectorUInt64 => collect!(UInt64, VectorUInt64),
        ReferenceType::VectorFloat => collect!(Float, VectorFloat),
        ReferenceType::VectorDouble => collect!(Double, VectorDouble),
        ReferenceType::VectorComplexFloat => collect!(ComplexFloat, VectorComplexFloat),
        ReferenceType::VectorComplexDouble => collect!(ComplexDouble, VectorComplexDouble),
        ReferenceType::VectorString => collect!(String, VectorString),
        other => {
            return Err(KaraboError::Cast(format!(
                "{other} is not a vector of scalars"
            )))
        }
    })
}

/// Format a double like C's `%.<precision>g`.
#[must_use]
pub fn format_g(x: f64, precision: usize) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, x);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (scientific.as_str(), 0),
    };
    let limit = i32::try_from(precision).unwrap_or(i32::MAX);
    if exponent < -4 || exponent >= limit {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = usize::try_from(limit - 1 - exponent).unwrap_or(0);
        trim_fraction(&format!("{x:.decimals$}")).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

fn complex_text(re: String, im: String) -> String {
    format!("({re},{im})")
}

/// Textual form of a value as used by string casts.
pub fn to_text(value: &Value) -> Result<String> {
    fn join<T>(v: &[T], f: impl Fn(&T) -> String) -> String {
        v.iter().map(f).collect::<Vec<_>>().join(",")
    }
    let bool_text = |b: &bool| if *b { "1" } else { "0" }.to_string();
    let float_text = |f: &f32| f.to_string();
    let double_text = |d: &f64| format_g(*d, 15);
    Ok(match value {
        Value::Bool(b) => bool_text(b),
        Value::VectorBool(v) => join(v, bool_text),
        Value::Char(c) => char::from(*c).to_string(),
        Value::VectorChar(v) => BASE64.encode(v),
        Value::ByteArray(b) => BASE64.encode(b),
        Value::Int8(v) => v.to_string(),
        Value::VectorInt8(v) => join(v, ToString::to_string),
        Value::UInt8(v) => v.to_string(),
        Value::VectorUInt8(v) => join(v, ToString::to_string),
        Value::Int16(v) => v.to_string(),
        Value::VectorInt16(v) => join(v, ToString::to_string),
        Value::UInt16(v) => v.to_string(),
        Value::VectorUInt16(v) => join(v, ToString::to_string),
        Value::Int32(v) => v.to_string(),
        Value::VectorInt32(v) => join(v, ToString::to_string),
        Value::UInt32(v) => v.to_string(),
        Value::VectorUInt32(v) => join(v, ToString::to_string),
        Value::Int64(v) => v.to_string(),
        Value::VectorInt64(v) => join(v, ToString::to_string),
        Value::UInt64(v) => v.to_string(),
        Value::VectorUInt64(v) => join(v, ToString::to_string),
        Value::Float(v) => float_text(v),
        Value::VectorFloat(v) => join(v, float_text),
        Value::Double(v) => double_text(v),
        Value::VectorDouble(v) => join(v, double_text),
        Value::ComplexFloat(c) => complex_text(float_text(&c.re), float_text(&c.im)),
        Value::VectorComplexFloat(v) => join(v, |c| {
            complex_text(float_text(&c.re), float_text(&c.im))
        }),
        Value::ComplexDouble(c) => complex_text(double_text(&c.re), double_text(&c.im)),
        Value::VectorComplexDouble(v) => join(v, |c| {
            complex_text(double_text(&c.re), double_text(&c.im))
        }),
        Value::String(s) => s.clone(),
        Value::VectorString(v) => v.join(","),
        Value::Hash(_) | Value::VectorHash(_) | Value::Schema(_) | Value::None => {
            return Err(cast_error(value, ReferenceType::String))
        }
    })
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "1" => Some(true),
        "0" => Some(false),
        t if t.eq_ignore_ascii_case("true") => Some(true),
        t if t.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<Number> {
    let t = text.trim();
    if let Ok(i) = t.parse::<i128>() {
        return Some(Number::Int(i));
    }
    if let Some(inner) = t.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        let (re, im) = inner.split_once(',')?;
        return Some(Number::Complex(
            re.trim().parse().ok()?,
            im.trim().parse().ok()?,
        ));
    }
    t.parse::<f64>().ok().map(Number::Real)
}

fn parse_scalar(text: &str, target: ReferenceType) -> Option<Value> {
    match target {
        ReferenceType::String => Some(Value::String(text.to_string())),
        ReferenceType::Bool => parse_bool(text).map(Value::Bool),
        ReferenceType::Char => {
            let mut chars = text.chars();
            let c = chars.next()?;
            if chars.next().is_some() {
                return None;
            }
            u8::try_from(u32::from(c)).ok().map(Value::Char)
        }
        ReferenceType::Float => match parse_number(text)? {
            // %g text of a float is rarely exact, accept the nearest f32
            #[allow(clippy::cast_possible_truncation)]
            Number::Real(x) => Some(Value::Float(x as f32)),
            other => number_to(other, target),
        },
        ReferenceType::ComplexFloat => match parse_number(text)? {
            #[allow(clippy::cast_possible_truncation)]
            Number::Complex(re, im) => Some(Value::ComplexFloat(Complex::new(re as f32, im as f32))),
            other => number_to(other, target),
        },
        _ => number_to(parse_number(text)?, target),
    }
}

/// Parse `text` as a value of type `target`.
pub fn from_text(text: &str, target: ReferenceType) -> Result<Value> {
    let fail = || KaraboError::Cast(format!("cannot parse '{text}' as {target}"));
    match target {
        ReferenceType::VectorChar => BASE64
            .decode(text.trim())
            .map(Value::VectorChar)
            .map_err(|_| fail()),
        ReferenceType::ByteArray => BASE64
            .decode(text.trim())
            .map(|b| Value::ByteArray(Bytes::from(b)))
            .map_err(|_| fail()),
        ReferenceType::None if text.trim().is_empty() => Ok(Value::None),
        ReferenceType::Hash
        | ReferenceType::VectorHash
        | ReferenceType::Schema
        | ReferenceType::None => Err(fail()),
        t if t.is_vector() => {
            let element = t.element_type().ok_or_else(fail)?;
            if text.is_empty() {
                return from_elements(t, Vec::new());
            }
            let items = split_items(text, element == ReferenceType::ComplexFloat || element == ReferenceType::ComplexDouble)
                .into_iter()
                .map(|item| parse_scalar(item, element).ok_or_else(fail))
                .collect::<Result<Vec<_>>>()?;
            from_elements(t, items)
        }
        t => parse_scalar(text, t).ok_or_else(fail),
    }
}

/// Split a comma-joined list; complex items keep the comma inside parentheses.
fn split_items(text: &str, complex: bool) -> Vec<&str> {
    if !complex {
        return text.split(',').collect();
    }
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&text[start..]);
    items
}
