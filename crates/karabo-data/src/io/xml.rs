//! XML codec.
//!
//! ```xml
//! <root KRB_Artificial="" KRB_Type="HASH">
//!   <key KRB_Type="INT32" unit="KRB_STRING:m">5</key>
//!   <rows KRB_Type="VECTOR_HASH"><KRB_Item>...</KRB_Item></rows>
//! </root>
//! ```
//!
//! Entry attributes are written as `KRB_<TYPE>:<text>`; attribute values of
//! type HASH, VECTOR_HASH or SCHEMA carry base64 of their binary encoding.
//! Newlines in text become `.KRB_NEWLINE.` and `/` in keys `.KRB_SLASH.`.
//!
//! The reader accepts the artificial-root form, a plain rooted document
//! (one-key Hash), a bare sequence of `KRB_Item`s under the artificial root,
//! and insignificant whitespace between elements.

use std::fmt::Write as _;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::cast;
use crate::errors::{KaraboError, Result};
use crate::hash::{Attributes, Hash};
use crate::schema::Schema;
use crate::types::ReferenceType;
use crate::value::{Complex, Value};

use super::binary::{decode_hash, encode_hash, BinarySerializer};
use super::{unwrap_sequence, HashSerializer, SEQUENCE_KEY};

const TYPE_FLAG: &str = "KRB_Type";
const ARTIFICIAL_FLAG: &str = "KRB_Artificial";
const ROOT_NAME_FLAG: &str = "KRB_RootName";
const ITEM: &str = "KRB_Item";
const PREFIX: &str = "KRB_";
const NEWLINE: &str = ".KRB_NEWLINE.";
const SLASH: &str = ".KRB_SLASH.";
const SCHEMA_KEY: &str = "KRB_Schema";

/// The XML [`HashSerializer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlSerializer;

impl XmlSerializer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode to a string.
    pub fn to_xml(&self, hash: &Hash) -> Result<String> {
        let mut out = String::with_capacity(256);
        out.push_str("<root KRB_Artificial=\"\" KRB_Type=\"HASH\">");
        write_children(&mut out, hash)?;
        out.push_str("</root>");
        Ok(out)
    }

    /// Decode from a string.
    pub fn from_xml(&self, text: &str) -> Result<Hash> {
        let Some(root) = parse_document(text)? else {
            return Ok(Hash::new());
        };
        if root.attribute(ARTIFICIAL_FLAG).is_some() {
            if !root.children.is_empty() && root.children.iter().all(|c| c.name == ITEM) {
                let items = root
                    .children
                    .iter()
                    .map(|item| hash_from_children(item))
                    .collect::<Result<Vec<_>>>()?;
                let mut hash = Hash::new();
                hash.set_key(SEQUENCE_KEY, Value::VectorHash(items));
                return Ok(hash);
            }
            return hash_from_children(&root);
        }
        let mut hash = Hash::new();
        read_entry(&mut hash, &root)?;
        Ok(hash)
    }
}

impl HashSerializer for XmlSerializer {
    fn save(&self, hash: &Hash) -> Result<Vec<u8>> {
        Ok(self.to_xml(hash)?.into_bytes())
    }

    fn load(&self, data: &[u8]) -> Result<Hash> {
        let text = std::str::from_utf8(data)
            .map_err(|e| KaraboError::Parse(format!("XML is not UTF-8: {e}")))?;
        self.from_xml(text)
    }

    fn save_schema(&self, schema: &Schema) -> Result<Vec<u8>> {
        let mut wrapper = Hash::new();
        wrapper.set_key(SCHEMA_KEY, Value::Schema(schema.clone()));
        self.save(&wrapper)
    }

    fn load_schema(&self, data: &[u8]) -> Result<Schema> {
        let hash = self.load(data)?;
        hash.iter()
            .find_map(|node| match node.value() {
                Value::Schema(s) => Some(s.clone()),
                _ => None,
            })
            .ok_or_else(|| KaraboError::Parse("XML document holds no schema".into()))
    }

    /// An empty document is an empty sequence; a document that is not a
    /// sequence wrapper is a sequence of one.
    fn load_sequence(&self, data: &[u8]) -> Result<Vec<Hash>> {
        let mut hash = self.load(data)?;
        if hash.is_empty() {
            return Ok(Vec::new());
        }
        Ok(unwrap_sequence(&mut hash).unwrap_or_else(|| vec![hash]))
    }
}

// =============================================================================
// WRITING
// =============================================================================

fn escape(text: &str) -> String {
    quick_xml::escape::escape(text.replace('\n', NEWLINE).as_str()).into_owned()
}

fn element_name(key: &str) -> String {
    key.replace('/', SLASH)
}

fn complex_text<T: std::fmt::Display>(c: &Complex<T>) -> String {
    format!("({},{})", c.re, c.im)
}

fn join<T>(items: &[T], f: impl Fn(&T) -> String) -> String {
    items.iter().map(f).collect::<Vec<_>>().join(",")
}

/// Text form of a scalar or vector; doubles use the shortest exact form.
fn value_text(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Double(x) => x.to_string(),
        Value::VectorDouble(v) => join(v, ToString::to_string),
        Value::ComplexDouble(c) => complex_text(c),
        Value::VectorComplexDouble(v) => join(v, complex_text),
        Value::None => String::new(),
        other => cast::to_text(other)?,
    })
}

fn attribute_text(value: &Value) -> Result<String> {
    let text = match value {
        Value::Hash(h) => BASE64.encode(encode_hash(h)?),
        Value::VectorHash(items) => {
            let mut wrapper = Hash::new();
            wrapper.set_key(SEQUENCE_KEY, Value::VectorHash(items.clone()));
            BASE64.encode(encode_hash(&wrapper)?)
        }
        Value::Schema(s) => BASE64.encode(BinarySerializer::new().save_schema(s)?),
        other => value_text(other)?,
    };
    Ok(format!("{PREFIX}{}:{text}", value.value_type().name()))
}

fn write_attributes(out: &mut String, attributes: &Attributes) -> Result<()> {
    for (name, value) in attributes {
        let _ = write!(out, " {}=\"{}\"", name, escape(&attribute_text(value)?));
    }
    Ok(())
}

fn write_children(out: &mut String, hash: &Hash) -> Result<()> {
    for node in hash {
        let name = element_name(node.key());
        let value = node.value();
        let _ = write!(out, "<{name} {TYPE_FLAG}=\"{}\"", value.value_type().name());
        if let Value::Schema(s) = value {
            let _ = write!(out, " {ROOT_NAME_FLAG}=\"{}\"", escape(s.root_name()));
        }
        write_attributes(out, node.attributes())?;
        out.push('>');
        match value {
            Value::Hash(h) => write_children(out, h)?,
            Value::VectorHash(items) => {
                for item in items {
                    out.push_str("<KRB_Item>");
                    write_children(out, item)?;
                    out.push_str("</KRB_Item>");
                }
            }
            Value::Schema(s) => write_children(out, s.parameters())?,
            other => out.push_str(&escape(&value_text(other)?)),
        }
        let _ = write!(out, "</{name}>");
    }
    Ok(())
}

// =============================================================================
// READING
// =============================================================================

/// Minimal element tree of a parsed document.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn xml_error(e: impl std::fmt::Display) -> KaraboError {
    KaraboError::Parse(format!("malformed XML: {e}"))
}

fn open_element(start: &quick_xml::events::BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8(start.name().as_ref().to_vec()).map_err(xml_error)?;
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(xml_error)?;
        let key = String::from_utf8(attribute.key.as_ref().to_vec()).map_err(xml_error)?;
        let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        ..Element::default()
    })
}

fn parse_document(text: &str) -> Result<Option<Element>> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(false);
    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    let mut close = |element: Element, stack: &mut Vec<Element>| -> Result<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                if root.is_some() {
                    return Err(xml_error("more than one root element"));
                }
                root = Some(element);
            }
        }
        Ok(())
    };

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => stack.push(open_element(&start)?),
            Event::Empty(start) => close(open_element(&start)?, &mut stack)?,
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| xml_error("unbalanced closing tag"))?;
                close(element, &mut stack)?;
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(xml_error("unclosed element at end of input"));
    }
    Ok(root)
}

fn hash_from_children(element: &Element) -> Result<Hash> {
    let mut hash = Hash::new();
    for child in &element.children {
        read_entry(&mut hash, child)?;
    }
    Ok(hash)
}

fn decode_text(text: &str) -> String {
    text.replace(NEWLINE, "\n")
}

fn parse_attribute(raw: &str) -> Result<Value> {
    let Some(typed) = raw.strip_prefix(PREFIX) else {
        return Ok(Value::String(decode_text(raw)));
    };
    let (type_name, text) = typed
        .split_once(':')
        .ok_or_else(|| xml_error(format!("suspicious attribute value '{raw}'")))?;
    let value_type: ReferenceType = type_name.parse()?;
    let base64 = |text: &str| {
        BASE64
            .decode(text)
            .map_err(|e| xml_error(format!("bad base64 attribute: {e}")))
    };
    Ok(match value_type {
        ReferenceType::Hash => Value::Hash(decode_hash(&base64(text)?)?),
        ReferenceType::VectorHash => {
            let mut wrapper = decode_hash(&base64(text)?)?;
            Value::VectorHash(
                unwrap_sequence(&mut wrapper)
                    .ok_or_else(|| xml_error("vector of Hash attribute without sequence"))?,
            )
        }
        ReferenceType::Schema => {
            Value::Schema(BinarySerializer::new().load_schema(&base64(text)?)?)
        }
        ReferenceType::None => Value::None,
        other => cast::from_text(&decode_text(text), other)?,
    })
}

fn read_entry(hash: &mut Hash, element: &Element) -> Result<()> {
    let key = element.name.replace(SLASH, "/");
    let declared = element
        .attribute(TYPE_FLAG)
        .map(str::parse::<ReferenceType>)
        .transpose()?;
    let is_sequence = element.children.first().map(|c| c.name == ITEM).unwrap_or(false);

    let value = match declared {
        Some(ReferenceType::VectorHash) => Value::VectorHash(read_items(element)?),
        None if is_sequence => Value::VectorHash(read_items(element)?),
        Some(ReferenceType::Hash) => Value::Hash(hash_from_children(element)?),
        None if !element.children.is_empty() => Value::Hash(hash_from_children(element)?),
        Some(ReferenceType::Schema) => {
            let root_name = element.attribute(ROOT_NAME_FLAG).unwrap_or_default();
            Value::Schema(Schema::from_parameters(
                root_name,
                hash_from_children(element)?,
            ))
        }
        Some(ReferenceType::None) => Value::None,
        Some(other) => {
            if !element.children.is_empty() {
                return Err(xml_error(format!(
                    "element '{key}' of type {other} has child elements"
                )));
            }
            cast::from_text(&decode_text(&element.text), other)?
        }
        None => Value::String(decode_text(&element.text)),
    };

    let mut attributes = Attributes::new();
    for (name, raw) in &element.attributes {
        if name.starts_with(PREFIX) || name == "xmlns" {
            continue;
        }
        attributes.set(name, parse_attribute(raw)?);
    }
    hash.set_key(&key, value).set_attributes(attributes);
    Ok(())
}

fn read_items(element: &Element) -> Result<Vec<Hash>> {
    element
        .children
        .iter()
        .filter(|c| c.name == ITEM)
        .map(hash_from_children)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xml() -> XmlSerializer {
        XmlSerializer::new()
    }

    #[test]
    fn test_canonical_form() {
        let mut h = Hash::new().with("a", 5i32);
        h.set_attribute("a", "unit", "m").unwrap();
        assert_eq!(
            xml().to_xml(&h).unwrap(),
            "<root KRB_Artificial=\"\" KRB_Type=\"HASH\">\
             <a KRB_Type=\"INT32\" unit=\"KRB_STRING:m\">5</a></root>"
        );
    }

    #[test]
    fn test_wrapped_sequence_yields_vector_of_hash() {
        let doc = r#"<KRB_Sequence KRB_Type="VECTOR_HASH"><KRB_Item><v KRB_Type="INT32">7</v></KRB_Item></KRB_Sequence>"#;
        let h = xml().from_xml(doc).unwrap();
        assert_eq!(h.len(), 1);
        let items = h.get_vector_hash("KRB_Sequence").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get::<i32>("v").unwrap(), 7);
        assert_eq!(xml().load_sequence(doc.as_bytes()).unwrap(), items.clone());
    }

    #[test]
    fn test_bare_sequence_accepted() {
        let doc = r#"<root KRB_Artificial=""><KRB_Item><v KRB_Type="INT32">1</v></KRB_Item><KRB_Item/></root>"#;
        let items = xml().load_sequence(doc.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[1].is_empty());
    }

    #[test]
    fn test_whitespace_and_legacy_attribute_order() {
        let doc = "<root KRB_Artificial=\"\" KRB_Type=\"HASH\">\n  <n KRB_Type=\"HASH\">\n    <x KRB_Type=\"UINT16\">3</x>\n  </n>\n  <s KRB_Type=\"STRING\">  padded </s>\n</root>\n";
        let h = xml().from_xml(doc).unwrap();
        assert_eq!(h.get::<u16>("n.x").unwrap(), 3);
        assert_eq!(h.get::<String>("s").unwrap(), "  padded ");
    }

    #[test]
    fn test_round_trip_of_awkward_values() {
        let mut h = Hash::new()
            .with("text", "line1\nline2 <&> \"q\"")
            .with("d", 0.1f64 + 0.2)
            .with("f", 1.25f32)
            .with("b", true)
            .with("c", Complex::new(1.5f64, -2.0))
            .with("bytes", bytes::Bytes::from_static(b"\x00\xff"))
            .with("vec", vec![1u64, 2, 3])
            .with("empty", Vec::<String>::new())
            .with("nested.inner", -4i8)
            .with("none", Value::None)
            .with("path/like", 1i32);
        h.set("rows[1].x", 2i32);
        h.set_attribute("d", "table", vec![Hash::new().with("k", 1i32)])
            .unwrap();
        h.set_attribute("d", "flag", false).unwrap();
        let schema = Schema::from_parameters("Inner", Hash::new().with("p", Value::None));
        h.set("schema", schema);

        let text = xml().to_xml(&h).unwrap();
        assert!(text.contains(".KRB_NEWLINE."));
        assert!(text.contains("path.KRB_SLASH.like"));
        assert_eq!(xml().from_xml(&text).unwrap(), h);
    }

    #[test]
    fn test_rooted_document() {
        let doc = r#"<config><port KRB_Type="UINT32">8080</port></config>"#;
        let h = xml().from_xml(doc).unwrap();
        assert_eq!(h.get::<u32>("config.port").unwrap(), 8080);
    }

    #[test]
    fn test_schema_round_trip() {
        let schema = Schema::from_parameters("Dev", Hash::new().with("k", Value::None));
        let data = xml().save_schema(&schema).unwrap();
        assert_eq!(xml().load_schema(&data).unwrap(), schema);
    }

    #[test]
    fn test_malformed_is_parse_error() {
        assert!(matches!(
            xml().from_xml("<root><a></root>"),
            Err(KaraboError::Parse(_))
        ));
        assert!(xml()
            .from_xml(r#"<root KRB_Artificial=""><a KRB_Type="INT32">x</a></root>"#)
            .is_err());
    }
}
