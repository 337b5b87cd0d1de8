//! Message parsers: reduce an intercepted message to an abstraction key.
//!
//! The key is later mapped to an output symbol by the
//! [`crate::table::SymbolTable`]. Parsers may fail; the table turns a
//! failure into `PARSE_ERROR` so the learner never sees an error.

use mitmlearn_transport::PhaseKind;
use regex::Regex;
use serde_json::Value;

use crate::FuzzError;

pub trait MessageParser: Send {
    /// Registry name of this parser.
    fn name(&self) -> &'static str;

    /// Abstraction key for `message`.
    fn key(&self, message: &str, kind: PhaseKind) -> Result<String, FuzzError>;
}

/// Sorted key set of a JSON object or array, nested keys included.
///
/// Keys made only of lowercase hex digits are collapsed to `HEX_KEY`, so
/// content-addressed maps abstract to the same symbol.
pub struct JsonParser {
    hex_key: Regex,
}

impl JsonParser {
    pub fn new() -> Result<Self, FuzzError> {
        Ok(Self {
            hex_key: Regex::new("^[0-9a-f]+$")?,
        })
    }
}

fn collect_keys(value: &Value, keys: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                keys.push(k.clone());
                collect_keys(v, keys);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_keys(item, keys);
            }
        }
        _ => {}
    }
}

impl MessageParser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn key(&self, message: &str, _kind: PhaseKind) -> Result<String, FuzzError> {
        let value: Value =
            serde_json::from_str(message).map_err(|e| FuzzError::Parse(e.to_string()))?;
        if !value.is_object() && !value.is_array() {
            return Err(FuzzError::Parse("not a JSON object or array".into()));
        }
        let mut keys = Vec::new();
        collect_keys(&value, &mut keys);
        keys.sort();
        for key in keys.iter_mut() {
            if self.hex_key.is_match(key) {
                *key = "HEX_KEY".into();
            }
        }
        serde_json::to_string(&keys).map_err(|e| FuzzError::Parse(e.to_string()))
    }
}

/// The message itself.
pub struct StringParser;

impl MessageParser for StringParser {
    fn name(&self) -> &'static str {
        "string"
    }

    fn key(&self, message: &str, _kind: PhaseKind) -> Result<String, FuzzError> {
        Ok(message.to_string())
    }
}

/// Message length in characters, tagged with the phase.
pub struct StringLenParser;

impl MessageParser for StringLenParser {
    fn name(&self) -> &'static str {
        "string_len"
    }

    fn key(&self, message: &str, kind: PhaseKind) -> Result<String, FuzzError> {
        Ok(format!("{}{}", message.chars().count(), kind.as_str()))
    }
}

/// Sorted structure of an XML document: element names, attributes as
/// `@name`, and `#text` for elements mixing text with markup.
///
/// Repeated siblings count once per parent, and elements holding only
/// text contribute their name but nothing below it.
pub struct XmlParser {
    markup: Regex,
    tag: Regex,
    attribute: Regex,
}

#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attributes: Vec<String>,
    children: Vec<XmlElement>,
    text: bool,
}

impl XmlElement {
    fn is_leaf(&self) -> bool {
        self.attributes.is_empty() && self.children.is_empty()
    }

    fn collect_keys(&self, keys: &mut Vec<String>) {
        let mut own: Vec<String> = self.attributes.iter().map(|a| format!("@{a}")).collect();
        for child in &self.children {
            if !own.contains(&child.name) {
                own.push(child.name.clone());
            }
        }
        if self.text {
            own.push("#text".into());
        }
        keys.extend(own);
        for child in self.children.iter().filter(|c| !c.is_leaf()) {
            child.collect_keys(keys);
        }
    }
}

impl XmlParser {
    pub fn new() -> Result<Self, FuzzError> {
        Ok(Self {
            markup: Regex::new(r"(?s)<!--.*?-->|<\?.*?\?>|<!\[CDATA\[.*?\]\]>|<![^>]*>")?,
            tag: Regex::new(r"<(/?)([A-Za-z_][\w:.-]*)([^>]*?)(/?)>")?,
            attribute: Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"[^"]*"|'[^']*')"#)?,
        })
    }

    fn document(&self, message: &str) -> Result<XmlElement, FuzzError> {
        let malformed = |what: &str| FuzzError::Parse(format!("malformed XML: {what}"));
        let cleaned = self.markup.replace_all(message, |c: &regex::Captures| {
            if c[0].starts_with("<![CDATA[") {
                " cdata "
            } else {
                ""
            }
        });
        let mut open: Vec<XmlElement> = Vec::new();
        let mut root = None;
        let mut last = 0;
        for c in self.tag.captures_iter(&cleaned) {
            let Some(whole) = c.get(0) else { continue };
            let text = cleaned[last..whole.start()].trim();
            last = whole.end();
            if !text.is_empty() {
                match open.last_mut() {
                    Some(parent) => parent.text = true,
                    None => return Err(malformed("text outside the root element")),
                }
            }
            let name = c[2].to_string();
            if &c[1] == "/" {
                let element = open.pop().ok_or_else(|| malformed("unexpected closing tag"))?;
                if element.name != name {
                    return Err(malformed("mismatched closing tag"));
                }
                close(element, &mut open, &mut root);
                continue;
            }
            if root.is_some() && open.is_empty() {
                return Err(malformed("more than one root element"));
            }
            let element = XmlElement {
                name,
                attributes: self
                    .attribute
                    .captures_iter(&c[3])
                    .map(|a| a[1].to_string())
                    .collect(),
                ..Default::default()
            };
            if &c[4] == "/" {
                close(element, &mut open, &mut root);
            } else {
                open.push(element);
            }
        }
        if !open.is_empty() {
            return Err(malformed("unclosed element"));
        }
        if !cleaned[last..].trim().is_empty() {
            return Err(malformed("text outside the root element"));
        }
        root.ok_or_else(|| malformed("no root element"))
    }
}

fn close(element: XmlElement, open: &mut [XmlElement], root: &mut Option<XmlElement>) {
    match open.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

impl MessageParser for XmlParser {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn key(&self, message: &str, _kind: PhaseKind) -> Result<String, FuzzError> {
        let root = self.document(message)?;
        let mut keys = vec![root.name.clone()];
        if !root.is_leaf() {
            root.collect_keys(&mut keys);
        }
        keys.sort();
        serde_json::to_string(&keys).map_err(|e| FuzzError::Parse(e.to_string()))
    }
}

/// Text of every `<string>` element, space separated.
pub struct XmlStringParser {
    element: Regex,
}

impl XmlStringParser {
    pub fn new() -> Result<Self, FuzzError> {
        Ok(Self {
            element: Regex::new(r"<string>(.*?)</string>")?,
        })
    }
}

impl MessageParser for XmlStringParser {
    fn name(&self) -> &'static str {
        "xml_string"
    }

    fn key(&self, message: &str, _kind: PhaseKind) -> Result<String, FuzzError> {
        let texts: Vec<&str> = self
            .element
            .captures_iter(message)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        Ok(texts.join(" "))
    }
}
