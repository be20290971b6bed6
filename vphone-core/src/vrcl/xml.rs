//! A small owned DOM for one VRCL tag unit.
//!
//! Parsing is delegated to `quick-xml`; serialization writes the compact
//! form the wire expects (`<Name a="v">text</Name>`, `<Name/>` when empty)
//! with `&lt; &gt; &amp;` escaping in text.

use std::fmt;

use quick_xml::Reader;
use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};

use crate::error::VpError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    // ── Builder ──────────────────────────────────────────────────

    pub fn with_attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Trimmed text content.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    // ── Parse / serialize ────────────────────────────────────────

    /// Parse exactly one element.
    pub fn parse(raw: &str) -> Result<Self, VpError> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    if root.is_some() {
                        return Err(VpError::Xml("content after the root element".into()));
                    }
                    stack.push(element_from(e)?);
                }
                Ok(Event::Empty(ref e)) => {
                    let element = element_from(e)?;
                    place(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| VpError::Xml("unbalanced end tag".into()))?;
                    place(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(ref e)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&e.unescape()?);
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(e.into()),
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(VpError::Xml("unclosed element".into()));
        }
        root.ok_or_else(|| VpError::Xml("no element".into()))
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&partial_escape(self.text.as_str()));
        for child in &self.children {
            child.write_into(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, VpError> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| VpError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn place(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), VpError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(VpError::Xml("more than one root element".into())),
    }
    Ok(())
}
