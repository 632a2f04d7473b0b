//! Owned XML element tree.
//!
//! `quick-xml` is an event reader; responses expose their XML payload as a
//! small owned tree built from those events so extractor code can walk it
//! after the response body buffer is gone.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    pub root: XmlElement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

impl XmlDocument {
    /// Parse a strict XML document. Ill-formed input is an error, unlike the
    /// lenient HTML path.
    pub fn parse(content: &[u8]) -> Result<Self, ClientError> {
        let source =
            std::str::from_utf8(content).map_err(|err| ClientError::Xml(err.to_string()))?;
        let mut reader = Reader::from_str(source);
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => stack.push(element_from(&start)?),
                Ok(Event::Empty(start)) => {
                    attach(element_from(&start)?, &mut stack, &mut root)?;
                }
                Ok(Event::End(_)) => match stack.pop() {
                    Some(element) => attach(element, &mut stack, &mut root)?,
                    None => return Err(ClientError::Xml("unmatched end tag".into())),
                },
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|err| ClientError::Xml(err.to_string()))?;
                    push_text(&mut stack, &text);
                }
                Ok(Event::CData(data)) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    push_text(&mut stack, &text);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => return Err(ClientError::Xml(err.to_string())),
            }
        }

        if !stack.is_empty() {
            return Err(ClientError::Xml("unclosed element".into()));
        }
        match root {
            Some(root) => Ok(Self { root }),
            None => Err(ClientError::Xml("no root element".into())),
        }
    }

    /// First element named `name`, searching the root and its descendants in
    /// document order.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        self.root.find(name)
    }
}

impl XmlElement {
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| match child {
            XmlNode::Element(element) => element.find(name),
            XmlNode::Text(_) => None,
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Concatenated text of this element and its descendants, in document
    /// order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                XmlNode::Text(text) => out.push_str(text),
                XmlNode::Element(element) => element.collect_text(out),
            }
        }
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, ClientError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = BTreeMap::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| ClientError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| ClientError::Xml(err.to_string()))?
            .into_owned();
        attributes.insert(key, value);
    }
    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn attach(
    element: XmlElement,
    stack: &mut Vec<XmlElement>,
    root: &mut Option<XmlElement>,
) -> Result<(), ClientError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlNode::Element(element));
        return Ok(());
    }
    if root.is_some() {
        return Err(ClientError::Xml("multiple root elements".into()));
    }
    *root = Some(element);
    Ok(())
}

fn push_text(stack: &mut Vec<XmlElement>, text: &str) {
    // Inter-element whitespace is noise for extraction purposes.
    if text.trim().is_empty() {
        return;
    }
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlNode::Text(text.to_string()));
    }
}
