//! Owned XML document model produced by the stream framer.
//!
//! Documents are small trees (`Element` / `Node`) built while the framer
//! walks the quick-xml event stream. They can be queried with the path
//! subset in [`path`] and serialized back to text for writing.

pub mod path;

use quick_xml::escape::escape;

use crate::error::{Error, Result};
use crate::framing::extract_document;

pub use path::Path;

/// What a framed document represents in the XMPP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// A complete top-level element (stanza, features, SASL exchange, ...).
    Stanza,
    /// The `<stream:stream ...>` header. Holds attributes only.
    StreamOpen,
    /// `</stream:stream>`.
    StreamClose,
}

/// A child of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with ordered attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder form of [`Element::set_attr`].
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    /// Qualified name as written on the wire (e.g. `stream:features`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sets an attribute, replacing an existing value with the same key.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, skipping text.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given qualified name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children().find(|el| el.name == name)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Appends text, merging with a preceding text node.
    pub fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(&text);
        } else {
            self.children.push(Node::Text(text));
        }
    }

    fn write_open_tag(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
    }

    fn write_to(&self, out: &mut String) {
        self.write_open_tag(out);
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_to(out),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Serializes the element and its subtree.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }
}

/// An owned, fully parsed document extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    kind: DocumentKind,
    root: Element,
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self {
            kind: DocumentKind::Stanza,
            root,
        }
    }

    pub(crate) fn with_kind(kind: DocumentKind, root: Element) -> Self {
        Self { kind, root }
    }

    /// Parses exactly one document from `text`.
    ///
    /// Surrounding whitespace is allowed; anything else after the document
    /// is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let bytes = text.as_bytes();
        match extract_document(bytes)? {
            Some((doc, consumed)) => {
                if bytes[consumed..].iter().all(u8::is_ascii_whitespace) {
                    Ok(doc)
                } else {
                    Err(Error::MalformedStream(
                        "unexpected content after document".to_string(),
                    ))
                }
            }
            None => Err(Error::MalformedStream("incomplete document".to_string())),
        }
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn into_root(self) -> Element {
        self.root
    }

    /// First element matching `expression`, see [`path`] for the syntax.
    pub fn select_single(&self, expression: &str) -> Result<Option<&Element>> {
        Ok(Path::parse(expression)?.select_single(self))
    }

    /// All elements matching `expression`, in document order.
    pub fn select_all(&self, expression: &str) -> Result<Vec<&Element>> {
        Ok(Path::parse(expression)?.select_all(self))
    }

    /// Serializes the document for the wire.
    ///
    /// A stream header is written as an unclosed start tag, since the
    /// stream's end is sent separately.
    pub fn to_xml(&self) -> String {
        match self.kind {
            DocumentKind::Stanza => self.root.to_xml(),
            DocumentKind::StreamOpen => {
                let mut out = String::new();
                self.root.write_open_tag(&mut out);
                out.push('>');
                out
            }
            DocumentKind::StreamClose => format!("</{}>", self.root.name),
        }
    }
}

impl From<Element> for Document {
    fn from(root: Element) -> Self {
        Document::new(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_serialize() {
        let message = Element::new("message")
            .with_attr("to", "bob@example.com")
            .with_attr("type", "chat")
            .with_child(Element::new("body").with_text("Hi & <bye>"));
        assert_eq!(
            message.to_xml(),
            r#"<message to="bob@example.com" type="chat"><body>Hi &amp; &lt;bye&gt;</body></message>"#
        );
    }

    #[test]
    fn test_serialize_escapes_attribute_quotes() {
        let el = Element::new("x").with_attr("a", "say \"hi\"");
        assert_eq!(el.to_xml(), r#"<x a="say &quot;hi&quot;"/>"#);
    }

    #[test]
    fn test_parse_then_serialize_keeps_structure() {
        let doc = Document::parse(
            "<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/res</jid></bind></iq>",
        )
        .unwrap();
        let again = Document::parse(&doc.to_xml()).unwrap();
        assert_eq!(doc, again);
        assert_eq!(
            again.root().child("bind").unwrap().child("jid").unwrap().text(),
            "user@example.com/res"
        );
    }

    #[test]
    fn test_parse_rejects_trailing_content() {
        let err = Document::parse("<a/><b/>").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedStream);
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert!(Document::parse("<a><b/>").is_err());
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut el = Element::new("presence").with_attr("type", "away");
        el.set_attr("type", "unavailable");
        assert_eq!(el.attr("type"), Some("unavailable"));
        assert_eq!(el.attributes().count(), 1);
    }

    #[test]
    fn test_local_name() {
        assert_eq!(Element::new("stream:features").local_name(), "features");
        assert_eq!(Element::new("iq").local_name(), "iq");
    }

    #[test]
    fn test_stream_header_serialization() {
        let header = Document::with_kind(
            DocumentKind::StreamOpen,
            Element::new("stream:stream")
                .with_attr("to", "example.com")
                .with_attr("version", "1.0"),
        );
        assert_eq!(
            header.to_xml(),
            r#"<stream:stream to="example.com" version="1.0">"#
        );
        let close = Document::with_kind(DocumentKind::StreamClose, Element::new("stream:stream"));
        assert_eq!(close.to_xml(), "</stream:stream>");
    }

    #[test]
    fn test_push_text_merges() {
        let el = Element::new("body").with_text("Hello, ").with_text("world");
        assert_eq!(el.nodes().len(), 1);
        assert_eq!(el.text(), "Hello, world");
    }
}
