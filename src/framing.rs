//! XMPP XML framing: document boundary detection in a continuous byte stream.
//!
//! The framer walks the accumulated bytes with quick-xml's pull reader and
//! builds the first complete top-level element as an owned [`Document`].
//! It distinguishes data that is merely incomplete (more bytes will come)
//! from data that can never become well-formed (the stream is dead).

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::xml::{Document, DocumentKind, Element};

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// Nesting limit used when the caller does not set one. Stanzas nest a few
/// levels; the limit keeps every tree small enough for recursive walks.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// `<!` markup openers, without the `<`. A buffer ending in a prefix of one
/// of these is still incomplete.
const BANG_OPENERS: [&[u8]; 3] = [b"!--", b"![CDATA[", b"!DOCTYPE"];

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedStream(reason.into())
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'))
}

fn decode_name(raw: &[u8]) -> Result<String> {
    let name = std::str::from_utf8(raw).map_err(|_| malformed("XML name is not valid UTF-8"))?;
    if !is_valid_name(name) {
        return Err(malformed(format!("invalid XML name `{}`", name)));
    }
    Ok(name.to_string())
}

fn build_element(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element::new(decode_name(start.name().as_ref())?);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(format!("invalid attribute: {}", e)))?;
        let key = decode_name(attr.key.as_ref())?;
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(format!("invalid value for attribute `{}`: {}", key, e)))?;
        element.set_attr(key, value.into_owned());
    }
    Ok(element)
}

fn is_stream_tag(start: &BytesStart<'_>) -> bool {
    start.name().local_name().as_ref() == b"stream"
}

fn too_deep(max_depth: usize) -> Error {
    malformed(format!("elements nested deeper than {} levels", max_depth))
}

/// Whether a syntax error only means the buffer ends early.
fn is_truncation(err: &SyntaxError, rest: &[u8]) -> bool {
    match err {
        SyntaxError::InvalidBangMarkup => {
            let start = rest
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(rest.len());
            let markup = &rest[start..];
            let markup = markup.strip_prefix(b"<").unwrap_or(markup);
            BANG_OPENERS.iter().any(|opener| opener.starts_with(markup))
        }
        // Unclosed tag, comment, CDATA, doctype or PI at the end of the buffer.
        _ => true,
    }
}

/// Extract the first complete document from `buffer`, nesting at most
/// [`DEFAULT_MAX_DEPTH`] levels.
///
/// Returns `Ok(Some((document, bytes_consumed)))` if a complete document was
/// found, `Ok(None)` if more data is needed, or `Err(Error::MalformedStream)`
/// if no amount of additional data can make the buffer well-formed.
/// The caller is responsible for advancing past the consumed bytes.
pub fn extract_document(buffer: &[u8]) -> Result<Option<(Document, usize)>> {
    extract_document_limited(buffer, DEFAULT_MAX_DEPTH)
}

/// [`extract_document`] with an explicit nesting limit. The document root
/// is at depth 1; an element deeper than `max_depth` makes the buffer
/// malformed.
pub fn extract_document_limited(
    buffer: &[u8],
    max_depth: usize,
) -> Result<Option<(Document, usize)>> {
    // The stream closing tag appears alone, without its opening tag in the buffer
    if let Some(start) = buffer.iter().position(|b| !b.is_ascii_whitespace()) {
        if buffer[start..].starts_with(STREAM_CLOSE) {
            let close = Document::with_kind(DocumentKind::StreamClose, Element::new("stream:stream"));
            return Ok(Some((close, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = true;

    let mut open: Vec<Element> = Vec::new();

    loop {
        let pos = reader.buffer_position() as usize;

        let event = match reader.read_event() {
            Ok(event) => event,
            Err(quick_xml::Error::Syntax(err)) if is_truncation(&err, &buffer[pos..]) => {
                // Partial markup that the next read will complete.
                return Ok(None);
            }
            Err(e) => return Err(malformed(e.to_string())),
        };

        match event {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => continue,
            Event::Start(e) => {
                if open.is_empty() && is_stream_tag(&e) {
                    let header = build_element(&e)?;
                    let consumed = reader.buffer_position() as usize;
                    return Ok(Some((
                        Document::with_kind(DocumentKind::StreamOpen, header),
                        consumed,
                    )));
                }
                if open.len() >= max_depth {
                    return Err(too_deep(max_depth));
                }
                open.push(build_element(&e)?);
            }
            Event::Empty(e) => {
                if open.len() >= max_depth {
                    return Err(too_deep(max_depth));
                }
                let element = build_element(&e)?;
                match open.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => {
                        // `<stream:stream/>` opens and closes in one tag
                        let kind = if is_stream_tag(&e) {
                            DocumentKind::StreamClose
                        } else {
                            DocumentKind::Stanza
                        };
                        let consumed = reader.buffer_position() as usize;
                        return Ok(Some((Document::with_kind(kind, element), consumed)));
                    }
                }
            }
            Event::Text(e) => {
                let at_end = reader.buffer_position() as usize >= buffer.len();
                match e.unescape() {
                    Ok(text) => match open.last_mut() {
                        Some(parent) => parent.push_text(text.into_owned()),
                        None if text.trim().is_empty() => {}
                        None => return Err(malformed("text outside of any element")),
                    },
                    // An entity or a UTF-8 sequence split across reads
                    Err(_) if at_end => return Ok(None),
                    Err(e) => return Err(malformed(e.to_string())),
                }
            }
            Event::CData(e) => {
                let text = std::str::from_utf8(&e)
                    .map_err(|_| malformed("CDATA section is not valid UTF-8"))?
                    .to_string();
                match open.last_mut() {
                    Some(parent) => parent.push_text(text),
                    None => return Err(malformed("CDATA outside of any element")),
                }
            }
            Event::End(_) => {
                let Some(element) = open.pop() else {
                    return Err(malformed("end tag without matching start tag"));
                };
                match open.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => {
                        let consumed = reader.buffer_position() as usize;
                        return Ok(Some((Document::new(element), consumed)));
                    }
                }
            }
            Event::Eof => {
                // Incomplete document, need more data from the transport
                return Ok(None);
            }
        }
    }
}

/// Extract the first complete document from the accumulated stream.
///
/// On success the consumed bytes are removed from the front of `stream`;
/// trailing bytes (the start of the next document) stay in place. When the
/// stream is incomplete or malformed it is left untouched.
pub fn try_extract(stream: &mut Vec<u8>, max_depth: usize) -> Result<Option<Document>> {
    match extract_document_limited(stream, max_depth)? {
        Some((document, consumed)) => {
            stream.drain(..consumed);
            Ok(Some(document))
        }
        None => Ok(None),
    }
}
