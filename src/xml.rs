//! Shallow device-frame XML handling.
//!
//! Device frames are a handful of known tags nested two or three levels
//! deep (`Message` / `Request` | `Event` / a small set of value tags). This
//! module treats frames as opaque trees of `{tag, text, children}` — there is
//! no schema and no validation beyond "well-formed XML" — and provides the
//! small set of constants and accessors the balancer/worker actually inspect.
//! Everything else in a device payload passes through untouched (see
//! [`crate::worker`]'s fallback to `ResponseFromDevice`).

use quick_xml::events::{BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::io::Cursor;
use thiserror::Error;

pub const TAG_MESSAGE: &str = "Message";
pub const TAG_REQUEST: &str = "Request";
pub const TAG_EVENT: &str = "Event";
pub const TAG_RESPONSE: &str = "Response";
pub const TAG_DEVICE_SERIAL_NO: &str = "DeviceSerialNo";
pub const TAG_TOKEN: &str = "Token";
pub const TAG_RESULT: &str = "Result";
pub const TAG_TRANS_ID: &str = "TransID";

pub const RESULT_OK: &str = "OK";
pub const RESULT_FAIL: &str = "Fail";

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("xml read error: {0}")]
    Read(#[from] quick_xml::Error),
    #[error("xml is not well-formed: unexpected end of input")]
    UnexpectedEof,
    #[error("xml write error: {0}")]
    Write(#[from] std::io::Error),
}

/// A parsed element: its tag name, direct text content (if any), and direct children.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub tag: String,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    /// Find the first direct child with the given tag name.
    ///
    /// Matches the semantics of Python's `ElementTree.find(tag)` used by the
    /// original implementation: a plain tag name searches immediate children
    /// only, never descendants.
    pub fn find(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// Text of the first direct child with the given tag name, if present.
    pub fn child_text(&self, tag: &str) -> Option<String> {
        self.find(tag).and_then(|e| e.text.clone())
    }
}

/// Parse a device frame into a shallow element tree.
pub fn parse(xml: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text = true;

    // Stack of (element-being-built) from root to current open tag.
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(Element { tag, text: None, children: Vec::new() });
            }
            Event::Empty(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let empty = Element { tag, text: None, children: Vec::new() };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(empty),
                    None => root = Some(empty),
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                if let Some(top) = stack.last_mut() {
                    if !text.trim().is_empty() {
                        top.text = Some(text);
                    }
                }
            }
            Event::End(_) => {
                let finished = stack.pop().ok_or(XmlError::UnexpectedEof)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(finished),
                    None => root = Some(finished),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    root.ok_or(XmlError::UnexpectedEof)
}

/// Build `<Message>{fields}</Message>` with each `(tag, value)` pair
/// rendered as `<tag>value</tag>` (value text-escaped), skipping any field
/// whose value is `None`. Mirrors `create_text_element` in the original
/// Python worker.
pub fn build_message(fields: &[(&str, Option<&str>)]) -> Result<String, XmlError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .create_element(TAG_MESSAGE)
        .write_inner_content::<_, XmlError>(|w| {
            for (tag, value) in fields {
                if let Some(value) = value {
                    w.create_element(tag)
                        .write_text_content(BytesText::new(value))?;
                }
            }
            Ok(())
        })?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_request() {
        let xml = "<Message><Request>Register</Request><DeviceSerialNo>SN1</DeviceSerialNo></Message>";
        let el = parse(xml).unwrap();
        assert_eq!(el.tag, "Message");
        assert_eq!(el.child_text("Request").as_deref(), Some("Register"));
        assert_eq!(el.child_text("DeviceSerialNo").as_deref(), Some("SN1"));
        assert!(el.find("Token").is_none());
    }

    #[test]
    fn find_is_direct_children_only() {
        let xml = "<Message><Outer><Request>Nope</Request></Outer></Message>";
        let el = parse(xml).unwrap();
        assert!(el.find("Request").is_none());
    }

    #[test]
    fn builds_escaped_message() {
        let out = build_message(&[
            ("Response", Some("Register")),
            ("Token", None),
            ("Result", Some("Fail")),
        ])
        .unwrap();
        assert_eq!(out, "<Message><Response>Register</Response><Result>Fail</Result></Message>");
    }

    #[test]
    fn builds_with_escaping() {
        let out = build_message(&[("Response", Some("A&B"))]).unwrap();
        assert_eq!(out, "<Message><Response>A&amp;B</Response></Message>");
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(parse("<Message><Request>Register</Message>").is_err());
    }
}
