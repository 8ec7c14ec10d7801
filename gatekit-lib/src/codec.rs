//! Flat XML wire codec.
//!
//! Requests, responses and pushes travel as a single `<xml>` root holding one
//! child element per field:
//!
//! ```text
//! <xml><appid>wx1</appid><total_fee>100</total_fee></xml>
//! ```
//!
//! Decoding only understands that one level. A child that has children of
//! its own is skipped and its key dropped from the result (not mapped to an
//! empty string); callers that need such a list must read the raw bytes.

use crate::errors::GatewayError;
use crate::params::ParameterMap;
use crate::Result;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Name of the root element on encode. Any root name is accepted on decode.
pub const ROOT_ELEMENT: &str = "xml";

/// Encode `params` as a flat envelope.
pub fn encode(params: &ParameterMap) -> Vec<u8> {
    let mut out = String::with_capacity(256);
    out.push('<');
    out.push_str(ROOT_ELEMENT);
    out.push('>');
    for (key, value) in params {
        out.push('<');
        out.push_str(key);
        out.push('>');
        out.push_str(&escape(value.as_str()));
        out.push_str("</");
        out.push_str(key);
        out.push('>');
    }
    out.push_str("</");
    out.push_str(ROOT_ELEMENT);
    out.push('>');
    out.into_bytes()
}

fn element_name(element: &BytesStart<'_>) -> Result<String> {
    std::str::from_utf8(element.local_name().as_ref())
        .map(str::to_owned)
        .map_err(|e| GatewayError::Codec(format!("element name is not UTF-8: {e}")))
}

/// Decode the first-level children of the root element.
///
/// Empty or truncated input ends the walk cleanly and returns the keys
/// captured so far. Only a fault before the end of input is an error.
pub fn decode(input: &[u8]) -> Result<ParameterMap> {
    let mut reader = Reader::from_reader(input);
    let at_end = |reader: &Reader<&[u8]>| reader.buffer_position() as u64 >= input.len() as u64;

    let mut map = ParameterMap::new();
    let mut buf = Vec::new();
    let mut skipped = Vec::new();
    let mut depth = 0usize;
    // `None` while outside a field, or after its field was voided.
    let mut key: Option<String> = None;
    let mut value = String::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(_) if at_end(&reader) => return Ok(map),
            Err(err) => return Err(err.into()),
        };

        match event {
            Event::Start(start) => {
                depth += 1;
                match depth {
                    2 => {
                        key = Some(element_name(&start)?);
                        value.clear();
                    }
                    3 => {
                        let end = start.to_end().into_owned();
                        skipped.clear();
                        match reader.read_to_end_into(end.name(), &mut skipped) {
                            Ok(_) => {}
                            Err(_) if at_end(&reader) => return Ok(map),
                            Err(err) => return Err(err.into()),
                        }
                        depth -= 1;
                        key = None;
                    }
                    _ => {}
                }
            }
            Event::Empty(empty) => match depth {
                1 => {
                    map.insert(element_name(&empty)?, String::new());
                }
                2 => key = None,
                _ => {}
            },
            Event::Text(text) => {
                if depth == 2 && key.is_some() {
                    value.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if depth == 2 && key.is_some() {
                    let text = std::str::from_utf8(&data)
                        .map_err(|e| GatewayError::Codec(format!("CDATA is not UTF-8: {e}")))?;
                    value.push_str(text);
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some(k) = key.take() {
                        map.insert(k, std::mem::take(&mut value));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => return Ok(map),
            _ => {}
        }
        buf.clear();
    }
}
