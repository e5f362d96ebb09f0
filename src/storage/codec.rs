//! Encoders for each recording format

use std::borrow::Cow;
use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hyper::StatusCode;

use crate::config::RecordingFormat;
use crate::exchange::Exchange;

/// Marker appended to the Mocktail `Content-Type` of base64 bodies
pub const MOCKTAIL_BASE64_MARKER: &str = ";base64";

/// Headers describing transport framing, which no longer apply to the
/// de-chunked body we store
const FRAMING_HEADERS: [&str; 2] = ["content-length", "transfer-encoding"];

/// Encode an exchange in one of the built-in formats
///
/// Returns `None` for [`RecordingFormat::Custom`], which is serialized by
/// the recording policy instead.
#[must_use]
pub fn encode(format: RecordingFormat, exchange: &Exchange, url_pattern: &str) -> Option<Vec<u8>> {
    match format {
        RecordingFormat::BodyOnly => Some(encode_body_only(exchange)),
        RecordingFormat::Mocktail => Some(encode_mocktail(exchange, url_pattern)),
        RecordingFormat::HttpMessage => Some(encode_http_message(exchange)),
        RecordingFormat::Custom => None,
    }
}

/// Body bytes as persisted: raw, or base64 text when requested
#[must_use]
pub fn persisted_body(exchange: &Exchange) -> Cow<'_, [u8]> {
    if exchange.is_base64 {
        Cow::Owned(STANDARD.encode(&exchange.body).into_bytes())
    } else {
        Cow::Borrowed(&exchange.body[..])
    }
}

/// Response body only
#[must_use]
pub fn encode_body_only(exchange: &Exchange) -> Vec<u8> {
    persisted_body(exchange).into_owned()
}

/// Mocktail text format:
///
/// ```text
/// METHOD
/// url-pattern
/// STATUS
/// Header: value
///
/// body
/// ```
#[must_use]
pub fn encode_mocktail(exchange: &Exchange, url_pattern: &str) -> Vec<u8> {
    let mut head = String::new();
    let _ = writeln!(head, "{}", exchange.request.method);
    let _ = writeln!(head, "{url_pattern}");
    let _ = writeln!(head, "{}", exchange.response.status);

    let mut marked = false;
    for (name, value) in persisted_headers(&exchange.response.headers) {
        if exchange.is_base64 && name.eq_ignore_ascii_case("content-type") && !marked {
            marked = true;
            if value.ends_with(MOCKTAIL_BASE64_MARKER) {
                let _ = writeln!(head, "{name}: {value}");
            } else {
                let _ = writeln!(head, "{name}: {value}{MOCKTAIL_BASE64_MARKER}");
            }
        } else {
            let _ = writeln!(head, "{name}: {value}");
        }
    }
    if exchange.is_base64 && !marked {
        let _ = writeln!(
            head,
            "Content-Type: application/octet-stream{MOCKTAIL_BASE64_MARKER}"
        );
    }
    head.push('\n');

    let body = persisted_body(exchange);
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&body);
    out
}

/// Raw HTTP/1.1 response message
#[must_use]
pub fn encode_http_message(exchange: &Exchange) -> Vec<u8> {
    let status = exchange.response.status;
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default();

    let body = persisted_body(exchange);

    let mut head = String::new();
    let _ = write!(head, "HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in persisted_headers(&exchange.response.headers) {
        let _ = write!(head, "{name}: {value}\r\n");
    }
    if exchange.is_base64 {
        head.push_str("Content-Transfer-Encoding: base64\r\n");
    }
    let _ = write!(head, "Content-Length: {}\r\n\r\n", body.len());

    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&body);
    out
}

fn persisted_headers(headers: &[(String, String)]) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !FRAMING_HEADERS
                .iter()
                .any(|framing| name.eq_ignore_ascii_case(framing))
        })
        .map(|(name, value)| (name.as_str(), value.as_str()))
}
