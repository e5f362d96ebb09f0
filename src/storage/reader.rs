//! Parse recording files back into responses

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::codec::MOCKTAIL_BASE64_MARKER;
use crate::{RecorderError, Result};

/// A response read back from a recording file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    /// Request method line (Mocktail only)
    pub method: Option<String>,
    /// URL pattern line (Mocktail only)
    pub url_pattern: Option<String>,
    /// HTTP status code
    pub status: u16,
    /// Headers as stored, with the base64 marker removed
    pub headers: Vec<(String, String)>,
    /// Decoded body
    pub body: Vec<u8>,
    /// Whether the body was stored base64-encoded
    pub was_base64: bool,
}

impl RecordedResponse {
    /// First header value with the given name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read a recording, choosing the parser from the file extension
///
/// # Errors
///
/// Returns error if the file cannot be read, has an unknown extension,
/// or is malformed
pub fn read_recording(path: &Path) -> Result<RecordedResponse> {
    let data = std::fs::read(path)?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("tail") => parse_mocktail(&data),
        Some("response") => parse_http_message(&data),
        other => Err(RecorderError::InvalidFormat(format!(
            "Cannot infer recording format from extension {other:?}"
        ))),
    }
}

/// Read a body-only recording
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid base64 when
/// `base64` is set
pub fn read_body_only(path: &Path, base64: bool) -> Result<Vec<u8>> {
    let data = std::fs::read(path)?;
    if base64 {
        decode_base64(&data)
    } else {
        Ok(data)
    }
}

/// Parse a Mocktail file
///
/// # Errors
///
/// Returns error if the head is truncated or malformed
pub fn parse_mocktail(data: &[u8]) -> Result<RecordedResponse> {
    let mut cursor = Cursor::new(data);

    let method = cursor.line()?.to_string();
    let url_pattern = cursor.line()?.to_string();
    let status = parse_status(cursor.line()?)?;
    let mut headers = cursor.headers()?;

    let mut was_base64 = false;
    for (name, value) in &mut headers {
        if name.eq_ignore_ascii_case("content-type") {
            if let Some(stripped) = value.strip_suffix(MOCKTAIL_BASE64_MARKER) {
                *value = stripped.to_string();
                was_base64 = true;
            }
        }
    }

    let body = cursor.rest();
    let body = if was_base64 {
        decode_base64(body)?
    } else {
        body.to_vec()
    };

    Ok(RecordedResponse {
        method: Some(method),
        url_pattern: Some(url_pattern),
        status,
        headers,
        body,
        was_base64,
    })
}

/// Parse a raw HTTP/1.1 response message
///
/// # Errors
///
/// Returns error if the status line or headers are malformed
pub fn parse_http_message(data: &[u8]) -> Result<RecordedResponse> {
    let mut cursor = Cursor::new(data);

    let status_line = cursor.line()?;
    let mut parts = status_line.splitn(3, ' ');
    match parts.next() {
        Some(version) if version.starts_with("HTTP/") => {}
        _ => {
            return Err(RecorderError::InvalidFormat(format!(
                "Invalid status line: {status_line}"
            )))
        }
    }
    let status = parse_status(parts.next().unwrap_or_default())?;
    let headers = cursor.headers()?;

    let was_base64 = headers.iter().any(|(n, v)| {
        n.eq_ignore_ascii_case("content-transfer-encoding") && v.eq_ignore_ascii_case("base64")
    });

    let body = cursor.rest();
    let body = if was_base64 {
        decode_base64(body)?
    } else {
        body.to_vec()
    };

    Ok(RecordedResponse {
        method: None,
        url_pattern: None,
        status,
        headers,
        body,
        was_base64,
    })
}

/// Decode base64 text, ignoring surrounding whitespace
///
/// # Errors
///
/// Returns error if the data is not valid base64
pub fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);

    STANDARD
        .decode(&data[start..end])
        .map_err(|e| RecorderError::InvalidFormat(format!("Invalid base64 body: {e}")))
}

fn parse_status(line: &str) -> Result<u16> {
    line.trim()
        .parse()
        .map_err(|_| RecorderError::InvalidFormat(format!("Invalid status code: {line}")))
}

/// Line reader over the textual head of a recording
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Next line without its `\n` or `\r\n` terminator
    fn line(&mut self) -> Result<&'a str> {
        let remaining = &self.data[self.pos..];
        let Some(end) = remaining.iter().position(|&b| b == b'\n') else {
            return Err(RecorderError::InvalidFormat(
                "Unexpected end of recording head".to_string(),
            ));
        };

        self.pos += end + 1;
        let line = &remaining[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        std::str::from_utf8(line)
            .map_err(|_| RecorderError::InvalidFormat("Head is not valid UTF-8".to_string()))
    }

    /// Header lines up to and including the blank separator line
    fn headers(&mut self) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        loop {
            let line = self.line()?;
            if line.is_empty() {
                return Ok(headers);
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                RecorderError::InvalidFormat(format!("Invalid header line: {line}"))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_mocktail() {
        let data = b"GET\n/api$\n201\nContent-Type: application/json\nX-Id: 7\n\n{\"a\":1}";
        let parsed = parse_mocktail(data).unwrap();

        assert_eq!(parsed.method.as_deref(), Some("GET"));
        assert_eq!(parsed.url_pattern.as_deref(), Some("/api$"));
        assert_eq!(parsed.status, 201);
        assert_eq!(parsed.header("x-id"), Some("7"));
        assert_eq!(parsed.body, b"{\"a\":1}");
        assert!(!parsed.was_base64);
    }

    #[test]
    fn test_parse_mocktail_base64() {
        let data = b"GET\n/img$\n200\nContent-Type: image/png;base64\n\niVBORw==";
        let parsed = parse_mocktail(data).unwrap();

        assert!(parsed.was_base64);
        assert_eq!(parsed.header("content-type"), Some("image/png"));
        assert_eq!(parsed.body, b"\x89PNG");
    }

    #[test]
    fn test_parse_mocktail_without_headers() {
        let parsed = parse_mocktail(b"DELETE\n/x$\n204\n\n").unwrap();
        assert_eq!(parsed.status, 204);
        assert!(parsed.headers.is_empty());
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_parse_mocktail_truncated() {
        assert!(parse_mocktail(b"GET\n/x$\n").is_err());
        assert!(parse_mocktail(b"GET\n/x$\nabc\n\n").is_err());
    }

    #[test]
    fn test_parse_http_message() {
        let data = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nnope";
        let parsed = parse_http_message(data).unwrap();

        assert_eq!(parsed.status, 404);
        assert_eq!(parsed.header("content-length"), Some("4"));
        assert_eq!(parsed.body, b"nope");
        assert!(parsed.method.is_none());
    }

    #[test]
    fn test_parse_http_message_base64() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Transfer-Encoding: base64\r\nContent-Length: 4\r\n\r\nAAE=";
        let parsed = parse_http_message(data).unwrap();

        assert!(parsed.was_base64);
        assert_eq!(parsed.body, vec![0u8, 1]);
    }

    #[test]
    fn test_parse_http_message_rejects_garbage() {
        assert!(parse_http_message(b"hello world\r\n\r\n").is_err());
    }

    #[test]
    fn test_read_recording_by_extension() {
        let temp_dir = TempDir::new().unwrap();
        let tail = temp_dir.path().join("a.tail");
        std::fs::write(&tail, b"GET\n/a$\n200\n\nok").unwrap();
        let unknown = temp_dir.path().join("a.json");
        std::fs::write(&unknown, b"{}").unwrap();

        assert_eq!(read_recording(&tail).unwrap().body, b"ok");
        assert!(read_recording(&unknown).is_err());
    }

    #[test]
    fn test_read_body_only() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.bin");
        std::fs::write(&path, b"AAE=\n").unwrap();

        assert_eq!(read_body_only(&path, true).unwrap(), vec![0u8, 1]);
        assert_eq!(read_body_only(&path, false).unwrap(), b"AAE=\n");
    }
}
