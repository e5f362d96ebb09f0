//! Captured request/response types

use std::fmt;

use bytes::{Bytes, BytesMut};
use hyper::Uri;

/// Identity of one intercepted request, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of an outbound request at the moment interception begins
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    /// HTTP method (e.g., "GET", "POST")
    pub method: String,
    /// Full request URI
    pub uri: Uri,
    /// Headers in transport order
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Bytes,
}

impl InterceptedRequest {
    /// Create a request with no headers and an empty body
    #[must_use]
    pub fn new(method: impl Into<String>, uri: Uri) -> Self {
        Self {
            method: method.into(),
            uri,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value with the given name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// URL path, `/` when the URI has none
    #[must_use]
    pub fn path(&self) -> &str {
        match self.uri.path() {
            "" => "/",
            path => path,
        }
    }

    /// Query string without the leading `?`
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }
}

/// Response status, headers and the body accumulated so far
#[derive(Debug, Clone, Default)]
pub struct InterceptedResponse {
    /// HTTP status code
    pub status: u16,
    /// Headers in transport order
    pub headers: Vec<(String, String)>,
    /// Body bytes received so far, in delivery order
    pub body: BytesMut,
}

impl InterceptedResponse {
    /// Create a response with an empty body buffer
    #[must_use]
    pub fn new(status: u16, headers: Vec<(String, String)>) -> Self {
        Self {
            status,
            headers,
            body: BytesMut::new(),
        }
    }

    /// First header value with the given name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Declared `Content-Type`, if any
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Declared `Content-Length`, if present and numeric
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }
}

/// One completed request/response pair, ready for encoding
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Originating request
    pub request: InterceptedRequest,
    /// Response metadata; its body buffer has been moved into `body`
    pub response: InterceptedResponse,
    /// Complete response body
    pub body: Bytes,
    /// Whether the body is persisted base64-encoded
    pub is_base64: bool,
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = InterceptedRequest::new("GET", Uri::from_static("http://example.com/a"))
            .with_header("Accept", "application/json");

        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.header("ACCEPT"), Some("application/json"));
        assert_eq!(request.header("content-type"), None);
    }

    #[test]
    fn test_path_and_query() {
        let request = InterceptedRequest::new(
            "GET",
            Uri::from_static("http://example.com/search?q=rust"),
        );
        assert_eq!(request.path(), "/search");
        assert_eq!(request.query(), Some("q=rust"));

        let bare = InterceptedRequest::new("GET", Uri::from_static("http://example.com"));
        assert_eq!(bare.path(), "/");
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn test_content_length() {
        let response = InterceptedResponse::new(
            200,
            vec![("Content-Length".to_string(), " 42 ".to_string())],
        );
        assert_eq!(response.content_length(), Some(42));

        let bogus = InterceptedResponse::new(
            200,
            vec![("content-length".to_string(), "lots".to_string())],
        );
        assert_eq!(bogus.content_length(), None);
    }
}
