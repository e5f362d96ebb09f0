//! Recording policy: which exchanges to record and how
//!
//! Callers customise recording by implementing [`RecordingPolicy`]. Every
//! method has a default, so a policy only overrides what it cares about.
//! The recorder never calls a policy directly; it goes through
//! [`PolicyEvaluator`], which turns callback errors and panics into
//! [`RecorderError::PolicyCallbackFailure`] so they can never reach the
//! traffic being observed.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::exchange::{Exchange, InterceptedRequest, InterceptedResponse};
use crate::{RecorderError, Result};

/// Error type returned by policy callbacks
pub type PolicyError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by policy callbacks
pub type PolicyResult<T> = std::result::Result<T, PolicyError>;

/// What a custom serializer produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomOutput {
    /// Content to be written atomically at the resolved path
    Content(Vec<u8>),
    /// The serializer wrote the file itself, at this path
    Written(PathBuf),
}

/// User-supplied recording strategy
pub trait RecordingPolicy: Send + Sync {
    /// Whether a request should be recorded. Decided once, at request start.
    fn should_record(&self, _request: &InterceptedRequest) -> PolicyResult<bool> {
        Ok(true)
    }

    /// Whether the response body should be stored base64-encoded
    fn should_base64(
        &self,
        _request: &InterceptedRequest,
        response: &InterceptedResponse,
    ) -> PolicyResult<bool> {
        Ok(default_base64(response.content_type()))
    }

    /// File name for the exchange; `default_name` is already unique
    fn file_name(
        &self,
        _request: &InterceptedRequest,
        default_name: &str,
    ) -> PolicyResult<String> {
        Ok(default_name.to_string())
    }

    /// URL-matching pattern embedded in Mocktail output
    fn url_pattern(
        &self,
        _request: &InterceptedRequest,
        default_pattern: &str,
    ) -> PolicyResult<String> {
        Ok(default_pattern.to_string())
    }

    /// Serialize an exchange for [`RecordingFormat::Custom`](crate::config::RecordingFormat::Custom)
    fn serialize_custom(&self, _exchange: &Exchange, _path: &Path) -> PolicyResult<CustomOutput> {
        Err("no custom serializer configured".into())
    }
}

/// Policy that keeps every default
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl RecordingPolicy for DefaultPolicy {}

/// Guards calls into a [`RecordingPolicy`]
#[derive(Clone)]
pub struct PolicyEvaluator {
    policy: Arc<dyn RecordingPolicy>,
}

impl PolicyEvaluator {
    /// Wrap a policy
    #[must_use]
    pub fn new(policy: Arc<dyn RecordingPolicy>) -> Self {
        Self { policy }
    }

    /// Evaluate the record decision
    ///
    /// # Errors
    ///
    /// Returns `PolicyCallbackFailure` if the callback fails or panics
    pub fn should_record(&self, request: &InterceptedRequest) -> Result<bool> {
        guard("should_record", || self.policy.should_record(request))
    }

    /// Evaluate the base64 decision
    ///
    /// # Errors
    ///
    /// Returns `PolicyCallbackFailure` if the callback fails or panics
    pub fn should_base64(
        &self,
        request: &InterceptedRequest,
        response: &InterceptedResponse,
    ) -> Result<bool> {
        guard("should_base64", || {
            self.policy.should_base64(request, response)
        })
    }

    /// Evaluate the file name override
    ///
    /// # Errors
    ///
    /// Returns `PolicyCallbackFailure` if the callback fails or panics
    pub fn file_name(&self, request: &InterceptedRequest, default_name: &str) -> Result<String> {
        guard("file_name", || self.policy.file_name(request, default_name))
    }

    /// Evaluate the URL pattern, starting from [`default_url_pattern`]
    ///
    /// # Errors
    ///
    /// Returns `PolicyCallbackFailure` if the callback fails or panics
    pub fn url_pattern(&self, request: &InterceptedRequest) -> Result<String> {
        let default_pattern = default_url_pattern(request);
        guard("url_pattern", || {
            self.policy.url_pattern(request, &default_pattern)
        })
    }

    /// Run the custom serializer
    ///
    /// # Errors
    ///
    /// Returns `PolicyCallbackFailure` if the callback fails or panics
    pub fn serialize_custom(&self, exchange: &Exchange, path: &Path) -> Result<CustomOutput> {
        guard("serialize_custom", || {
            self.policy.serialize_custom(exchange, path)
        })
    }
}

impl Default for PolicyEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(DefaultPolicy))
    }
}

fn guard<T>(callback: &'static str, f: impl FnOnce() -> PolicyResult<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RecorderError::PolicyCallbackFailure {
            callback,
            reason: e.to_string(),
        }),
        Err(payload) => Err(RecorderError::PolicyCallbackFailure {
            callback,
            reason: format!("panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Default base64 decision from a `Content-Type` value
///
/// Text-like types (including JSON, XML, JavaScript and form data) are kept
/// verbatim; everything else is treated as binary.
#[must_use]
pub fn default_base64(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };

    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime.is_empty() {
        return false;
    }

    let is_text = mime.starts_with("text/")
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
        || matches!(
            mime.as_str(),
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/ecmascript"
                | "application/x-javascript"
                | "application/x-www-form-urlencoded"
                | "application/graphql"
                | "application/x-ndjson"
        );

    !is_text
}

/// Regex-safe pattern matching the request's path and query
#[must_use]
pub fn default_url_pattern(request: &InterceptedRequest) -> String {
    let mut pattern = regex::escape(request.path());
    if let Some(query) = request.query() {
        pattern.push_str(r"\?");
        pattern.push_str(&regex::escape(query));
    }
    pattern.push('$');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Uri;

    fn request(uri: &'static str) -> InterceptedRequest {
        InterceptedRequest::new("GET", Uri::from_static(uri))
    }

    struct Failing;

    impl RecordingPolicy for Failing {
        fn should_record(&self, _request: &InterceptedRequest) -> PolicyResult<bool> {
            Err("database unavailable".into())
        }

        fn file_name(&self, _request: &InterceptedRequest, _default: &str) -> PolicyResult<String> {
            panic!("naming exploded");
        }
    }

    #[test]
    fn test_default_base64_text_types() {
        assert!(!default_base64(None));
        assert!(!default_base64(Some("")));
        assert!(!default_base64(Some("text/html; charset=utf-8")));
        assert!(!default_base64(Some("application/json")));
        assert!(!default_base64(Some("application/vnd.api+json")));
        assert!(!default_base64(Some("application/atom+xml")));
        assert!(!default_base64(Some("APPLICATION/XML")));
    }

    #[test]
    fn test_default_base64_binary_types() {
        assert!(default_base64(Some("image/png")));
        assert!(default_base64(Some("application/octet-stream")));
        assert!(default_base64(Some("application/pdf")));
        assert!(default_base64(Some("video/mp4")));
    }

    #[test]
    fn test_default_url_pattern() {
        assert_eq!(
            default_url_pattern(&request("http://example.com/api/v1.0/users")),
            r"/api/v1\.0/users$"
        );
        assert_eq!(
            default_url_pattern(&request("http://example.com/search?q=a+b")),
            r"/search\?q=a\+b$"
        );
        assert_eq!(default_url_pattern(&request("http://example.com")), "/$");
    }

    #[test]
    fn test_default_policy() {
        let evaluator = PolicyEvaluator::default();
        let req = request("http://example.com/a");

        assert!(evaluator.should_record(&req).unwrap());
        assert_eq!(evaluator.file_name(&req, "x.tail").unwrap(), "x.tail");
        assert_eq!(evaluator.url_pattern(&req).unwrap(), "/a$");

        let response = InterceptedResponse::new(
            200,
            vec![("Content-Type".to_string(), "image/gif".to_string())],
        );
        assert!(evaluator.should_base64(&req, &response).unwrap());
    }

    #[test]
    fn test_callback_error_is_reported() {
        let evaluator = PolicyEvaluator::new(Arc::new(Failing));
        let err = evaluator
            .should_record(&request("http://example.com/a"))
            .unwrap_err();

        assert!(matches!(
            err,
            RecorderError::PolicyCallbackFailure {
                callback: "should_record",
                ..
            }
        ));
        assert!(err.to_string().contains("database unavailable"));
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let evaluator = PolicyEvaluator::new(Arc::new(Failing));
        let err = evaluator
            .file_name(&request("http://example.com/a"), "x")
            .unwrap_err();

        assert!(err.to_string().contains("naming exploded"));
    }

    #[test]
    fn test_custom_serializer_missing() {
        let evaluator = PolicyEvaluator::default();
        let exchange = Exchange {
            request: request("http://example.com/a"),
            response: InterceptedResponse::new(200, vec![]),
            body: bytes::Bytes::new(),
            is_base64: false,
        };

        assert!(evaluator
            .serialize_custom(&exchange, Path::new("/tmp/x"))
            .is_err());
    }
}
