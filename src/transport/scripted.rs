//! Scripted transport: replays captured traffic events
//!
//! Scripts are built in code or loaded from a TOML capture file:
//!
//! ```toml
//! [[events]]
//! kind = "start"
//! id = 1
//! method = "GET"
//! url = "https://api.example.com/users"
//!
//! [[events]]
//! kind = "headers"
//! id = 1
//! status = 200
//! headers = [["Content-Type", "application/json"]]
//!
//! [[events]]
//! kind = "chunk"
//! id = 1
//! data = '{"users":[]}'
//!
//! [[events]]
//! kind = "complete"
//! id = 1
//! ```
//!
//! Binary chunks use `data_base64` instead of `data`.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use hyper::Uri;
use serde::Deserialize;
use tracing::debug;

use super::{ObserverSlot, TrafficObserver, TransportHook};
use crate::exchange::{ExchangeId, InterceptedRequest};
use crate::storage::decode_base64;
use crate::{RecorderError, Result};

/// One notification in a script
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    /// Request start
    Start {
        /// Request handle
        id: ExchangeId,
        /// Request snapshot
        request: InterceptedRequest,
    },
    /// Response headers
    Headers {
        /// Request handle
        id: ExchangeId,
        /// HTTP status code
        status: u16,
        /// Response headers
        headers: Vec<(String, String)>,
    },
    /// Body chunk
    Chunk {
        /// Request handle
        id: ExchangeId,
        /// Chunk bytes
        data: Bytes,
    },
    /// End of body
    Complete {
        /// Request handle
        id: ExchangeId,
    },
    /// Transport error
    Error {
        /// Request handle
        id: ExchangeId,
        /// Error description
        reason: String,
    },
    /// Request abandoned
    Cancel {
        /// Request handle
        id: ExchangeId,
    },
}

/// Ordered list of events to replay
#[derive(Debug, Clone, Default)]
pub struct Script {
    events: Vec<ScriptEvent>,
}

impl Script {
    /// Create an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request start
    #[must_use]
    pub fn start(mut self, id: u64, request: InterceptedRequest) -> Self {
        self.events.push(ScriptEvent::Start {
            id: ExchangeId(id),
            request,
        });
        self
    }

    /// Append response headers
    #[must_use]
    pub fn headers(mut self, id: u64, status: u16, headers: &[(&str, &str)]) -> Self {
        self.events.push(ScriptEvent::Headers {
            id: ExchangeId(id),
            status,
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
        });
        self
    }

    /// Append a body chunk
    #[must_use]
    pub fn chunk(mut self, id: u64, data: impl Into<Bytes>) -> Self {
        self.events.push(ScriptEvent::Chunk {
            id: ExchangeId(id),
            data: data.into(),
        });
        self
    }

    /// Append end of body
    #[must_use]
    pub fn complete(mut self, id: u64) -> Self {
        self.events.push(ScriptEvent::Complete { id: ExchangeId(id) });
        self
    }

    /// Append a transport error
    #[must_use]
    pub fn error(mut self, id: u64, reason: &str) -> Self {
        self.events.push(ScriptEvent::Error {
            id: ExchangeId(id),
            reason: reason.to_string(),
        });
        self
    }

    /// Append a cancellation
    #[must_use]
    pub fn cancel(mut self, id: u64) -> Self {
        self.events.push(ScriptEvent::Cancel { id: ExchangeId(id) });
        self
    }

    /// Append another script's events
    #[must_use]
    pub fn then(mut self, other: Script) -> Self {
        self.events.extend(other.events);
        self
    }

    /// Events in replay order
    #[must_use]
    pub fn events(&self) -> &[ScriptEvent] {
        &self.events
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the script has no events
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Load a script from a TOML capture file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RecorderError::InvalidScript(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a script from TOML
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ScriptFile =
            toml::from_str(content).map_err(|e| RecorderError::InvalidScript(e.to_string()))?;

        let events = file
            .events
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                raw.into_event().map_err(|e| match e {
                    RecorderError::InvalidScript(msg) => {
                        RecorderError::InvalidScript(format!("event {i}: {msg}"))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { events })
    }
}

#[derive(Deserialize)]
struct ScriptFile {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawEvent {
    Start {
        id: u64,
        method: String,
        url: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default)]
        body: String,
    },
    Headers {
        id: u64,
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    Chunk {
        id: u64,
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        data_base64: Option<String>,
    },
    Complete {
        id: u64,
    },
    Error {
        id: u64,
        #[serde(default)]
        reason: String,
    },
    Cancel {
        id: u64,
    },
}

impl RawEvent {
    fn into_event(self) -> Result<ScriptEvent> {
        let event = match self {
            Self::Start {
                id,
                method,
                url,
                headers,
                body,
            } => {
                let uri: Uri = url
                    .parse()
                    .map_err(|e| RecorderError::InvalidScript(format!("invalid url {url}: {e}")))?;
                let mut request = InterceptedRequest::new(method, uri).with_body(body);
                request.headers = headers;
                ScriptEvent::Start {
                    id: ExchangeId(id),
                    request,
                }
            }
            Self::Headers {
                id,
                status,
                headers,
            } => ScriptEvent::Headers {
                id: ExchangeId(id),
                status,
                headers,
            },
            Self::Chunk {
                id,
                data,
                data_base64,
            } => {
                let data = match (data, data_base64) {
                    (Some(text), None) => Bytes::from(text),
                    (None, Some(encoded)) => Bytes::from(decode_base64(encoded.as_bytes())?),
                    _ => {
                        return Err(RecorderError::InvalidScript(
                            "chunk needs exactly one of `data` or `data_base64`".to_string(),
                        ))
                    }
                };
                ScriptEvent::Chunk {
                    id: ExchangeId(id),
                    data,
                }
            }
            Self::Complete { id } => ScriptEvent::Complete { id: ExchangeId(id) },
            Self::Error { id, reason } => ScriptEvent::Error {
                id: ExchangeId(id),
                reason,
            },
            Self::Cancel { id } => ScriptEvent::Cancel { id: ExchangeId(id) },
        };
        Ok(event)
    }
}

/// Transport that delivers scripted events to the installed observer
#[derive(Default)]
pub struct ScriptedTransport {
    slot: ObserverSlot,
}

impl ScriptedTransport {
    /// Create a transport with no observer installed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every event of `script`, returning how many reached an observer
    pub fn play(&self, script: &Script) -> usize {
        script
            .events()
            .iter()
            .filter(|event| self.deliver(event))
            .count()
    }

    /// Deliver one event; returns false when no observer is installed
    pub fn deliver(&self, event: &ScriptEvent) -> bool {
        let Some(observer) = self.slot.current() else {
            debug!("No observer installed, dropping scripted event");
            return false;
        };

        match event {
            ScriptEvent::Start { id, request } => observer.on_request_start(*id, request.clone()),
            ScriptEvent::Headers {
                id,
                status,
                headers,
            } => observer.on_response_headers(*id, *status, headers.clone()),
            ScriptEvent::Chunk { id, data } => observer.on_body_chunk(*id, data),
            ScriptEvent::Complete { id } => observer.on_complete(*id),
            ScriptEvent::Error { id, reason } => observer.on_error(*id, reason),
            ScriptEvent::Cancel { id } => observer.on_cancel(*id),
        }
        true
    }
}

impl TransportHook for ScriptedTransport {
    fn install(&self, observer: Arc<dyn TrafficObserver>) {
        self.slot.install(observer);
    }

    fn uninstall(&self) {
        self.slot.uninstall();
    }

    fn is_installed(&self) -> bool {
        self.slot.current().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl TrafficObserver for Log {
        fn on_request_start(&self, id: ExchangeId, request: InterceptedRequest) {
            self.0
                .lock()
                .unwrap()
                .push(format!("start {id} {} {}", request.method, request.uri));
        }

        fn on_response_headers(&self, id: ExchangeId, status: u16, _: Vec<(String, String)>) {
            self.0.lock().unwrap().push(format!("headers {id} {status}"));
        }

        fn on_body_chunk(&self, id: ExchangeId, chunk: &[u8]) {
            self.0
                .lock()
                .unwrap()
                .push(format!("chunk {id} {}", chunk.len()));
        }

        fn on_complete(&self, id: ExchangeId) {
            self.0.lock().unwrap().push(format!("complete {id}"));
        }

        fn on_error(&self, id: ExchangeId, reason: &str) {
            self.0.lock().unwrap().push(format!("error {id} {reason}"));
        }

        fn on_cancel(&self, id: ExchangeId) {
            self.0.lock().unwrap().push(format!("cancel {id}"));
        }
    }

    #[test]
    fn test_play_without_observer() {
        let transport = ScriptedTransport::new();
        let script = Script::new().complete(1);

        assert!(!transport.is_installed());
        assert_eq!(transport.play(&script), 0);
    }

    #[test]
    fn test_play_delivers_in_order() {
        let transport = ScriptedTransport::new();
        let log = Arc::new(Log::default());
        transport.install(log.clone());

        let script = Script::new()
            .start(
                1,
                InterceptedRequest::new("GET", Uri::from_static("http://example.com/a")),
            )
            .headers(1, 200, &[("Content-Type", "text/plain")])
            .chunk(1, &b"abc"[..])
            .chunk(1, &b"de"[..])
            .complete(1)
            .then(Script::new().cancel(2));

        assert_eq!(transport.play(&script), 6);
        assert_eq!(
            *log.0.lock().unwrap(),
            vec![
                "start #1 GET http://example.com/a",
                "headers #1 200",
                "chunk #1 3",
                "chunk #1 2",
                "complete #1",
                "cancel #2",
            ]
        );

        transport.uninstall();
        assert_eq!(transport.play(&script), 0);
    }

    #[test]
    fn test_script_from_toml() {
        let script = Script::from_toml(
            r#"
            [[events]]
            kind = "start"
            id = 7
            method = "POST"
            url = "https://api.example.com/upload"
            headers = [["Content-Type", "application/octet-stream"]]
            body = "payload"

            [[events]]
            kind = "headers"
            id = 7
            status = 201

            [[events]]
            kind = "chunk"
            id = 7
            data_base64 = "AAEC"

            [[events]]
            kind = "error"
            id = 7
            reason = "connection reset"
            "#,
        )
        .unwrap();

        assert_eq!(script.len(), 4);
        match &script.events()[0] {
            ScriptEvent::Start { id, request } => {
                assert_eq!(*id, ExchangeId(7));
                assert_eq!(request.method, "POST");
                assert_eq!(request.body, Bytes::from_static(b"payload"));
                assert_eq!(request.header("content-type"), Some("application/octet-stream"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &script.events()[2] {
            ScriptEvent::Chunk { data, .. } => assert_eq!(&data[..], &[0u8, 1, 2]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_script_rejects_ambiguous_chunk() {
        let err = Script::from_toml(
            r#"
            [[events]]
            kind = "chunk"
            id = 1
            data = "a"
            data_base64 = "YQ=="
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("event 0"));
    }

    #[test]
    fn test_script_rejects_unknown_kind() {
        assert!(Script::from_toml("[[events]]\nkind = \"teleport\"\nid = 1\n").is_err());
    }
}
