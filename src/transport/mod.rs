//! Interception hooks between a transport and the recorder
//!
//! A transport reports the life of every request it carries to a
//! [`TrafficObserver`]. The recorder installs itself as that observer
//! through [`TransportHook`] when a session starts and removes itself when
//! it stops, so the recorder never depends on a concrete transport.

mod client;
mod scripted;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub use client::{HyperTransport, RecordingBody};
pub use scripted::{Script, ScriptEvent, ScriptedTransport};

use crate::exchange::{ExchangeId, InterceptedRequest};

/// Receives lifecycle notifications for intercepted requests
///
/// Calls for one [`ExchangeId`] arrive in order: one start, at most one
/// headers, any number of chunks, then one of complete/error/cancel.
/// Calls for different ids may arrive concurrently. Implementations must
/// not panic and must not block for long: they run on the transport's
/// own threads.
pub trait TrafficObserver: Send + Sync {
    /// A request is about to be sent
    fn on_request_start(&self, id: ExchangeId, request: InterceptedRequest);

    /// Response status and headers arrived
    fn on_response_headers(&self, id: ExchangeId, status: u16, headers: Vec<(String, String)>);

    /// A piece of the response body arrived
    fn on_body_chunk(&self, id: ExchangeId, chunk: &[u8]);

    /// The response body finished
    fn on_complete(&self, id: ExchangeId);

    /// The exchange failed (connection error, body error)
    fn on_error(&self, id: ExchangeId, reason: &str);

    /// The exchange was abandoned before completion
    fn on_cancel(&self, id: ExchangeId);
}

/// A transport that can have an observer installed
pub trait TransportHook: Send + Sync {
    /// Start reporting traffic to `observer`, replacing any previous one
    fn install(&self, observer: Arc<dyn TrafficObserver>);

    /// Stop reporting traffic
    fn uninstall(&self);

    /// Whether an observer is installed
    fn is_installed(&self) -> bool;
}

/// Installed-observer slot shared by the transport adapters
#[derive(Default)]
pub(crate) struct ObserverSlot {
    observer: RwLock<Option<Arc<dyn TrafficObserver>>>,
    next_id: AtomicU64,
}

impl ObserverSlot {
    pub(crate) fn install(&self, observer: Arc<dyn TrafficObserver>) {
        *self.observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    pub(crate) fn uninstall(&self) {
        *self.observer.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn current(&self) -> Option<Arc<dyn TrafficObserver>> {
        self.observer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fresh identity for a request handle
    pub(crate) fn next_id(&self) -> ExchangeId {
        ExchangeId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
