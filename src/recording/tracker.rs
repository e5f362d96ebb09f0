//! Exchange tracker: matches streamed response data to its request

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::exchange::{ExchangeId, InterceptedRequest, InterceptedResponse};

/// Largest buffer reserved up front from a `Content-Length` header
const PREALLOC_MAX: usize = 1024 * 1024;

/// Lifecycle of one tracked exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Request seen, waiting for response headers
    Opened,
    /// Headers seen, accumulating body
    Streaming,
    /// Body finished; handed off for encoding
    Completed,
    /// Failed, cancelled, or discarded
    Aborted,
}

/// A live exchange owned by the tracker
#[derive(Debug)]
struct TrackedExchange {
    generation: u64,
    request: InterceptedRequest,
    response: Option<InterceptedResponse>,
}

impl TrackedExchange {
    fn state(&self) -> ExchangeState {
        if self.response.is_some() {
            ExchangeState::Streaming
        } else {
            ExchangeState::Opened
        }
    }
}

#[derive(Debug)]
enum Slot {
    /// Rejected at start; every later event is dropped
    Ignored,
    Live(TrackedExchange),
}

/// Result of offering a request to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A live entry was created
    Recording,
    /// The request is tracked as ignored
    Ignored,
    /// The identity is already in flight; the new start was dropped
    Duplicate,
}

/// Result of delivering a body chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Appended to the live entry
    Appended,
    /// The identity is ignored or unknown
    Dropped,
    /// The entry was aborted and released
    Aborted {
        /// Session generation of the released entry
        generation: u64,
        /// Why it was aborted
        reason: String,
    },
}

/// Result of a completion notification
#[derive(Debug)]
pub enum CompleteOutcome {
    /// The exchange finished and is ready to encode
    Finished(FinishedExchange),
    /// The identity is ignored or unknown
    Dropped,
    /// Completion arrived before response headers
    Aborted {
        /// Session generation of the released entry
        generation: u64,
    },
}

/// A completed exchange released by the tracker
#[derive(Debug)]
pub struct FinishedExchange {
    /// Identity the exchange was tracked under
    pub id: ExchangeId,
    /// Session generation the request started in
    pub generation: u64,
    /// Originating request
    pub request: InterceptedRequest,
    /// Response with its complete body
    pub response: InterceptedResponse,
}

/// Tracks in-flight exchanges by transport identity
///
/// Entries are independent: each lives in its own map slot and is only
/// touched by the events for its identity. Only live entries count toward
/// the in-flight limit.
pub struct ExchangeTracker {
    entries: DashMap<ExchangeId, Slot>,
    live: AtomicUsize,
    max_body_size: usize,
    max_in_flight: usize,
}

impl ExchangeTracker {
    /// Create a tracker with the given limits
    ///
    /// # Panics
    ///
    /// Panics if either limit is 0
    #[must_use]
    pub fn new(max_body_size: usize, max_in_flight: usize) -> Self {
        assert!(max_body_size > 0, "max_body_size must be > 0");
        assert!(max_in_flight > 0, "max_in_flight must be > 0");

        Self {
            entries: DashMap::new(),
            live: AtomicUsize::new(0),
            max_body_size,
            max_in_flight,
        }
    }

    /// Start tracking a request
    ///
    /// `record` is the policy decision made at request start; when false the
    /// identity is remembered as ignored until its terminal event.
    pub fn open(
        &self,
        id: ExchangeId,
        request: InterceptedRequest,
        generation: u64,
        record: bool,
    ) -> OpenOutcome {
        match self.entries.entry(id) {
            Entry::Occupied(_) => {
                warn!("Exchange {} already in flight, ignoring duplicate start", id);
                OpenOutcome::Duplicate
            }
            Entry::Vacant(slot) => {
                if !record {
                    slot.insert(Slot::Ignored);
                    return OpenOutcome::Ignored;
                }

                if !self.reserve() {
                    warn!(
                        "Tracking limit of {} exchanges reached, not recording {}",
                        self.max_in_flight, id
                    );
                    slot.insert(Slot::Ignored);
                    return OpenOutcome::Ignored;
                }

                trace!("Exchange {} opened: {} {}", id, request.method, request.uri);
                slot.insert(Slot::Live(TrackedExchange {
                    generation,
                    request,
                    response: None,
                }));
                OpenOutcome::Recording
            }
        }
    }

    /// Take one unit of live capacity
    fn reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_in_flight).then_some(live + 1)
            })
            .is_ok()
    }

    /// Remove an entry, returning its slot and releasing capacity if it was live
    fn release(&self, id: ExchangeId) -> Option<Slot> {
        let (_, slot) = self.entries.remove(&id)?;
        if matches!(slot, Slot::Live(_)) {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        Some(slot)
    }

    /// Record response headers, moving the entry to `Streaming`
    ///
    /// Returns false if the identity is ignored, unknown, or already has
    /// headers.
    pub fn headers(&self, id: ExchangeId, status: u16, headers: Vec<(String, String)>) -> bool {
        let Some(mut slot) = self.entries.get_mut(&id) else {
            return false;
        };
        let Slot::Live(live) = slot.value_mut() else {
            return false;
        };

        if live.response.is_some() {
            warn!("Exchange {} received headers twice, keeping the first", id);
            return false;
        }

        let mut response = InterceptedResponse::new(status, headers);
        if let Some(len) = response.content_length() {
            response.body = BytesMut::with_capacity(len.min(self.max_body_size).min(PREALLOC_MAX));
        }
        live.response = Some(response);
        trace!("Exchange {} {:?}", id, ExchangeState::Streaming);
        true
    }

    /// Append a body chunk in arrival order
    pub fn append(&self, id: ExchangeId, chunk: &[u8]) -> ChunkOutcome {
        let verdict = match self.entries.get_mut(&id) {
            None => return ChunkOutcome::Dropped,
            Some(mut slot) => match slot.value_mut() {
                Slot::Ignored => return ChunkOutcome::Dropped,
                Slot::Live(live) => {
                    let generation = live.generation;
                    match live.response.as_mut() {
                        None => Err((generation, "body chunk before response headers".to_string())),
                        Some(response) => {
                            let size = response.body.len() + chunk.len();
                            if size > self.max_body_size {
                                Err((
                                    generation,
                                    format!(
                                        "body of {size} bytes exceeds limit of {} bytes",
                                        self.max_body_size
                                    ),
                                ))
                            } else {
                                response.body.extend_from_slice(chunk);
                                Ok(())
                            }
                        }
                    }
                }
            },
        };

        match verdict {
            Ok(()) => ChunkOutcome::Appended,
            Err((generation, reason)) => {
                self.release(id);
                debug!("Exchange {} {:?}: {}", id, ExchangeState::Aborted, reason);
                ChunkOutcome::Aborted { generation, reason }
            }
        }
    }

    /// Release an entry whose body finished
    pub fn complete(&self, id: ExchangeId) -> CompleteOutcome {
        match self.release(id) {
            None | Some(Slot::Ignored) => CompleteOutcome::Dropped,
            Some(Slot::Live(live)) => match live.response {
                Some(response) => {
                    trace!("Exchange {} {:?}", id, ExchangeState::Completed);
                    CompleteOutcome::Finished(FinishedExchange {
                        id,
                        generation: live.generation,
                        request: live.request,
                        response,
                    })
                }
                None => {
                    debug!(
                        "Exchange {} {:?}: completed without response headers",
                        id,
                        ExchangeState::Aborted
                    );
                    CompleteOutcome::Aborted {
                        generation: live.generation,
                    }
                }
            },
        }
    }

    /// Release an entry without encoding it
    ///
    /// Returns the generation of the released live entry, if there was one.
    pub fn abort(&self, id: ExchangeId) -> Option<u64> {
        match self.release(id) {
            Some(Slot::Live(live)) => {
                trace!("Exchange {} {:?}", id, ExchangeState::Aborted);
                Some(live.generation)
            }
            _ => None,
        }
    }

    /// Drop every entry, returning how many were live
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            if matches!(slot, Slot::Live(_)) {
                removed += 1;
            }
            false
        });
        self.live.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    /// Current state of a live entry
    #[must_use]
    pub fn state(&self, id: ExchangeId) -> Option<ExchangeState> {
        match self.entries.get(&id)?.value() {
            Slot::Live(live) => Some(live.state()),
            Slot::Ignored => None,
        }
    }

    /// Whether the identity is tracked as ignored
    #[must_use]
    pub fn is_ignored(&self, id: ExchangeId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|slot| matches!(slot.value(), Slot::Ignored))
    }

    /// Number of live entries, the figure bounded by the in-flight limit
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of tracked identities, live or ignored
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Uri;

    fn request() -> InterceptedRequest {
        InterceptedRequest::new("GET", Uri::from_static("http://example.com/api/items"))
    }

    fn tracker() -> ExchangeTracker {
        ExchangeTracker::new(1024, 16)
    }

    #[test]
    fn test_full_lifecycle() {
        let tracker = tracker();
        let id = ExchangeId(1);

        assert_eq!(tracker.open(id, request(), 1, true), OpenOutcome::Recording);
        assert_eq!(tracker.state(id), Some(ExchangeState::Opened));

        assert!(tracker.headers(id, 200, vec![]));
        assert_eq!(tracker.state(id), Some(ExchangeState::Streaming));

        assert_eq!(tracker.append(id, b"hello "), ChunkOutcome::Appended);
        assert_eq!(tracker.append(id, b"world"), ChunkOutcome::Appended);

        match tracker.complete(id) {
            CompleteOutcome::Finished(done) => {
                assert_eq!(done.id, id);
                assert_eq!(done.generation, 1);
                assert_eq!(done.response.status, 200);
                assert_eq!(&done.response.body[..], b"hello world");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_ignored_request_stays_ignored() {
        let tracker = tracker();
        let id = ExchangeId(2);

        assert_eq!(tracker.open(id, request(), 1, false), OpenOutcome::Ignored);
        assert!(tracker.is_ignored(id));
        assert!(!tracker.headers(id, 200, vec![]));
        assert_eq!(tracker.append(id, b"data"), ChunkOutcome::Dropped);
        assert!(matches!(tracker.complete(id), CompleteOutcome::Dropped));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_duplicate_start_keeps_first_entry() {
        let tracker = tracker();
        let id = ExchangeId(3);

        tracker.open(id, request(), 1, true);
        tracker.headers(id, 200, vec![]);
        tracker.append(id, b"first");

        assert_eq!(tracker.open(id, request(), 1, true), OpenOutcome::Duplicate);
        assert_eq!(tracker.state(id), Some(ExchangeState::Streaming));
    }

    #[test]
    fn test_identity_reusable_after_release() {
        let tracker = tracker();
        let id = ExchangeId(4);

        tracker.open(id, request(), 1, true);
        assert_eq!(tracker.abort(id), Some(1));
        assert_eq!(tracker.open(id, request(), 2, true), OpenOutcome::Recording);
    }

    #[test]
    fn test_concurrent_identical_requests_are_independent() {
        let tracker = tracker();
        let (a, b) = (ExchangeId(10), ExchangeId(11));

        tracker.open(a, request(), 1, true);
        tracker.open(b, request(), 1, true);
        tracker.headers(a, 200, vec![]);
        tracker.headers(b, 200, vec![]);
        tracker.append(a, b"aaa");
        tracker.append(b, b"bb");
        tracker.append(a, b"a");

        assert_eq!(tracker.abort(b), Some(1));
        match tracker.complete(a) {
            CompleteOutcome::Finished(done) => assert_eq!(&done.response.body[..], b"aaaa"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_chunk_before_headers_aborts() {
        let tracker = tracker();
        let id = ExchangeId(5);

        tracker.open(id, request(), 3, true);
        assert!(matches!(
            tracker.append(id, b"early"),
            ChunkOutcome::Aborted { generation: 3, .. }
        ));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_body_limit_aborts() {
        let tracker = ExchangeTracker::new(8, 16);
        let id = ExchangeId(6);

        tracker.open(id, request(), 1, true);
        tracker.headers(id, 200, vec![]);
        assert_eq!(tracker.append(id, b"12345678"), ChunkOutcome::Appended);
        assert!(matches!(
            tracker.append(id, b"9"),
            ChunkOutcome::Aborted { .. }
        ));
        assert!(matches!(tracker.complete(id), CompleteOutcome::Dropped));
    }

    #[test]
    fn test_complete_without_headers_aborts() {
        let tracker = tracker();
        let id = ExchangeId(7);

        tracker.open(id, request(), 2, true);
        assert!(matches!(
            tracker.complete(id),
            CompleteOutcome::Aborted { generation: 2 }
        ));
    }

    #[test]
    fn test_in_flight_limit() {
        let tracker = ExchangeTracker::new(1024, 2);

        assert_eq!(tracker.open(ExchangeId(1), request(), 1, true), OpenOutcome::Recording);
        assert_eq!(tracker.open(ExchangeId(2), request(), 1, true), OpenOutcome::Recording);
        assert_eq!(tracker.open(ExchangeId(3), request(), 1, true), OpenOutcome::Ignored);
        assert!(tracker.is_ignored(ExchangeId(3)));
    }

    #[test]
    fn test_ignored_slots_do_not_consume_capacity() {
        let tracker = ExchangeTracker::new(1024, 2);

        assert_eq!(tracker.open(ExchangeId(1), request(), 1, false), OpenOutcome::Ignored);
        assert_eq!(tracker.open(ExchangeId(2), request(), 1, false), OpenOutcome::Ignored);
        assert_eq!(tracker.open(ExchangeId(3), request(), 1, true), OpenOutcome::Recording);
        assert_eq!(tracker.open(ExchangeId(4), request(), 1, true), OpenOutcome::Recording);
        assert_eq!(tracker.live_count(), 2);
        assert_eq!(tracker.len(), 4);
    }

    #[test]
    fn test_released_entries_free_capacity() {
        let tracker = ExchangeTracker::new(4, 2);

        tracker.open(ExchangeId(1), request(), 1, true);
        tracker.open(ExchangeId(2), request(), 1, true);
        tracker.open(ExchangeId(3), request(), 1, true);
        assert_eq!(tracker.open(ExchangeId(4), request(), 1, true), OpenOutcome::Ignored);

        // abort, completion without headers, and an oversized chunk all release
        tracker.abort(ExchangeId(1));
        tracker.complete(ExchangeId(2));
        tracker.open(ExchangeId(5), request(), 1, true);
        tracker.headers(ExchangeId(5), 200, vec![]);
        tracker.append(ExchangeId(5), b"too large");
        assert_eq!(tracker.live_count(), 1);
        tracker.abort(ExchangeId(3));
        assert_eq!(tracker.live_count(), 0);

        assert_eq!(tracker.open(ExchangeId(6), request(), 1, true), OpenOutcome::Recording);
        assert_eq!(tracker.open(ExchangeId(7), request(), 1, true), OpenOutcome::Recording);
        assert_eq!(tracker.clear(), 2);
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_content_length_preallocates() {
        let tracker = tracker();
        let id = ExchangeId(8);

        tracker.open(id, request(), 1, true);
        tracker.headers(id, 200, vec![("Content-Length".to_string(), "512".to_string())]);
        tracker.append(id, &[0u8; 512]);

        match tracker.complete(id) {
            CompleteOutcome::Finished(done) => assert_eq!(done.response.body.len(), 512),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_clear_counts_live_entries() {
        let tracker = tracker();
        tracker.open(ExchangeId(1), request(), 1, true);
        tracker.open(ExchangeId(2), request(), 1, false);
        tracker.open(ExchangeId(3), request(), 1, true);

        assert_eq!(tracker.clear(), 2);
        assert!(tracker.is_empty());
    }
}
