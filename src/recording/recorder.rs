//! Recorder controller: session lifecycle and exchange finalization

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use super::session::{RecorderStats, RecordingSession};
use super::tracker::{
    ChunkOutcome, CompleteOutcome, ExchangeTracker, FinishedExchange, OpenOutcome,
};
use crate::config::{RecorderConfig, RecordingFormat};
use crate::exchange::{Exchange, ExchangeId, InterceptedRequest};
use crate::naming::{default_file_name, extension_for, NameRegistry};
use crate::policy::{CustomOutput, DefaultPolicy, PolicyEvaluator, RecordingPolicy};
use crate::storage::{encode, check_writable, write_atomic};
use crate::transport::{TrafficObserver, TransportHook};
use crate::{RecorderError, Result};

/// Records the traffic of one transport into a directory
///
/// A recorder is idle until [`start`](Self::start) installs it on its
/// transport, and idle again after [`stop`](Self::stop). Every completed
/// exchange the policy accepts is written to its own file; failures for one
/// exchange are logged and counted, never returned to the traffic.
pub struct Recorder {
    core: Arc<RecorderCore>,
    transport: Arc<dyn TransportHook>,
    lifecycle: Mutex<()>,
}

impl Recorder {
    /// Create a recorder with default configuration
    #[must_use]
    pub fn new(transport: Arc<dyn TransportHook>) -> Self {
        Self::build(transport, &RecorderConfig::default())
    }

    /// Create a recorder from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn with_config(transport: Arc<dyn TransportHook>, config: &RecorderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(transport, config))
    }

    fn build(transport: Arc<dyn TransportHook>, config: &RecorderConfig) -> Self {
        let core = Arc::new_cyclic(|this| RecorderCore {
            this: this.clone(),
            state: Mutex::new(SessionState {
                format: config.format,
                policy: Arc::new(DefaultPolicy),
                format_subdirectories: config.format_subdirectories,
                active: None,
                last: None,
                naming: None,
                generation: 0,
                writes_in_flight: 0,
            }),
            drained: Condvar::new(),
            tracker: ExchangeTracker::new(config.limits.max_body_size, config.limits.max_in_flight),
        });

        Self {
            core,
            transport,
            lifecycle: Mutex::new(()),
        }
    }

    /// Start a session writing into `path`
    ///
    /// The directory is created if missing. Sequence numbers, claimed names
    /// and statistics start fresh.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRecording` if a session is active (the directory is
    /// not touched), or `InvalidPath` if the directory cannot be created or
    /// written
    pub fn start(&self, path: impl AsRef<Path>) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        let root = path.as_ref();

        let (format, policy, subdirectories) = {
            let state = self.core.state();
            if state.active.is_some() {
                return Err(RecorderError::AlreadyRecording);
            }
            (
                state.format,
                Arc::clone(&state.policy),
                state.format_subdirectories,
            )
        };

        if root.as_os_str().is_empty() {
            return Err(RecorderError::InvalidPath {
                path: root.to_path_buf(),
                reason: "path is empty".to_string(),
            });
        }

        let dir = if subdirectories {
            root.join(format.as_str())
        } else {
            root.to_path_buf()
        };
        prepare_dir(&dir)?;

        let stale = self.core.tracker.clear();
        if stale > 0 {
            debug!("Discarded {} exchanges left from an earlier session", stale);
        }

        let session = {
            let mut state = self.core.state();
            state.generation += 1;
            let session = Arc::new(RecordingSession::new(
                state.generation,
                dir.clone(),
                format,
                PolicyEvaluator::new(policy),
            ));
            state.naming = Some(NameRegistry::new(dir));
            state.active = Some(Arc::clone(&session));
            state.last = Some(Arc::clone(&session));
            session
        };

        self.transport.install(self.observer());

        info!(
            "Recording started: {} (format: {}, session {})",
            session.dir().display(),
            format,
            session.generation
        );
        Ok(())
    }

    /// Stop the active session
    ///
    /// Unfinished exchanges are discarded. Completed exchanges already
    /// admitted for writing finish first, so no write starts after this
    /// returns. Does nothing when idle.
    pub fn stop(&self) {
        let _lifecycle = lock(&self.lifecycle);

        let session = self.core.state().active.take();
        let Some(session) = session else {
            return;
        };

        self.transport.uninstall();
        let discarded = self.core.tracker.clear();
        session.counters.abort(discarded as u64);

        let mut state = self.core.state();
        while state.writes_in_flight > 0 {
            state = self
                .core
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.naming = None;
        drop(state);

        let stats = session.counters.snapshot();
        info!(
            "Recording stopped after {:?}: {} recorded, {} ignored, {} aborted, {} discarded unfinished",
            session.age(),
            stats.recorded,
            stats.ignored,
            stats.aborted,
            discarded
        );
    }

    /// Whether a session is active
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.core.state().active.is_some()
    }

    /// Format used by the next (or current) session
    #[must_use]
    pub fn format(&self) -> RecordingFormat {
        self.core.state().format
    }

    /// Directory the active session writes into
    #[must_use]
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.core
            .state()
            .active
            .as_ref()
            .map(|session| session.dir().to_path_buf())
    }

    /// Counters of the current or most recent session
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.core
            .state()
            .last
            .as_ref()
            .map(|session| session.counters.snapshot())
            .unwrap_or_default()
    }

    /// Number of exchanges currently tracked
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.core.tracker.len()
    }

    /// Observer handle for transports wired by hand
    ///
    /// Events delivered while no session is active are ignored.
    #[must_use]
    pub fn observer(&self) -> Arc<dyn TrafficObserver> {
        Arc::clone(&self.core) as Arc<dyn TrafficObserver>
    }

    /// Set the output format
    ///
    /// # Errors
    ///
    /// Returns `SessionActive` while recording
    pub fn set_format(&self, format: RecordingFormat) -> Result<()> {
        self.configure(|state| state.format = format)
    }

    /// Set the recording policy
    ///
    /// # Errors
    ///
    /// Returns `SessionActive` while recording
    pub fn set_policy(&self, policy: Arc<dyn RecordingPolicy>) -> Result<()> {
        self.configure(|state| state.policy = policy)
    }

    /// Write each format into its own subdirectory
    ///
    /// # Errors
    ///
    /// Returns `SessionActive` while recording
    pub fn set_format_subdirectories(&self, enabled: bool) -> Result<()> {
        self.configure(|state| state.format_subdirectories = enabled)
    }

    fn configure(&self, apply: impl FnOnce(&mut SessionState)) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        let mut state = self.core.state();
        if state.active.is_some() {
            return Err(RecorderError::SessionActive);
        }
        apply(&mut state);
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Session-wide state, guarded by one mutex
struct SessionState {
    format: RecordingFormat,
    policy: Arc<dyn RecordingPolicy>,
    format_subdirectories: bool,
    active: Option<Arc<RecordingSession>>,
    last: Option<Arc<RecordingSession>>,
    naming: Option<NameRegistry>,
    generation: u64,
    writes_in_flight: usize,
}

/// The part of a recorder installed on the transport
struct RecorderCore {
    this: Weak<RecorderCore>,
    state: Mutex<SessionState>,
    drained: Condvar,
    tracker: ExchangeTracker,
}

impl RecorderCore {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    fn active(&self) -> Option<Arc<RecordingSession>> {
        self.state().active.clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state()
            .active
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    fn count_abort(&self, generation: u64) {
        if let Some(session) = self.active().filter(|s| s.generation == generation) {
            session.counters.abort(1);
        }
    }

    /// Admit a finished exchange for writing
    ///
    /// Once admitted, the write is counted in flight and `stop()` waits for
    /// it. Exchanges from a session that is no longer active are dropped.
    fn admit(&self, finished: FinishedExchange) -> Option<PendingWrite> {
        let core = self.this.upgrade()?;

        let mut guard = self.state();
        let state = &mut *guard;
        let (session, sequence) = match (&state.active, state.naming.as_mut()) {
            (Some(session), Some(naming)) if session.generation == finished.generation => {
                (Arc::clone(session), naming.next_sequence())
            }
            _ => {
                debug!("Exchange {} outlived its session, discarding", finished.id);
                return None;
            }
        };
        state.writes_in_flight += 1;
        drop(guard);

        Some(PendingWrite {
            finished,
            session,
            sequence,
            in_flight: InFlightWrite { core },
        })
    }

    /// Keep later claims off a file a custom serializer placed itself
    fn reserve_written(&self, written: &Path) {
        let mut state = self.state();
        if let Some(naming) = state.naming.as_mut() {
            if !written.starts_with(naming.dir()) {
                warn!(
                    "Custom serializer wrote {} outside {}",
                    written.display(),
                    naming.dir().display()
                );
            }
            naming.reserve(written.to_path_buf());
        }
    }
}

impl TrafficObserver for RecorderCore {
    fn on_request_start(&self, id: ExchangeId, request: InterceptedRequest) {
        let Some(session) = self.active() else {
            return;
        };

        let (record, failed) = match session.policy.should_record(&request) {
            Ok(record) => (record, false),
            Err(e) => {
                policy_failed(&session, id, &e);
                (false, true)
            }
        };

        let outcome = self
            .tracker
            .open(id, request, session.generation, record);
        match outcome {
            OpenOutcome::Ignored if !failed => session.counters.ignore(),
            // stop() may have cleared the tracker while the policy ran
            OpenOutcome::Recording if !self.is_current(session.generation) => {
                if self.tracker.abort(id).is_some() {
                    debug!("Session ended while exchange {} was starting, discarding", id);
                    session.counters.abort(1);
                }
            }
            _ => {}
        }
    }

    fn on_response_headers(&self, id: ExchangeId, status: u16, headers: Vec<(String, String)>) {
        self.tracker.headers(id, status, headers);
    }

    fn on_body_chunk(&self, id: ExchangeId, chunk: &[u8]) {
        if let ChunkOutcome::Aborted { generation, reason } = self.tracker.append(id, chunk) {
            warn!("Dropping exchange {}: {}", id, reason);
            self.count_abort(generation);
        }
    }

    fn on_complete(&self, id: ExchangeId) {
        match self.tracker.complete(id) {
            CompleteOutcome::Finished(finished) => {
                if let Some(pending) = self.admit(finished) {
                    pending.dispatch();
                }
            }
            CompleteOutcome::Aborted { generation } => self.count_abort(generation),
            CompleteOutcome::Dropped => {}
        }
    }

    fn on_error(&self, id: ExchangeId, reason: &str) {
        if let Some(generation) = self.tracker.abort(id) {
            debug!("Exchange {} failed: {}", id, reason);
            self.count_abort(generation);
        }
    }

    fn on_cancel(&self, id: ExchangeId) {
        if let Some(generation) = self.tracker.abort(id) {
            debug!("Exchange {} cancelled", id);
            self.count_abort(generation);
        }
    }
}

/// An admitted exchange waiting to be encoded and written
struct PendingWrite {
    finished: FinishedExchange,
    session: Arc<RecordingSession>,
    sequence: u64,
    in_flight: InFlightWrite,
}

impl PendingWrite {
    /// Run the write on the blocking pool when inside a Tokio runtime,
    /// otherwise on the calling thread
    ///
    /// A blocking task dropped before it runs still releases its in-flight
    /// count.
    fn dispatch(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || self.run());
            }
            Err(_) => self.run(),
        }
    }

    fn run(self) {
        let Self {
            finished,
            session,
            sequence,
            in_flight,
        } = self;
        let core = &in_flight.core;
        let FinishedExchange {
            id,
            request,
            mut response,
            ..
        } = finished;

        // Policy callbacks run without the session lock
        let policy = &session.policy;
        let is_base64 = match policy.should_base64(&request, &response) {
            Ok(is_base64) => is_base64,
            Err(e) => {
                policy_failed(&session, id, &e);
                return;
            }
        };

        let body = response.body.split().freeze();
        let exchange = Exchange {
            request,
            response,
            body,
            is_base64,
        };

        let url_pattern = if session.format == RecordingFormat::Mocktail {
            match policy.url_pattern(&exchange.request) {
                Ok(pattern) => pattern,
                Err(e) => {
                    policy_failed(&session, id, &e);
                    return;
                }
            }
        } else {
            String::new()
        };

        let extension = extension_for(session.format, exchange.response.content_type());
        let default_name = default_file_name(&exchange.request, sequence, extension);
        let requested = match policy.file_name(&exchange.request, &default_name) {
            Ok(name) => name,
            Err(e) => {
                policy_failed(&session, id, &e);
                return;
            }
        };

        // The registry outlives every admitted write: stop() drops it only
        // after the in-flight count drains.
        let Some(path) = core
            .state()
            .naming
            .as_mut()
            .map(|naming| naming.claim(&requested, &default_name))
        else {
            warn!("No name registry for exchange {}, discarding", id);
            return;
        };

        match write_exchange(&session, &exchange, &path, &url_pattern) {
            Ok((written, bytes)) => {
                if written != path {
                    core.reserve_written(&written);
                }
                session.counters.record(bytes);
                debug!(
                    "Recorded {} {} -> {} ({} bytes)",
                    exchange.request.method,
                    exchange.request.uri,
                    written.display(),
                    bytes
                );
            }
            Err(e @ RecorderError::PolicyCallbackFailure { .. }) => {
                policy_failed(&session, id, &e);
            }
            Err(e) => {
                session.counters.write_failure();
                warn!("Failed to record exchange {}: {}", id, e);
            }
        }
    }
}

/// Marks a write as in progress until dropped
struct InFlightWrite {
    core: Arc<RecorderCore>,
}

impl Drop for InFlightWrite {
    fn drop(&mut self) {
        let mut state = self.core.state();
        state.writes_in_flight = state.writes_in_flight.saturating_sub(1);
        if state.writes_in_flight == 0 {
            self.core.drained.notify_all();
        }
    }
}

/// Encode and persist one exchange, returning the final path and size
fn write_exchange(
    session: &RecordingSession,
    exchange: &Exchange,
    path: &Path,
    url_pattern: &str,
) -> Result<(PathBuf, u64)> {
    let contents = match encode(session.format, exchange, url_pattern) {
        Some(contents) => contents,
        None => match session.policy.serialize_custom(exchange, path)? {
            CustomOutput::Content(contents) => contents,
            CustomOutput::Written(written) => {
                let bytes = std::fs::metadata(&written).map_or(0, |m| m.len());
                return Ok((written, bytes));
            }
        },
    };

    let bytes = write_atomic(path, &contents)?;
    Ok((path.to_path_buf(), bytes))
}

fn policy_failed(session: &RecordingSession, id: ExchangeId, error: &RecorderError) {
    session.counters.policy_failure();
    warn!("Not recording exchange {}: {}", id, error);
}

fn prepare_dir(dir: &Path) -> Result<()> {
    let invalid = |e: std::io::Error| RecorderError::InvalidPath {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    };

    std::fs::create_dir_all(dir).map_err(invalid)?;
    check_writable(dir).map_err(invalid)?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
