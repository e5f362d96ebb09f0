//! Recording session state

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use crate::config::RecordingFormat;
use crate::policy::PolicyEvaluator;

/// Snapshot of a session's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Exchanges written to disk
    pub recorded: u64,
    /// Requests the policy (or the tracking limit) declined
    pub ignored: u64,
    /// Exchanges dropped by error, cancel, limits, or stop
    pub aborted: u64,
    /// Exchanges whose file could not be written
    pub write_failures: u64,
    /// Policy callbacks that failed or panicked
    pub policy_failures: u64,
    /// Total bytes written
    pub bytes_written: u64,
}

/// Live counters behind [`RecorderStats`]
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    recorded: AtomicU64,
    ignored: AtomicU64,
    aborted: AtomicU64,
    write_failures: AtomicU64,
    policy_failures: AtomicU64,
    bytes_written: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn record(&self, bytes: u64) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn ignore(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn abort(&self, count: u64) {
        self.aborted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn policy_failure(&self) {
        self.policy_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RecorderStats {
        RecorderStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            policy_failures: self.policy_failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// One `start`..`stop` span of a recorder
///
/// Settings are frozen when the session starts; exchanges carry the
/// generation they started in and are only written by that session.
pub(crate) struct RecordingSession {
    pub(crate) generation: u64,
    pub(crate) dir: PathBuf,
    pub(crate) format: RecordingFormat,
    pub(crate) policy: PolicyEvaluator,
    pub(crate) counters: SessionCounters,
    started_at: SystemTime,
}

impl RecordingSession {
    pub(crate) fn new(
        generation: u64,
        dir: PathBuf,
        format: RecordingFormat,
        policy: PolicyEvaluator,
    ) -> Self {
        Self {
            generation,
            dir,
            format,
            policy,
            counters: SessionCounters::default(),
            started_at: SystemTime::now(),
        }
    }

    /// Directory files are written to
    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Time since `start`
    pub(crate) fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}
