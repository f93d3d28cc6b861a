//! Task state, results and lifecycle events.
//!
//! # State Transitions
//!
//! ```text
//!            replicate()
//! Pending ───────────────→ Active ←──────────────┐
//!    ↑                       │  │                │
//!    │   (nothing to do,     │  │ (retryable     │ (backoff
//!    │    live tailing)      │  │  failure)      │  elapsed)
//!    └───────────────────────┘  ↓                │
//!                            Stopped ────────────┘
//!
//! any state ── cancel() ──→ Cancelled
//! any state ── done / fatal ──→ Complete
//! ```
//!
//! - **Pending**: created, or paused with nothing queued.
//! - **Active**: batches are moving.
//! - **Stopped**: an attempt failed; waiting out the backoff.
//! - **Cancelled**: `cancel()` was called. Sticky.
//! - **Complete**: finished (successfully or not). Terminal.

use crate::error::ReplicationError;
use crate::store::{Document, Seq, WriteFailure};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// State of a replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Active,
    Stopped,
    Cancelled,
    Complete,
}

impl TaskState {
    /// Lower-case name, as used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Stopped => "stopped",
            TaskState::Cancelled => "cancelled",
            TaskState::Complete => "complete",
        }
    }

    /// No further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Complete)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a replication ended (or is ending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    Complete,
    Cancelled,
    /// A fatal error is being handled.
    Aborting,
}

/// Running totals of a replication task, kept across restarts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationResult {
    pub ok: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub docs_read: usize,
    pub docs_written: usize,
    pub doc_write_failures: usize,
    /// Per-document write failures, in the order they happened.
    pub errors: Vec<WriteFailure>,
    /// Highest durably checkpointed sequence.
    pub last_seq: Seq,
    pub status: Option<ReplicationStatus>,
}

impl ReplicationResult {
    pub fn new() -> Self {
        Self {
            ok: true,
            start_time: Utc::now(),
            end_time: None,
            docs_read: 0,
            docs_written: 0,
            doc_write_failures: 0,
            errors: Vec::new(),
            last_seq: Seq::ZERO,
            status: None,
        }
    }

    /// Reset the per-attempt flags. Counters and errors are preserved.
    pub fn begin_attempt(&mut self) {
        self.ok = true;
        self.status = None;
    }
}

impl Default for ReplicationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of [`ReplicationEvent::Change`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeInfo {
    /// Snapshot of the result after the batch was written.
    pub result: ReplicationResult,
    /// Documents the target accepted.
    pub docs: Vec<Document>,
    /// Remaining changes reported by the source, if any.
    pub pending: Option<u64>,
}

/// Lifecycle events of a replication task.
///
/// A task emits exactly one terminal event (`Complete` or `Error`), after
/// which the event channel closes.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// Batches started moving after a pause.
    Active,
    /// Nothing to do. `error` is set when an attempt failed and the task is
    /// about to back off and restart.
    Paused { error: Option<ReplicationError> },
    /// A batch was written.
    Change(ChangeInfo),
    /// The target refused a document for authorization reasons.
    Denied(WriteFailure),
    /// Finished or cancelled.
    Complete(ReplicationResult),
    /// Failed for good.
    Error {
        error: ReplicationError,
        result: ReplicationResult,
    },
}

impl ReplicationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicationEvent::Complete(_) | ReplicationEvent::Error { .. })
    }
}

/// A replication that failed for good, with what it achieved before.
#[derive(Debug, Clone, Error)]
#[error("replication failed: {error}")]
pub struct ReplicationFailure {
    #[source]
    pub error: ReplicationError,
    pub result: ReplicationResult,
}
