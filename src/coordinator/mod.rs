// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication task coordinator.
//!
//! [`replicate()`] spawns a task that runs replication attempts until one
//! completes, the task is cancelled, or a failure is not worth retrying:
//!
//! ```text
//! validate options ──✗──▶ Error
//!        │
//!        ▼
//! ┌─▶ attempt (new session) ──▶ Completed ──▶ Complete
//! │          │
//! │          ├──────────────▶ Cancelled ──▶ Complete (status: cancelled)
//! │          │
//! │          ▼ Failed
//! │   auth / not retryable / retry off / attempts exhausted ──▶ Error
//! │          │
//! │          ▼
//! │   Paused{error}, Stopped, backoff sleep (cancellable)
//! └──────────┘
//! ```
//!
//! The [`ReplicationResult`] lives outside the loop, so counters survive
//! restarts. The checkpointer is built once per task.

mod driver;
mod types;

pub use types::{
    ChangeInfo, ReplicationEvent, ReplicationFailure, ReplicationResult, ReplicationStatus,
    TaskState,
};

use crate::checkpoint::Checkpointer;
use crate::config::{CheckpointMode, ReplicationOptions};
use crate::error::ReplicationError;
use crate::identity::generate_replication_id;
use crate::metrics;
use crate::store::DocumentStore;
use chrono::Utc;
use driver::{AttemptOutcome, Replication, Reporter};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Handle to a running replication.
///
/// Dropping the handle does not stop the replication; call
/// [`cancel()`](Self::cancel) for that.
pub struct ReplicationTask {
    replication_id: String,
    cancel_tx: watch::Sender<bool>,
    state_tx: Arc<watch::Sender<TaskState>>,
    state_rx: watch::Receiver<TaskState>,
    events: Option<mpsc::UnboundedReceiver<ReplicationEvent>>,
    handle: JoinHandle<Result<ReplicationResult, ReplicationFailure>>,
}

impl ReplicationTask {
    /// Checkpoint document id of this replication.
    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Stop the replication. Idempotent.
    ///
    /// The task finishes with a `Complete` event whose status is `cancelled`.
    pub fn cancel(&self) {
        if self.cancel_tx.send_replace(true) {
            return;
        }
        self.state_tx.send_if_modified(|state| {
            if *state == TaskState::Complete {
                return false;
            }
            *state = TaskState::Cancelled;
            true
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Get current task state.
    pub fn state(&self) -> TaskState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<TaskState> {
        self.state_rx.clone()
    }

    /// Take the lifecycle event stream. Returns `None` after the first call.
    ///
    /// The channel closes after the terminal `Complete` or `Error` event.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ReplicationEvent>> {
        self.events.take()
    }

    /// Wait for the replication to finish.
    pub async fn join(self) -> Result<ReplicationResult, ReplicationFailure> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ReplicationFailure {
                error: ReplicationError::Internal(format!("replication task failed: {}", e)),
                result: ReplicationResult::new(),
            }),
        }
    }
}

/// Start replicating `source` into `target`.
///
/// Must be called from within a Tokio runtime.
pub fn replicate<S, T>(source: Arc<S>, target: Arc<T>, options: ReplicationOptions) -> ReplicationTask
where
    S: DocumentStore,
    T: DocumentStore,
{
    let replication_id = generate_replication_id(&*source, &*target, &options);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(TaskState::Pending);
    let state_tx = Arc::new(state_tx);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let reporter = Reporter::new(events_tx, Arc::clone(&state_tx), &replication_id);
    let span = info_span!(
        "replication",
        replication_id = %reporter.replication_id(),
        source = %source.id(),
        target = %target.id(),
        live = options.live,
    );
    let handle = tokio::spawn(
        run_task(source, target, options, replication_id.clone(), reporter, cancel_rx).instrument(span),
    );

    ReplicationTask {
        replication_id,
        cancel_tx,
        state_tx,
        state_rx,
        events: Some(events_rx),
        handle,
    }
}

/// Resolve once the cancel flag is set. Never resolves if the handle is gone.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn fail(reporter: &Reporter, error: ReplicationError, mut result: ReplicationResult) -> ReplicationFailure {
    error!(error = %error, "Replication failed");
    result.ok = false;
    result.end_time.get_or_insert_with(Utc::now);
    reporter.emit(ReplicationEvent::Error {
        error: error.clone(),
        result: result.clone(),
    });
    reporter.finish(TaskState::Complete);
    ReplicationFailure { error, result }
}

fn finish_ok(reporter: &Reporter, result: ReplicationResult) -> ReplicationResult {
    info!(
        status = ?result.status,
        docs_read = result.docs_read,
        docs_written = result.docs_written,
        doc_write_failures = result.doc_write_failures,
        last_seq = %result.last_seq,
        "Replication complete"
    );
    reporter.emit(ReplicationEvent::Complete(result.clone()));
    reporter.finish(TaskState::Complete);
    result
}

async fn run_task<S, T>(
    source: Arc<S>,
    target: Arc<T>,
    options: ReplicationOptions,
    replication_id: String,
    reporter: Reporter,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<ReplicationResult, ReplicationFailure>
where
    S: DocumentStore,
    T: DocumentStore,
{
    let mut result = ReplicationResult::new();
    if let Err(e) = options.validate() {
        return Err(fail(&reporter, e, result));
    }

    info!(batch_size = options.batch_size, checkpoint = ?options.checkpoint, "Replication starting");
    let checkpointer = Arc::new(Checkpointer::new(
        Arc::clone(&source),
        Arc::clone(&target),
        replication_id,
        options.checkpoint,
    ));
    let retry = options.retry_config();
    let mut seed = options.since.clone();
    let mut attempt = 0usize;

    loop {
        result.begin_attempt();
        let session = uuid::Uuid::new_v4().to_string();
        let replication = Replication::new(
            Arc::clone(&source),
            Arc::clone(&target),
            options.clone(),
            Arc::clone(&checkpointer),
            session,
            reporter.clone(),
            cancel_rx.clone(),
            seed.clone(),
        );
        let report = replication.run(&mut result).await;

        // Later restarts resume from the stored checkpoint.
        if report.seeded && checkpointer.mode() != CheckpointMode::Disabled {
            seed = None;
        }

        let error = match report.outcome {
            AttemptOutcome::Completed | AttemptOutcome::Cancelled => {
                return Ok(finish_ok(&reporter, result));
            }
            AttemptOutcome::Failed(error) => error,
        };

        if report.activated {
            attempt = 0;
        }
        attempt += 1;

        if !options.retry || !error.is_retryable() || !retry.allows(attempt) {
            return Err(fail(&reporter, error, result));
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Replication attempt failed, restarting after backoff"
        );
        metrics::record_restart(reporter.replication_id(), error.name());
        reporter.set_state(TaskState::Stopped);
        reporter.emit(ReplicationEvent::Paused { error: Some(error) });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut cancel_rx) => {
                info!("Replication cancelled during backoff");
                result.status = Some(ReplicationStatus::Cancelled);
                result.end_time = Some(Utc::now());
                return Ok(finish_ok(&reporter, result));
            }
        }
    }
}
