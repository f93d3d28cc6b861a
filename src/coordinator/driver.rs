// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication attempt.
//!
//! A [`Replication`] owns every piece of mutable attempt state (pending batch,
//! FIFO, current batch) and advances it from a single `tokio::select!` loop
//! over three sources:
//!
//! ```text
//!            ┌───────────── cancel watch
//!            │
//! select! ───┼───────────── change feed      (paused while FIFO is full)
//!            │
//!            └───────────── in-flight stage  (seed → resume → diff → fetch
//!                                             → write → checkpoint)
//! ```
//!
//! Network work runs as owned `'static` futures, so no locks are needed and
//! dropping the future is how in-flight work is abandoned on cancel.
//!
//! # Cancellation
//!
//! Cancel drops the feed subscription, the FIFO and any in-flight diff, fetch
//! or write. A checkpoint write already in flight is allowed to settle before
//! the attempt completes.

use super::types::{ChangeInfo, ReplicationEvent, ReplicationResult, ReplicationStatus, TaskState};
use crate::batch::{fetch_docs, tally_writes, Batch, FetchOutcome, PendingBatch};
use crate::changes::{ChangesConsumer, FeedCompletion};
use crate::checkpoint::Checkpointer;
use crate::config::{CheckpointMode, ReplicationOptions};
use crate::error::ReplicationError;
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::store::{
    BulkDocsOptions, Document, DocumentStore, FeedEvent, RevsDiffEntry, Seq, StoreError, StoreResult,
    WriteResult,
};
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

type StageFuture = Pin<Box<dyn Future<Output = StageOutput> + Send>>;

/// Completion of the in-flight stage.
enum StageOutput {
    /// `since` was written as the starting checkpoint.
    Seeded(StoreResult<()>),
    /// The checkpoint to resume from was read.
    Resumed(StoreResult<Seq>),
    Diffed(StoreResult<BTreeMap<String, RevsDiffEntry>>),
    Fetched(FetchOutcome),
    Written(StoreResult<Vec<WriteResult>>),
    BatchCheckpointed(StoreResult<()>),
    /// Checkpoint of a drained feed with nothing left in the pipeline.
    DrainCheckpointed { last_seq: Seq, result: StoreResult<()> },
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptOutcome {
    Completed,
    Cancelled,
    Failed(ReplicationError),
}

/// Outcome plus what the restart loop needs to know.
#[derive(Debug)]
pub(crate) struct AttemptReport {
    pub outcome: AttemptOutcome,
    /// The attempt emitted `Active` (moved at least one batch).
    pub activated: bool,
    /// The caller-supplied `since` was durably written.
    pub seeded: bool,
}

/// Event and state sink shared by the task handle and its attempts.
#[derive(Clone)]
pub(crate) struct Reporter {
    events: mpsc::UnboundedSender<ReplicationEvent>,
    state: Arc<watch::Sender<TaskState>>,
    replication_id: String,
}

impl Reporter {
    pub fn new(
        events: mpsc::UnboundedSender<ReplicationEvent>,
        state: Arc<watch::Sender<TaskState>>,
        replication_id: &str,
    ) -> Self {
        Self {
            events,
            state,
            replication_id: replication_id.trim_start_matches("_local/").to_string(),
        }
    }

    /// Metrics label of this replication.
    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    pub fn emit(&self, event: ReplicationEvent) {
        // Receiver gone = nobody is listening.
        let _ = self.events.send(event);
    }

    /// Move to a non-terminal state. Terminal states are sticky.
    pub fn set_state(&self, next: TaskState) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            metrics::set_task_state(&self.replication_id, next.as_str());
        }
    }

    /// Enter a terminal state. `Cancelled` is never overwritten.
    pub fn finish(&self, terminal: TaskState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == TaskState::Cancelled || *current == terminal {
                return false;
            }
            *current = terminal;
            true
        });
        if changed {
            metrics::set_task_state(&self.replication_id, terminal.as_str());
        }
    }
}

async fn poll_stage(stage: &mut Option<StageFuture>) -> StageOutput {
    match stage {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// State of a single attempt.
pub(crate) struct Replication<S: DocumentStore, T: DocumentStore> {
    source: Arc<S>,
    target: Arc<T>,
    options: ReplicationOptions,
    checkpointer: Arc<Checkpointer<S, T>>,
    session: String,
    reporter: Reporter,
    cancel_rx: watch::Receiver<bool>,
    cancel_watch_open: bool,
    bulkhead: Bulkhead,

    /// Caller-supplied start position, written before resuming.
    seed: Option<Seq>,
    seeded: bool,

    consumer: ChangesConsumer,
    pending: PendingBatch,
    batches: VecDeque<Batch>,
    current: Option<Batch>,
    batch_started: Option<Instant>,
    in_flight: Option<StageFuture>,
    writing_checkpoint: bool,

    cancelled: bool,
    fatal: Option<ReplicationError>,
    finished: bool,
    active: bool,
    paused: bool,
    activated: bool,
}

impl<S: DocumentStore, T: DocumentStore> Replication<S, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<S>,
        target: Arc<T>,
        options: ReplicationOptions,
        checkpointer: Arc<Checkpointer<S, T>>,
        session: String,
        reporter: Reporter,
        cancel_rx: watch::Receiver<bool>,
        seed: Option<Seq>,
    ) -> Self {
        let consumer = ChangesConsumer::new(&options, Seq::ZERO);
        Self {
            source,
            target,
            options,
            checkpointer,
            session,
            reporter,
            cancel_rx,
            cancel_watch_open: true,
            bulkhead: Bulkhead::for_doc_fetch(),
            seed,
            seeded: false,
            consumer,
            pending: PendingBatch::new(Seq::ZERO),
            batches: VecDeque::new(),
            current: None,
            batch_started: None,
            in_flight: None,
            writing_checkpoint: false,
            cancelled: false,
            fatal: None,
            finished: false,
            active: false,
            paused: false,
            activated: false,
        }
    }

    /// Drive the attempt to completion, updating `result` as it goes.
    pub async fn run(mut self, result: &mut ReplicationResult) -> AttemptReport {
        info!(session = %self.session, "Replication attempt starting");

        if *self.cancel_rx.borrow_and_update() {
            self.on_cancel(result);
        } else {
            self.initialize();
        }

        let batches_limit = self.options.batches_limit;
        while !self.finished {
            tokio::select! {
                biased;

                changed = self.cancel_rx.changed(), if self.cancel_watch_open && !self.cancelled => {
                    match changed {
                        Ok(()) if *self.cancel_rx.borrow() => self.on_cancel(result),
                        Ok(()) => {}
                        // Handle dropped: nobody can cancel any more.
                        Err(_) => self.cancel_watch_open = false,
                    }
                }

                output = poll_stage(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_stage(output, result);
                }

                event = self.consumer.next_event(),
                    if !self.cancelled && self.batches.len() < batches_limit => {
                    self.on_feed_event(event, result);
                }
            }
        }

        let outcome = if self.cancelled {
            AttemptOutcome::Cancelled
        } else if let Some(error) = self.fatal.take() {
            AttemptOutcome::Failed(error)
        } else {
            AttemptOutcome::Completed
        };
        debug!(session = %self.session, outcome = ?outcome, "Replication attempt finished");
        AttemptReport {
            outcome,
            activated: self.activated,
            seeded: self.seeded,
        }
    }

    fn set_stage(&mut self, fut: impl Future<Output = StageOutput> + Send + 'static) {
        self.in_flight = Some(Box::pin(fut));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Initializing
    // ═══════════════════════════════════════════════════════════════════════════

    fn initialize(&mut self) {
        match self.seed.clone() {
            Some(since) => {
                let checkpointer = Arc::clone(&self.checkpointer);
                let session = self.session.clone();
                self.writing_checkpoint = true;
                self.set_stage(async move {
                    StageOutput::Seeded(checkpointer.write_checkpoint(&since, &session).await)
                });
            }
            None => self.resume(),
        }
    }

    fn resume(&mut self) {
        let checkpointer = Arc::clone(&self.checkpointer);
        self.set_stage(async move { StageOutput::Resumed(checkpointer.get_checkpoint().await) });
    }

    fn start_changes(&mut self, checkpoint: Seq, result: &mut ReplicationResult) {
        // Without stored checkpoints the seed is the only start position.
        let since = match (&self.seed, self.checkpointer.mode()) {
            (Some(seed), CheckpointMode::Disabled) => seed.clone(),
            _ => checkpoint,
        };
        info!(since = %since, session = %self.session, "Resuming from checkpoint");
        if since > result.last_seq {
            result.last_seq = since.clone();
        }
        self.consumer = ChangesConsumer::new(&self.options, since.clone());
        self.pending = PendingBatch::new(since);
        self.get_changes();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Change feed
    // ═══════════════════════════════════════════════════════════════════════════

    fn get_changes(&mut self) {
        if self.cancelled || !self.consumer.can_fetch(self.batches.len(), self.options.batches_limit) {
            return;
        }
        self.consumer.subscribe(&*self.source);
        metrics::record_changes_request(self.reporter.replication_id(), self.consumer.is_live());
    }

    fn on_feed_event(&mut self, event: Option<StoreResult<FeedEvent>>, result: &mut ReplicationResult) {
        match event {
            Some(Ok(FeedEvent::Change(change))) => {
                self.consumer.route(change, &mut self.pending);
                let immediate = self.batches.is_empty() && self.consumer.is_live();
                self.process_pending(immediate, result);
            }
            Some(Ok(FeedEvent::Complete { last_seq, results })) => {
                debug!(last_seq = %last_seq, results, "Change feed page complete");
                match self.consumer.on_complete(last_seq, results) {
                    FeedCompletion::MoreAvailable => {
                        self.get_changes();
                        self.process_pending(true, result);
                    }
                    FeedCompletion::Drained { last_seq } => self.on_drained(last_seq, result),
                }
            }
            Some(Err(e)) => self.abort(ReplicationError::store("changes", e), result),
            None => self.abort(
                ReplicationError::store(
                    "changes",
                    StoreError::Unavailable("change feed ended unexpectedly".to_string()),
                ),
                result,
            ),
        }
    }

    fn on_drained(&mut self, last_seq: Seq, result: &mut ReplicationResult) {
        let idle = self.current.is_none()
            && self.batches.is_empty()
            && self.pending.is_empty()
            && self.in_flight.is_none();
        if !idle {
            self.continue_after_drain(last_seq, result);
            return;
        }

        // Nothing in the pipeline: checkpoint the feed position so filtered
        // or empty replications still advance.
        let checkpointer = Arc::clone(&self.checkpointer);
        let session = self.session.clone();
        self.writing_checkpoint = true;
        self.set_stage(async move {
            let result = checkpointer.write_checkpoint(&last_seq, &session).await;
            StageOutput::DrainCheckpointed { last_seq, result }
        });
    }

    fn continue_after_drain(&mut self, last_seq: Seq, result: &mut ReplicationResult) {
        self.consumer.after_drain(last_seq);
        self.get_changes();
        self.process_pending(true, result);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Batching
    // ═══════════════════════════════════════════════════════════════════════════

    fn process_pending(&mut self, immediate: bool, result: &mut ReplicationResult) {
        if self.finished || self.cancelled {
            return;
        }
        if self.pending.is_empty() {
            if self.batches.is_empty() && self.current.is_none() {
                if self.consumer.is_live() || self.consumer.is_completed() {
                    self.emit_paused();
                }
                if self.consumer.is_completed() {
                    self.complete(result);
                }
            }
            return;
        }

        if immediate || self.consumer.is_completed() || self.pending.len() >= self.options.batch_size {
            let batch = self.pending.take();
            debug!(batch_seq = %batch.seq, changes = batch.changes.len(), "Batch queued");
            self.batches.push_back(batch);
            metrics::set_queue_depth(self.reporter.replication_id(), self.batches.len());
            self.emit_active();
            self.start_next_batch(result);
        }
    }

    fn start_next_batch(&mut self, result: &mut ReplicationResult) {
        if self.cancelled || self.finished || self.current.is_some() {
            return;
        }
        let Some(batch) = self.batches.pop_front() else {
            self.process_pending(true, result);
            return;
        };
        metrics::set_queue_depth(self.reporter.replication_id(), self.batches.len());

        let request = batch.diff_request();
        self.current = Some(batch);
        self.batch_started = Some(Instant::now());

        let target = Arc::clone(&self.target);
        self.set_stage(async move { StageOutput::Diffed(target.revs_diff(request).await) });
    }

    fn on_stage(&mut self, output: StageOutput, result: &mut ReplicationResult) {
        match output {
            StageOutput::Seeded(Ok(())) => {
                self.writing_checkpoint = false;
                self.seeded = true;
                if self.cancelled || self.fatal.is_some() {
                    self.complete(result);
                } else {
                    self.resume();
                }
            }
            StageOutput::Seeded(Err(e)) => {
                self.writing_checkpoint = false;
                self.abort(ReplicationError::checkpoint("write_checkpoint", e), result);
            }
            StageOutput::Resumed(Ok(seq)) => self.start_changes(seq, result),
            StageOutput::Resumed(Err(e)) => {
                self.abort(ReplicationError::checkpoint("get_checkpoint", e), result)
            }
            StageOutput::Diffed(Ok(diff)) => self.on_diffed(diff),
            StageOutput::Diffed(Err(e)) => self.abort(ReplicationError::store("revs_diff", e), result),
            StageOutput::Fetched(outcome) => self.on_fetched(outcome, result),
            StageOutput::Written(res) => self.on_written(res, result),
            StageOutput::BatchCheckpointed(res) => self.on_batch_checkpointed(res, result),
            StageOutput::DrainCheckpointed { last_seq, result: res } => {
                self.writing_checkpoint = false;
                match res {
                    Ok(()) => {
                        if last_seq > result.last_seq {
                            result.last_seq = last_seq.clone();
                        }
                        if self.cancelled || self.fatal.is_some() {
                            self.complete(result);
                        } else {
                            self.continue_after_drain(last_seq, result);
                        }
                    }
                    Err(e) => self.abort(ReplicationError::checkpoint("write_checkpoint", e), result),
                }
            }
        }
    }

    fn on_diffed(&mut self, diff: BTreeMap<String, RevsDiffEntry>) {
        let Some(batch) = self.current.as_mut() else { return };
        batch.apply_diff(diff);
        debug!(batch_seq = %batch.seq, missing = batch.diffs.len(), "Diffed batch");

        let source = Arc::clone(&self.source);
        let diffs = batch.diffs.clone();
        let bulkhead = self.bulkhead.clone();
        self.set_stage(async move { StageOutput::Fetched(fetch_docs(source, diffs, bulkhead).await) });
    }

    fn on_fetched(&mut self, outcome: FetchOutcome, result: &mut ReplicationResult) {
        let Some(batch) = self.current.as_mut() else { return };
        let read = batch.apply_fetch(outcome);
        result.docs_read += read;
        metrics::record_docs_read(self.reporter.replication_id(), read);

        if batch.docs.is_empty() {
            self.finish_batch(Vec::new(), result);
            return;
        }

        let target = Arc::clone(&self.target);
        let docs = batch.docs.clone();
        let opts = BulkDocsOptions {
            new_edits: false,
            timeout: self.options.timeout_duration(),
        };
        self.set_stage(async move { StageOutput::Written(target.bulk_docs(docs, opts).await) });
    }

    fn on_written(&mut self, res: StoreResult<Vec<WriteResult>>, result: &mut ReplicationResult) {
        let Some(batch) = self.current.as_ref() else { return };
        let id = self.reporter.replication_id().to_string();

        let results = match res {
            Ok(results) => results,
            Err(e) => {
                result.doc_write_failures += batch.docs.len();
                metrics::record_doc_write_failures(&id, batch.docs.len());
                self.abort(ReplicationError::store("bulk_docs", e), result);
                return;
            }
        };

        let tally = tally_writes(&batch.docs, results);
        result.doc_write_failures += tally.failures;
        result.docs_written += tally.written;
        result.errors.extend(tally.errors.iter().cloned());
        metrics::record_docs_written(&id, tally.written);
        metrics::record_doc_write_failures(&id, tally.failures);

        for denied in tally.denied {
            warn!(doc_id = %denied.id, error = %denied, "Target denied document");
            metrics::record_doc_denied(&id);
            self.reporter.emit(ReplicationEvent::Denied(denied));
        }

        match tally.fatal {
            Some(failure) => self.abort(ReplicationError::DocWrite(failure), result),
            None => self.finish_batch(tally.changed, result),
        }
    }

    fn finish_batch(&mut self, changed: Vec<Document>, result: &mut ReplicationResult) {
        let Some(batch) = self.current.as_ref() else { return };

        if let Some(error) = batch.error.clone() {
            self.abort(ReplicationError::DocFetch(error), result);
            return;
        }

        let seq = batch.seq.clone();
        result.last_seq = seq.clone();
        if !changed.is_empty() {
            self.reporter.emit(ReplicationEvent::Change(ChangeInfo {
                result: result.clone(),
                docs: changed,
                pending: batch.pending,
            }));
        }

        let checkpointer = Arc::clone(&self.checkpointer);
        let session = self.session.clone();
        self.writing_checkpoint = true;
        self.set_stage(async move {
            StageOutput::BatchCheckpointed(checkpointer.write_checkpoint(&seq, &session).await)
        });
    }

    fn on_batch_checkpointed(&mut self, res: StoreResult<()>, result: &mut ReplicationResult) {
        self.writing_checkpoint = false;
        if let Err(e) = res {
            self.abort(ReplicationError::checkpoint("write_checkpoint", e), result);
            return;
        }

        if let Some(batch) = self.current.take() {
            let elapsed = self.batch_started.take().map(|t| t.elapsed()).unwrap_or_default();
            debug!(batch_seq = %batch.seq, changes = batch.changes.len(), "Batch checkpointed");
            metrics::record_batch(self.reporter.replication_id(), batch.changes.len(), elapsed);
        }

        if self.cancelled || self.fatal.is_some() {
            self.complete(result);
            return;
        }
        self.get_changes();
        self.start_next_batch(result);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    fn emit_active(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.paused = false;
        self.activated = true;
        self.reporter.set_state(TaskState::Active);
        self.reporter.emit(ReplicationEvent::Active);
    }

    fn emit_paused(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.active = false;
        self.reporter.set_state(TaskState::Pending);
        self.reporter.emit(ReplicationEvent::Paused { error: None });
    }

    fn on_cancel(&mut self, result: &mut ReplicationResult) {
        info!(session = %self.session, "Replication cancelled");
        self.cancelled = true;
        self.consumer.cancel();
        self.batches.clear();
        if !self.writing_checkpoint {
            self.in_flight = None;
        }
        self.complete(result);
    }

    fn abort(&mut self, error: ReplicationError, result: &mut ReplicationResult) {
        if self.finished {
            return;
        }
        // The first failure wins; later ones only settle a deferred completion.
        if self.fatal.is_none() {
            warn!(error = %error, "Replication attempt aborting");
            result.ok = false;
            result.status = Some(ReplicationStatus::Aborting);
            self.fatal = Some(error);
        }
        self.batches.clear();
        self.pending = PendingBatch::new(self.pending.seq.clone());
        self.consumer.cancel();
        if !self.writing_checkpoint {
            self.in_flight = None;
        }
        self.complete(result);
    }

    fn complete(&mut self, result: &mut ReplicationResult) {
        if self.finished {
            return;
        }
        if self.cancelled {
            result.status = Some(ReplicationStatus::Cancelled);
        }
        if self.writing_checkpoint {
            // Completed once the write settles.
            return;
        }
        result.status.get_or_insert(ReplicationStatus::Complete);
        result.end_time = Some(Utc::now());
        self.consumer.cancel();
        self.in_flight = None;
        self.finished = true;
    }
}
