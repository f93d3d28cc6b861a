// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for replication progress.
//!
//! Stores the last sequence known to be fully written to the target as a local
//! document on the source, the target, or both (see [`CheckpointMode`]).
//!
//! # Checkpoint Semantics
//!
//! The checkpoint is the **last fully applied** source sequence.
//! On restart, we resume the change feed from it (exclusive read).
//!
//! ```text
//! batch ending at seq 1234 → bulk write to target → checkpoint 1234
//!                            (crash here = re-read the batch, idempotent)
//! ```
//!
//! # Sessions and History
//!
//! Each write is tagged with the attempt's session id and pushed onto a short
//! history. When the two sides disagree (a crash between the target and the
//! source write, or a side restored from backup) the histories are compared
//! to find the newest session both sides saw. No common session means we
//! start over: re-replicating is safe, skipping changes is not.
//!
//! # Write Order
//!
//! The target is written first, then the source. If the source write fails
//! the source holds the older value, which is the one `get_checkpoint()`
//! prefers for a shared session.

use crate::config::CheckpointMode;
use crate::metrics;
use crate::store::{DocumentStore, Seq, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Current checkpoint document format.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Sessions kept in a checkpoint's history.
pub const CHECKPOINT_HISTORY_SIZE: usize = 5;

/// Written into every checkpoint document.
pub const REPLICATOR: &str = "doc-replicator";

/// Configuration for conflict retry behavior on local document writes
const CONFLICT_RETRY_MAX_ATTEMPTS: u32 = 5;
const CONFLICT_RETRY_BASE_DELAY_MS: u64 = 10;
const CONFLICT_RETRY_MAX_DELAY_MS: u64 = 200;

/// Execute a store operation, retrying on `conflict`.
///
/// Two writers racing on the same checkpoint document (a restarted attempt
/// and a straggling write of the previous one) resolve by re-reading and
/// writing again.
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = CONFLICT_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "Checkpoint operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(StoreError::Conflict(reason)) if attempts < CONFLICT_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = CONFLICT_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    reason = %reason,
                    "Checkpoint conflict, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(CONFLICT_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// One entry of a checkpoint's session history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub last_seq: Seq,
}

/// The local document a checkpoint is stored as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDoc {
    pub session_id: String,
    pub last_seq: Seq,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// `None` for documents written before histories existed.
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub replicator: Option<String>,
}

impl CheckpointDoc {
    /// Fresh document for a replication that never checkpointed.
    pub fn empty(session: &str) -> Self {
        Self {
            session_id: session.to_string(),
            last_seq: Seq::ZERO,
            history: Vec::new(),
            version: Some(CHECKPOINT_VERSION),
            replicator: Some(REPLICATOR.to_string()),
        }
    }

    /// Record `seq` for `session`, newest first, bounded history.
    pub fn advance(&mut self, seq: &Seq, session: &str) {
        self.history.retain(|entry| entry.session_id != session);
        self.history.insert(
            0,
            HistoryEntry {
                session_id: session.to_string(),
                last_seq: seq.clone(),
            },
        );
        self.history.truncate(CHECKPOINT_HISTORY_SIZE);
        self.version = Some(CHECKPOINT_VERSION);
        self.replicator = Some(REPLICATOR.to_string());
        self.session_id = session.to_string();
        self.last_seq = seq.clone();
    }
}

/// Decide where to resume from when both sides hold a checkpoint.
///
/// Same session: the source value (written last, so never ahead of the
/// target). Otherwise the newest session present in both histories. No common
/// session, or mismatched formats: [`Seq::ZERO`].
pub fn compare_checkpoints(source: &CheckpointDoc, target: &CheckpointDoc) -> Seq {
    if source.version != target.version {
        return Seq::ZERO;
    }
    if source.version.is_none() {
        // Pre-history format: trust the value only if both sides agree.
        return if source.last_seq == target.last_seq {
            source.last_seq.clone()
        } else {
            Seq::ZERO
        };
    }
    if source.session_id == target.session_id {
        return source.last_seq.clone();
    }
    compare_histories(&source.history, &target.history)
}

fn compare_histories(source: &[HistoryEntry], target: &[HistoryEntry]) -> Seq {
    let (Some(s), Some(t)) = (source.first(), target.first()) else {
        return Seq::ZERO;
    };

    if target.iter().any(|entry| entry.session_id == s.session_id) {
        return s.last_seq.clone();
    }
    let source_rest = &source[1..];
    if source_rest.iter().any(|entry| entry.session_id == t.session_id) {
        return t.last_seq.clone();
    }
    compare_histories(source_rest, &target[1..])
}

/// Reads and writes the checkpoint of one replication.
///
/// Built once per [`ReplicationTask`](crate::ReplicationTask) and shared by
/// every attempt, so a source found to be read-only stays marked.
pub struct Checkpointer<S: DocumentStore, T: DocumentStore> {
    source: Arc<S>,
    target: Arc<T>,
    /// Local document id (`_local/...`).
    id: String,
    mode: CheckpointMode,
    /// Set when the source refused a checkpoint write.
    read_only_source: AtomicBool,
    replication_id: String,
}

impl<S: DocumentStore, T: DocumentStore> Checkpointer<S, T> {
    pub fn new(source: Arc<S>, target: Arc<T>, id: impl Into<String>, mode: CheckpointMode) -> Self {
        let id = id.into();
        Self {
            source,
            target,
            replication_id: id.trim_start_matches("_local/").to_string(),
            id,
            mode,
            read_only_source: AtomicBool::new(false),
        }
    }

    /// Local document id the checkpoint is stored under.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> CheckpointMode {
        self.mode
    }

    /// Whether the source refused checkpoint writes.
    pub fn is_source_read_only(&self) -> bool {
        self.read_only_source.load(Ordering::Relaxed)
    }

    /// Sequence to resume from.
    pub async fn get_checkpoint(&self) -> StoreResult<Seq> {
        let seq = match self.mode {
            CheckpointMode::Disabled => Seq::ZERO,
            CheckpointMode::Source => read_doc(&*self.source, &self.id)
                .await?
                .map(|doc| doc.last_seq)
                .unwrap_or_default(),
            CheckpointMode::Target => read_doc(&*self.target, &self.id)
                .await?
                .map(|doc| doc.last_seq)
                .unwrap_or_default(),
            CheckpointMode::Both => self.compare_sides().await?,
        };
        debug!(checkpoint_id = %self.id, seq = %seq, "Resolved checkpoint");
        Ok(seq)
    }

    async fn compare_sides(&self) -> StoreResult<Seq> {
        let Some(target_doc) = read_doc(&*self.target, &self.id).await? else {
            return Ok(Seq::ZERO);
        };

        match read_doc(&*self.source, &self.id).await? {
            Some(source_doc) => Ok(compare_checkpoints(&source_doc, &target_doc)),
            None if target_doc.last_seq.is_zero() => Ok(Seq::ZERO),
            None => {
                // The target has progress the source knows nothing about.
                // Seed the source so later comparisons have something to go on.
                let seed = CheckpointDoc {
                    last_seq: Seq::ZERO,
                    ..CheckpointDoc::empty(&target_doc.session_id)
                };
                match write_doc(&*self.source, &self.id, &seed).await {
                    Ok(()) => Ok(Seq::ZERO),
                    Err(e) if e.is_auth() => {
                        warn!(checkpoint_id = %self.id, "Source is read-only, trusting target checkpoint");
                        self.read_only_source.store(true, Ordering::Relaxed);
                        Ok(target_doc.last_seq)
                    }
                    Err(e) => {
                        debug!(error = %e, "Could not seed source checkpoint, starting over");
                        Ok(Seq::ZERO)
                    }
                }
            }
        }
    }

    /// Persist `seq` for `session` on the configured sides, target first.
    pub async fn write_checkpoint(&self, seq: &Seq, session: &str) -> StoreResult<()> {
        let result = self.write_sides(seq, session).await;
        metrics::record_checkpoint_write(&self.replication_id, result.is_ok());
        result
    }

    async fn write_sides(&self, seq: &Seq, session: &str) -> StoreResult<()> {
        if self.mode.writes_target() {
            update_checkpoint(&*self.target, &self.id, seq, session).await?;
        }

        if self.mode.writes_source() && !self.is_source_read_only() {
            match update_checkpoint(&*self.source, &self.id, seq, session).await {
                Ok(()) => {}
                Err(e) if e.is_auth() => {
                    warn!(
                        checkpoint_id = %self.id,
                        error = %e,
                        "Source refused checkpoint write, treating it as read-only"
                    );
                    self.read_only_source.store(true, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }

        debug!(checkpoint_id = %self.id, seq = %seq, session, "Checkpoint written");
        Ok(())
    }
}

async fn read_doc<D: DocumentStore + ?Sized>(store: &D, id: &str) -> StoreResult<Option<CheckpointDoc>> {
    let Some(value) = store.get_local(id).await? else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| StoreError::Other {
            name: "bad_checkpoint".to_string(),
            reason: e.to_string(),
        })
}

async fn write_doc<D: DocumentStore + ?Sized>(store: &D, id: &str, doc: &CheckpointDoc) -> StoreResult<()> {
    let value = serde_json::to_value(doc).map_err(|e| StoreError::Other {
        name: "bad_checkpoint".to_string(),
        reason: e.to_string(),
    })?;
    store.put_local(id, value).await
}

/// Read-modify-write one side. A side already at `seq` is left untouched.
async fn update_checkpoint<D: DocumentStore + ?Sized>(
    store: &D,
    id: &str,
    seq: &Seq,
    session: &str,
) -> StoreResult<()> {
    execute_with_retry("checkpoint_update", || async {
        let mut doc = match read_doc(store, id).await? {
            Some(doc) => doc,
            None => CheckpointDoc::empty(session),
        };
        if doc.last_seq == *seq && !doc.history.is_empty() {
            return Ok(());
        }
        doc.advance(seq, session);
        write_doc(store, id, &doc).await
    })
    .await
}
