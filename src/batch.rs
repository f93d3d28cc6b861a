//! Batches of changes and the stages they move through.
//!
//! Changes accumulate in a [`PendingBatch`] until it is flushed into the
//! driver's FIFO as a [`Batch`]. Each batch then runs, strictly one at a time:
//!
//! ```text
//! PendingBatch ──flush──▶ FIFO ──▶ Batch
//!                                   │
//!                          Diff     │ target.revs_diff(id → revs)
//!                          Fetch    │ source.get_revs (bounded, parallel)
//!                          Write    │ target.bulk_docs(new_edits = false)
//!                          Checkpoint batch.seq
//! ```
//!
//! The stage functions here are free of driver state: they take owned inputs
//! so the driver can poll them as `'static` futures.

use crate::resilience::Bulkhead;
use crate::store::{
    Change, Document, DocumentStore, RevsDiffEntry, Seq, StoreError, WriteFailure, WriteResult,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Where a batch is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Diff,
    Fetch,
    Write,
    Checkpoint,
}

/// Changes collected from the feed but not yet queued.
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    /// Feed position covered by this batch, filtered changes included.
    pub seq: Seq,
    pub changes: Vec<Change>,
    /// Remaining changes reported by the source.
    pub pending: Option<u64>,
}

impl PendingBatch {
    pub fn new(seq: Seq) -> Self {
        Self {
            seq,
            changes: Vec::new(),
            pending: None,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Move the contents into a [`Batch`], leaving an empty pending batch at
    /// the same position.
    pub fn take(&mut self) -> Batch {
        let seq = self.seq.clone();
        let taken = std::mem::replace(self, PendingBatch::new(seq));
        Batch::new(taken.seq, taken.changes, taken.pending)
    }
}

/// A unit of work moving through [`BatchStage`]s.
#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: Seq,
    pub changes: Vec<Change>,
    /// Fetched documents, ready to write.
    pub docs: Vec<Document>,
    /// Revisions still missing on the target, shrunk as docs are fetched.
    pub diffs: BTreeMap<String, Vec<String>>,
    /// Set when some revisions could not be fetched.
    pub error: Option<String>,
    pub pending: Option<u64>,
    pub stage: BatchStage,
}

impl Batch {
    pub fn new(seq: Seq, changes: Vec<Change>, pending: Option<u64>) -> Self {
        Self {
            seq,
            changes,
            docs: Vec::new(),
            diffs: BTreeMap::new(),
            error: None,
            pending,
            stage: BatchStage::Diff,
        }
    }

    /// Revisions to ask the target about, merged per document id.
    pub fn diff_request(&self) -> BTreeMap<String, Vec<String>> {
        let mut request: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for change in &self.changes {
            let revs = request.entry(change.id.clone()).or_default();
            for rev in change.revs() {
                if !revs.contains(&rev) {
                    revs.push(rev);
                }
            }
        }
        request
    }

    /// Keep the documents the target is actually missing.
    pub fn apply_diff(&mut self, diff: BTreeMap<String, RevsDiffEntry>) {
        self.diffs = diff
            .into_iter()
            .filter(|(_, entry)| !entry.missing.is_empty())
            .map(|(id, entry)| (id, entry.missing))
            .collect();
        self.stage = BatchStage::Fetch;
    }

    /// Record fetched documents. Returns how many were read.
    pub fn apply_fetch(&mut self, outcome: FetchOutcome) -> usize {
        let read = outcome.docs.len();
        for doc in outcome.docs {
            if let Some(revs) = self.diffs.get_mut(&doc.id) {
                revs.retain(|rev| rev != &doc.rev);
                if revs.is_empty() {
                    self.diffs.remove(&doc.id);
                }
            }
            self.docs.push(doc);
        }
        if !outcome.failed.is_empty() {
            let ids: Vec<&str> = outcome.failed.iter().map(|(id, _)| id.as_str()).collect();
            self.error = Some(format!(
                "{} document(s) could not be fetched: {}",
                ids.len(),
                ids.join(", ")
            ));
        }
        self.stage = BatchStage::Write;
        read
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Document fetcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of fetching a batch's missing revisions.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Fetched revisions, ordered by document id.
    pub docs: Vec<Document>,
    /// Documents whose revisions could not be fetched.
    pub failed: Vec<(String, StoreError)>,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fetch every missing revision from the source, one `get_revs` per document,
/// at most `bulkhead.max_concurrent()` at a time.
pub async fn fetch_docs<S: DocumentStore>(
    source: Arc<S>,
    diffs: BTreeMap<String, Vec<String>>,
    bulkhead: Bulkhead,
) -> FetchOutcome {
    if diffs.is_empty() {
        return FetchOutcome::default();
    }

    let mut join_set: JoinSet<(String, Result<Vec<Document>, StoreError>)> = JoinSet::new();
    for (id, revs) in diffs {
        let source = Arc::clone(&source);
        let bulkhead = bulkhead.clone();
        join_set.spawn(async move {
            let result = match bulkhead.acquire().await {
                Ok(_permit) => source.get_revs(&id, revs).await,
                Err(e) => Err(StoreError::Unavailable(e.to_string())),
            };
            (id, result)
        });
    }

    let mut fetched: BTreeMap<String, Vec<Document>> = BTreeMap::new();
    let mut failed = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((id, Ok(docs))) => {
                fetched.insert(id, docs);
            }
            Ok((id, Err(e))) => {
                warn!(doc_id = %id, error = %e, "Failed to fetch revisions");
                failed.push((id, e));
            }
            Err(e) => {
                warn!(error = %e, "Revision fetch task failed (JoinError)");
                failed.push((
                    String::new(),
                    StoreError::Other {
                        name: "internal".to_string(),
                        reason: e.to_string(),
                    },
                ));
            }
        }
    }
    failed.sort_by(|a, b| a.0.cmp(&b.0));

    FetchOutcome {
        docs: fetched.into_values().flatten().collect(),
        failed,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Write results
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-result outcome of a batch's bulk write.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriteTally {
    /// Documents the target accepted, in batch order.
    pub changed: Vec<Document>,
    /// Every failure seen, in batch order, up to and including `fatal`.
    pub errors: Vec<WriteFailure>,
    /// Authorization failures (reported as `denied`).
    pub denied: Vec<WriteFailure>,
    /// First non-authorization failure; ends the attempt.
    pub fatal: Option<WriteFailure>,
    /// Successful results.
    pub written: usize,
    /// Failed results.
    pub failures: usize,
}

/// Classify `bulk_docs` results against the documents that were written.
///
/// Every result counts once. Results are matched back to documents by
/// `(id, rev)` when the store echoes the revision, otherwise by the first
/// unmatched document with that id, so several leaves of one document are
/// kept apart.
pub fn tally_writes(docs: &[Document], results: Vec<WriteResult>) -> WriteTally {
    let mut unmatched: Vec<Option<&Document>> = docs.iter().map(Some).collect();
    let mut tally = WriteTally::default();

    for res in results {
        let doc = take_match(&mut unmatched, &res);
        match res.error {
            None => {
                tally.written += 1;
                match doc {
                    Some(doc) if tally.fatal.is_none() => tally.changed.push(doc.clone()),
                    _ => {}
                }
            }
            Some(failure) => {
                tally.failures += 1;
                if tally.fatal.is_some() {
                    continue;
                }
                tally.errors.push(failure.clone());
                if failure.is_auth() {
                    tally.denied.push(failure);
                } else {
                    debug!(doc_id = %failure.id, error = %failure, "Fatal document write failure");
                    tally.fatal = Some(failure);
                }
            }
        }
    }
    tally
}

fn take_match<'a>(unmatched: &mut [Option<&'a Document>], res: &WriteResult) -> Option<&'a Document> {
    let same_id = |slot: &Option<&Document>| slot.is_some_and(|d| d.id == res.id);
    let exact = res.rev.as_ref().and_then(|rev| {
        unmatched
            .iter()
            .position(|slot| same_id(slot) && slot.is_some_and(|d| &d.rev == rev))
    });
    let index = exact.or_else(|| unmatched.iter().position(same_id))?;
    unmatched[index].take()
}
