// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory [`DocumentStore`].
//!
//! Used by the test suites and by embedders that want to replicate into a
//! scratch database. Revision bookkeeping is deliberately shallow: each
//! document keeps every revision it has seen and a leaf set, and a revision
//! written with `new_edits: false` supersedes leaves of a lower generation.
//!
//! ```rust
//! # async fn example() -> doc_replicator::store::StoreResult<()> {
//! use doc_replicator::memory::MemoryStore;
//! use serde_json::json;
//!
//! let db = MemoryStore::new("scratch");
//! let rev = db.put("a", json!({"n": 1})).await?;
//! assert!(rev.starts_with("1-"));
//! assert_eq!(db.info().await.update_seq, 1);
//! # Ok(())
//! # }
//! ```

use crate::config::ChangeFilter;
use crate::store::{
    rev_generation, BoxFuture, BulkDocsOptions, Change, ChangesOptions, ChangesStream,
    ChangesStyle, Document, DocumentStore, FeedEvent, RevRef, RevsDiffEntry, Seq, StoreError,
    StoreResult, WriteResult,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::trace;

/// Document count and feed position of a [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    /// Documents whose winning revision is not deleted.
    pub doc_count: usize,
    pub update_seq: u64,
}

#[derive(Debug, Clone)]
struct DocRecord {
    revs: BTreeMap<String, Document>,
    leaves: BTreeSet<String>,
    seq: u64,
}

impl DocRecord {
    /// Winning leaf: live before deleted, then highest generation, then rev id.
    fn winner(&self) -> Option<&Document> {
        self.leaves
            .iter()
            .filter_map(|rev| self.revs.get(rev))
            .max_by(|a, b| {
                (!a.deleted, a.generation(), &a.rev).cmp(&(!b.deleted, b.generation(), &b.rev))
            })
    }

    /// Leaf revisions, winner first.
    fn leaf_revs(&self) -> Vec<String> {
        let winner = self.winner().map(|doc| doc.rev.clone());
        let mut revs: Vec<String> = winner.iter().cloned().collect();
        revs.extend(
            self.leaves
                .iter()
                .filter(|rev| Some(*rev) != winner.as_ref())
                .cloned(),
        );
        revs
    }

    fn insert_leaf(&mut self, doc: Document) {
        let gen = doc.generation();
        self.leaves.retain(|leaf| rev_generation(leaf) >= gen);
        self.leaves.insert(doc.rev.clone());
        self.revs.insert(doc.rev.clone(), doc);
    }
}

#[derive(Default)]
struct Inner {
    update_seq: u64,
    docs: HashMap<String, DocRecord>,
    /// Latest seq of each document.
    by_seq: BTreeMap<u64, String>,
    local: HashMap<String, serde_json::Value>,
    filters: HashMap<String, ChangeFilter>,
}

impl Inner {
    fn bump(&mut self, id: &str) -> u64 {
        self.update_seq += 1;
        let seq = self.update_seq;
        if let Some(record) = self.docs.get_mut(id) {
            self.by_seq.remove(&record.seq);
            record.seq = seq;
        }
        self.by_seq.insert(seq, id.to_string());
        seq
    }

    fn write(&mut self, mut doc: Document, new_edits: bool) -> StoreResult<String> {
        if new_edits {
            let current = self.docs.get(&doc.id).and_then(|r| r.winner().cloned());
            let parent = match &current {
                Some(winner) if winner.deleted && doc.rev.is_empty() => Some(winner.rev.clone()),
                Some(winner) if winner.rev != doc.rev => {
                    return Err(StoreError::Conflict("Document update conflict".to_string()))
                }
                Some(winner) => Some(winner.rev.clone()),
                None if !doc.rev.is_empty() => {
                    return Err(StoreError::Conflict("Document update conflict".to_string()))
                }
                None => None,
            };
            doc.rev = mint_rev(&doc, parent.as_deref());
            if let (Some(parent), Some(record)) = (parent, self.docs.get_mut(&doc.id)) {
                record.leaves.remove(&parent);
            }
        } else if self
            .docs
            .get(&doc.id)
            .is_some_and(|record| record.revs.contains_key(&doc.rev))
        {
            return Ok(doc.rev);
        }

        let id = doc.id.clone();
        let rev = doc.rev.clone();
        let record = self.docs.entry(id.clone()).or_insert_with(|| DocRecord {
            revs: BTreeMap::new(),
            leaves: BTreeSet::new(),
            seq: 0,
        });
        record.insert_leaf(doc);
        self.bump(&id);
        Ok(rev)
    }

    /// Collect up to `take` matching changes after `since`.
    ///
    /// Returns the changes and the highest seq examined.
    fn scan(&self, since: u64, opts: &ChangesOptions, take: usize) -> StoreResult<(Vec<Change>, u64)> {
        let named = match (&opts.filter, &opts.view) {
            (Some(name), Some(view)) if name == "_view" => Some(view),
            (Some(name), _) => Some(name),
            (None, _) => None,
        };
        let named = match named {
            Some(name) => Some(
                self.filters
                    .get(name)
                    .ok_or_else(|| StoreError::NotFound(format!("missing filter {}", name)))?,
            ),
            None => None,
        };

        let mut out = Vec::new();
        let mut last_examined = since;
        for (&seq, id) in self.by_seq.range(since.saturating_add(1)..) {
            if out.len() >= take {
                break;
            }
            last_examined = seq;

            let Some(record) = self.docs.get(id) else { continue };
            let Some(winner) = record.winner() else { continue };

            if let Some(ids) = &opts.doc_ids {
                if !ids.iter().any(|wanted| wanted == id) {
                    continue;
                }
            }
            if let Some(selector) = &opts.selector {
                if !selector_matches(selector, winner) {
                    continue;
                }
            }

            let changes = match opts.style {
                ChangesStyle::MainOnly => vec![winner.rev.clone()],
                ChangesStyle::AllDocs => record.leaf_revs(),
            };
            let change = Change {
                id: id.clone(),
                seq: Some(Seq::Num(seq)),
                changes: changes.into_iter().map(|rev| RevRef { rev }).collect(),
                deleted: winner.deleted,
                doc: Some(winner.clone()),
                pending: None,
            };
            if let Some(filter) = named {
                if !filter.accepts(&change) {
                    continue;
                }
            }
            out.push(Change {
                doc: if opts.include_docs { change.doc } else { None },
                ..change
            });
        }

        if out.len() < take {
            last_examined = last_examined.max(self.update_seq);
        }
        Ok((out, last_examined))
    }
}

/// Top-level field equality; `_id` matches the document id.
fn selector_matches(selector: &serde_json::Value, doc: &Document) -> bool {
    let Some(fields) = selector.as_object() else {
        return true;
    };
    fields.iter().all(|(key, expected)| match key.as_str() {
        "_id" => expected.as_str() == Some(doc.id.as_str()),
        _ => doc.body.get(key) == Some(expected),
    })
}

fn mint_rev(doc: &Document, parent: Option<&str>) -> String {
    let generation = parent.map(rev_generation).unwrap_or(0) + 1;
    let mut hasher = Sha256::new();
    hasher.update(doc.id.as_bytes());
    hasher.update(parent.unwrap_or_default().as_bytes());
    hasher.update([u8::from(doc.deleted)]);
    hasher.update(serde_json::Value::Object(doc.body.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", generation, &digest[..32])
}

/// Numeric position of a feed sequence. Opaque values use their numeric prefix.
fn seq_number(seq: &Seq) -> u64 {
    match seq {
        Seq::Num(n) => *n,
        Seq::Opaque(s) => s
            .split('-')
            .next()
            .and_then(|prefix| prefix.parse().ok())
            .unwrap_or(0),
    }
}

/// A document database held in memory.
///
/// Cloning yields another handle to the same database.
#[derive(Clone)]
pub struct MemoryStore {
    name: String,
    inner: Arc<RwLock<Inner>>,
    updates: Arc<watch::Sender<u64>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            name: name.into(),
            inner: Arc::new(RwLock::new(Inner::default())),
            updates: Arc::new(updates),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create or update a document, returning its new revision.
    pub async fn put(&self, id: &str, body: serde_json::Value) -> StoreResult<String> {
        let mut inner = self.inner.write().await;
        let current = inner
            .docs
            .get(id)
            .and_then(|r| r.winner())
            .filter(|w| !w.deleted)
            .map(|w| w.rev.clone())
            .unwrap_or_default();
        let rev = inner.write(Document::with_body(id, current, body), true)?;
        self.notify(&inner);
        Ok(rev)
    }

    /// Delete a document, returning the tombstone revision.
    pub async fn delete(&self, id: &str) -> StoreResult<String> {
        let mut inner = self.inner.write().await;
        let current = inner
            .docs
            .get(id)
            .and_then(|r| r.winner())
            .filter(|w| !w.deleted)
            .map(|w| w.rev.clone())
            .ok_or_else(|| StoreError::NotFound(format!("missing {}", id)))?;
        let mut tombstone = Document::new(id, current);
        tombstone.deleted = true;
        let rev = inner.write(tombstone, true)?;
        self.notify(&inner);
        Ok(rev)
    }

    /// Winning revision of a live document.
    pub async fn get(&self, id: &str) -> Option<Document> {
        let inner = self.inner.read().await;
        inner
            .docs
            .get(id)
            .and_then(|r| r.winner())
            .filter(|w| !w.deleted)
            .cloned()
    }

    /// Every stored revision id of a document.
    pub async fn revs(&self, id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .docs
            .get(id)
            .map(|r| r.revs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn info(&self) -> StoreInfo {
        let inner = self.inner.read().await;
        StoreInfo {
            doc_count: inner
                .docs
                .values()
                .filter(|r| r.winner().is_some_and(|w| !w.deleted))
                .count(),
            update_seq: inner.update_seq,
        }
    }

    /// Make a filter available to feeds opened with `filter: Some(name)`.
    pub async fn register_filter(&self, name: impl Into<String>, filter: ChangeFilter) {
        self.inner.write().await.filters.insert(name.into(), filter);
    }

    fn notify(&self, inner: &Inner) {
        self.updates.send_replace(inner.update_seq);
    }
}

struct FeedState {
    store: MemoryStore,
    opts: ChangesOptions,
    since: u64,
    delivered: usize,
    buffer: VecDeque<Change>,
    updates: watch::Receiver<u64>,
    done: bool,
}

impl FeedState {
    fn complete(mut self) -> Option<(StoreResult<FeedEvent>, Self)> {
        self.done = true;
        let event = FeedEvent::Complete {
            last_seq: Seq::Num(self.since),
            results: self.delivered,
        };
        Some((Ok(event), self))
    }
}

async fn next_feed_event(mut state: FeedState) -> Option<(StoreResult<FeedEvent>, FeedState)> {
    loop {
        if let Some(change) = state.buffer.pop_front() {
            return Some((Ok(FeedEvent::Change(change)), state));
        }
        if state.done {
            return None;
        }

        let remaining = match state.opts.limit {
            Some(limit) if !state.opts.live => {
                if state.delivered >= limit {
                    return state.complete();
                }
                limit - state.delivered
            }
            _ => usize::MAX,
        };
        let take = state.opts.batch_size.max(1).min(remaining);

        let scanned = {
            let inner = state.store.inner.read().await;
            inner.scan(state.since, &state.opts, take)
        };
        let (changes, scanned_to) = match scanned {
            Ok(found) => found,
            Err(e) => {
                state.done = true;
                return Some((Err(e), state));
            }
        };
        trace!(db = %state.store.name, since = state.since, found = changes.len(), "Feed scan");
        state.since = state.since.max(scanned_to);
        if !changes.is_empty() {
            state.delivered += changes.len();
            state.buffer.extend(changes);
            continue;
        }

        if !state.opts.live {
            return state.complete();
        }

        // Live: wait for a write past our position.
        if *state.updates.borrow_and_update() > state.since {
            continue;
        }
        let changed = match state.opts.timeout {
            Some(idle) => {
                let waited = tokio::time::timeout(idle, state.updates.changed()).await;
                match waited {
                    Ok(res) => res,
                    Err(_) => return state.complete(),
                }
            }
            None => state.updates.changed().await,
        };
        if changed.is_err() {
            return None;
        }
    }
}

impl DocumentStore for MemoryStore {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn changes(&self, opts: ChangesOptions) -> ChangesStream {
        let state = FeedState {
            store: self.clone(),
            since: seq_number(&opts.since),
            opts,
            delivered: 0,
            buffer: VecDeque::new(),
            updates: self.updates.subscribe(),
            done: false,
        };
        Box::pin(futures::stream::unfold(state, next_feed_event))
    }

    fn revs_diff(
        &self,
        revs: BTreeMap<String, Vec<String>>,
    ) -> BoxFuture<'_, BTreeMap<String, RevsDiffEntry>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let mut diff = BTreeMap::new();
            for (id, wanted) in revs {
                let record = inner.docs.get(&id);
                let missing: Vec<String> = wanted
                    .into_iter()
                    .filter(|rev| !record.is_some_and(|r| r.revs.contains_key(rev)))
                    .collect();
                if !missing.is_empty() {
                    diff.insert(id, RevsDiffEntry { missing });
                }
            }
            Ok(diff)
        })
    }

    fn get_revs(&self, id: &str, revs: Vec<String>) -> BoxFuture<'_, Vec<Document>> {
        let id = id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            let record = inner
                .docs
                .get(&id)
                .ok_or_else(|| StoreError::NotFound(format!("missing {}", id)))?;
            revs.iter()
                .map(|rev| {
                    record
                        .revs
                        .get(rev)
                        .cloned()
                        .ok_or_else(|| StoreError::NotFound(format!("missing {}@{}", id, rev)))
                })
                .collect()
        })
    }

    fn bulk_docs(
        &self,
        docs: Vec<Document>,
        opts: BulkDocsOptions,
    ) -> BoxFuture<'_, Vec<WriteResult>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let results = docs
                .into_iter()
                .map(|doc| {
                    let id = doc.id.clone();
                    match inner.write(doc, opts.new_edits) {
                        Ok(rev) => WriteResult::ok(id, rev),
                        Err(e) => WriteResult::failed(id, &e),
                    }
                })
                .collect();
            self.notify(&inner);
            Ok(results)
        })
    }

    fn get_local(&self, id: &str) -> BoxFuture<'_, Option<serde_json::Value>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.inner.read().await.local.get(&id).cloned()) })
    }

    fn put_local(&self, id: &str, value: serde_json::Value) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            self.inner.write().await.local.insert(id, value);
            Ok(())
        })
    }
}
