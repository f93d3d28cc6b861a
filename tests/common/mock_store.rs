//! Fault-injecting store for testing.
//!
//! Delegates to a [`MemoryStore`] and records calls for assertions. Failures
//! are armed per operation and consumed one call at a time.

use doc_replicator::store::{
    BoxFuture, BulkDocsOptions, ChangesOptions, ChangesStream, Document, RevsDiffEntry,
    StoreError, WriteResult,
};
use doc_replicator::{DocumentStore, MemoryStore, Seq};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

/// Wait while `gate` is held.
async fn pass(gate: &watch::Sender<bool>) {
    let mut held = gate.subscribe();
    // The sender lives as long as the store, so this cannot fail.
    let _ = held.wait_for(|held| !*held).await;
}

/// Take one armed failure, if any.
fn consume(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[allow(dead_code)]
pub struct FaultyStore {
    pub inner: MemoryStore,

    /// Ids `bulk_docs` refuses with `Forbidden`.
    denied_ids: Mutex<HashSet<String>>,
    /// Ids `bulk_docs` fails with a non-auth conflict.
    rejected_ids: Mutex<HashSet<String>>,
    bulk_docs_failures: AtomicUsize,
    put_local_failures: AtomicUsize,
    put_local_forbidden: AtomicBool,
    put_local_unauthorized: AtomicBool,
    get_local_failures: AtomicUsize,
    changes_failures: AtomicUsize,
    changes_unauthorized: AtomicBool,
    revs_diff_failures: AtomicUsize,
    get_revs_failures: AtomicUsize,

    /// While `true`, `bulk_docs` parks before writing.
    bulk_docs_gate: watch::Sender<bool>,
    /// While `true`, `put_local` parks before writing.
    put_local_gate: watch::Sender<bool>,

    calls: AtomicUsize,
    changes_since: Mutex<Vec<Seq>>,
    bulk_docs_calls: AtomicUsize,
    bulk_docs_sizes: Mutex<Vec<usize>>,
    put_local_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(name: &str) -> Self {
        Self::wrap(MemoryStore::new(name))
    }

    pub fn wrap(inner: MemoryStore) -> Self {
        Self {
            inner,
            denied_ids: Mutex::new(HashSet::new()),
            rejected_ids: Mutex::new(HashSet::new()),
            bulk_docs_failures: AtomicUsize::new(0),
            put_local_failures: AtomicUsize::new(0),
            put_local_forbidden: AtomicBool::new(false),
            put_local_unauthorized: AtomicBool::new(false),
            get_local_failures: AtomicUsize::new(0),
            changes_failures: AtomicUsize::new(0),
            changes_unauthorized: AtomicBool::new(false),
            revs_diff_failures: AtomicUsize::new(0),
            get_revs_failures: AtomicUsize::new(0),
            bulk_docs_gate: watch::Sender::new(false),
            put_local_gate: watch::Sender::new(false),
            calls: AtomicUsize::new(0),
            changes_since: Mutex::new(Vec::new()),
            bulk_docs_calls: AtomicUsize::new(0),
            bulk_docs_sizes: Mutex::new(Vec::new()),
            put_local_calls: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    pub fn deny_writes_of(&self, id: &str) {
        self.denied_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn reject_writes_of(&self, id: &str) {
        self.rejected_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_bulk_docs(&self, times: usize) {
        self.bulk_docs_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_put_local(&self, times: usize) {
        self.put_local_failures.store(times, Ordering::SeqCst);
    }

    /// Refuse every `put_local` with `Forbidden`, like a read-only database.
    pub fn forbid_put_local(&self) {
        self.put_local_forbidden.store(true, Ordering::SeqCst);
    }

    /// Refuse every `put_local` with `Unauthorized`.
    pub fn unauthorize_put_local(&self) {
        self.put_local_unauthorized.store(true, Ordering::SeqCst);
    }

    pub fn fail_get_local(&self, times: usize) {
        self.get_local_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_changes(&self, times: usize) {
        self.changes_failures.store(times, Ordering::SeqCst);
    }

    pub fn unauthorized_changes(&self) {
        self.changes_unauthorized.store(true, Ordering::SeqCst);
    }

    pub fn fail_revs_diff(&self, times: usize) {
        self.revs_diff_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_get_revs(&self, times: usize) {
        self.get_revs_failures.store(times, Ordering::SeqCst);
    }

    pub fn hold_bulk_docs(&self) {
        self.bulk_docs_gate.send_replace(true);
    }

    pub fn release_bulk_docs(&self) {
        self.bulk_docs_gate.send_replace(false);
    }

    pub fn hold_put_local(&self) {
        self.put_local_gate.send_replace(true);
    }

    pub fn release_put_local(&self) {
        self.put_local_gate.send_replace(false);
    }

    // =========================================================================
    // Recorded calls
    // =========================================================================

    /// `since` of every change feed request, in order.
    pub fn changes_requests(&self) -> Vec<Seq> {
        self.changes_since.lock().unwrap().clone()
    }

    pub fn bulk_docs_count(&self) -> usize {
        self.bulk_docs_calls.load(Ordering::SeqCst)
    }

    /// Size of every successful `bulk_docs` call.
    pub fn bulk_docs_sizes(&self) -> Vec<usize> {
        self.bulk_docs_sizes.lock().unwrap().clone()
    }

    pub fn put_local_count(&self) -> usize {
        self.put_local_calls.load(Ordering::SeqCst)
    }

    /// Every store operation started, of any kind.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DocumentStore for FaultyStore {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn changes(&self, opts: ChangesOptions) -> ChangesStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.changes_since.lock().unwrap().push(opts.since.clone());
        if self.changes_unauthorized.load(Ordering::SeqCst) {
            let err = StoreError::Unauthorized("no session".into());
            return Box::pin(futures::stream::iter(vec![Err(err)]));
        }
        if consume(&self.changes_failures) {
            let err = StoreError::Unavailable("connection reset".into());
            return Box::pin(futures::stream::iter(vec![Err(err)]));
        }
        self.inner.changes(opts)
    }

    fn revs_diff(
        &self,
        revs: BTreeMap<String, Vec<String>>,
    ) -> BoxFuture<'_, BTreeMap<String, RevsDiffEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if consume(&self.revs_diff_failures) {
            return Box::pin(async { Err(StoreError::Unavailable("revs_diff timed out".into())) });
        }
        self.inner.revs_diff(revs)
    }

    fn get_revs(&self, id: &str, revs: Vec<String>) -> BoxFuture<'_, Vec<Document>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if consume(&self.get_revs_failures) {
            let id = id.to_string();
            return Box::pin(async move { Err(StoreError::Unavailable(format!("lost {}", id))) });
        }
        self.inner.get_revs(id, revs)
    }

    fn bulk_docs(
        &self,
        docs: Vec<Document>,
        opts: BulkDocsOptions,
    ) -> BoxFuture<'_, Vec<WriteResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            self.bulk_docs_calls.fetch_add(1, Ordering::SeqCst);
            pass(&self.bulk_docs_gate).await;
            if consume(&self.bulk_docs_failures) {
                return Err(StoreError::Unavailable("bulk_docs failed".into()));
            }
            self.bulk_docs_sizes.lock().unwrap().push(docs.len());

            let denied = self.denied_ids.lock().unwrap().clone();
            let rejected = self.rejected_ids.lock().unwrap().clone();
            let mut refused = BTreeMap::new();
            let mut accepted = Vec::new();
            for (i, doc) in docs.into_iter().enumerate() {
                if denied.contains(&doc.id) {
                    let err = StoreError::Forbidden("doc update denied".into());
                    refused.insert(i, WriteResult::failed(doc.id, &err));
                } else if rejected.contains(&doc.id) {
                    let err = StoreError::Other {
                        name: "bad_request".into(),
                        reason: "invalid document".into(),
                    };
                    refused.insert(i, WriteResult::failed(doc.id, &err));
                } else {
                    accepted.push(doc);
                }
            }

            let mut written = self.inner.bulk_docs(accepted, opts).await?.into_iter();
            let total = refused.len() + written.len();
            let mut results = Vec::with_capacity(total);
            for i in 0..total {
                match refused.remove(&i) {
                    Some(result) => results.push(result),
                    None => results.extend(written.next()),
                }
            }
            Ok(results)
        })
    }

    fn get_local(&self, id: &str) -> BoxFuture<'_, Option<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if consume(&self.get_local_failures) {
            return Box::pin(async { Err(StoreError::Unavailable("get_local failed".into())) });
        }
        self.inner.get_local(id)
    }

    fn put_local(&self, id: &str, value: serde_json::Value) -> BoxFuture<'_, ()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.put_local_calls.fetch_add(1, Ordering::SeqCst);
        let id = id.to_string();
        Box::pin(async move {
            pass(&self.put_local_gate).await;
            if self.put_local_forbidden.load(Ordering::SeqCst) {
                return Err(StoreError::Forbidden("read-only database".into()));
            }
            if self.put_local_unauthorized.load(Ordering::SeqCst) {
                return Err(StoreError::Unauthorized("no session".into()));
            }
            if consume(&self.put_local_failures) {
                return Err(StoreError::Unavailable("put_local failed".into()));
            }
            self.inner.put_local(&id, value).await
        })
    }
}
