// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store integration traits.
//!
//! Defines the interface the replicator needs from a source or target store.
//! The store is a collaborator: transport, storage layout and revision-tree
//! bookkeeping are its business, not ours.
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_replicator::store::{
//!     BoxFuture, BulkDocsOptions, ChangesOptions, ChangesStream, Document,
//!     DocumentStore, RevsDiffEntry, WriteResult,
//! };
//! use std::collections::BTreeMap;
//!
//! struct MyBackend { /* ... */ }
//!
//! impl DocumentStore for MyBackend {
//!     fn id(&self) -> String {
//!         "http://db.example/orders".to_string()
//!     }
//!
//!     fn changes(&self, _opts: ChangesOptions) -> ChangesStream {
//!         Box::pin(futures::stream::empty())
//!     }
//!
//!     fn revs_diff(
//!         &self,
//!         _revs: BTreeMap<String, Vec<String>>,
//!     ) -> BoxFuture<'_, BTreeMap<String, RevsDiffEntry>> {
//!         Box::pin(async { Ok(BTreeMap::new()) })
//!     }
//!
//!     fn get_revs(&self, _id: &str, _revs: Vec<String>) -> BoxFuture<'_, Vec<Document>> {
//!         Box::pin(async { Ok(Vec::new()) })
//!     }
//!
//!     fn bulk_docs(
//!         &self,
//!         _docs: Vec<Document>,
//!         _opts: BulkDocsOptions,
//!     ) -> BoxFuture<'_, Vec<WriteResult>> {
//!         Box::pin(async { Ok(Vec::new()) })
//!     }
//!
//!     fn get_local(&self, _id: &str) -> BoxFuture<'_, Option<serde_json::Value>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!
//!     fn put_local(&self, _id: &str, _value: serde_json::Value) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// A cancellable change feed. Dropping the stream cancels the request.
pub type ChangesStream = BoxStream<'static, StoreResult<FeedEvent>>;

/// Errors reported by a document store.
///
/// The variant names mirror the error names document stores put on the wire,
/// see [`StoreError::name`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not_found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient failure (network, overload, timeout).
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{name}: {reason}")]
    Other { name: String, reason: String },
}

impl StoreError {
    /// Wire name of the error (`"forbidden"`, `"conflict"`, ...).
    pub fn name(&self) -> &str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Other { name, .. } => name,
        }
    }

    /// Human readable reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::Unauthorized(r)
            | Self::Forbidden(r)
            | Self::NotFound(r)
            | Self::Conflict(r)
            | Self::Unavailable(r) => r,
            Self::Other { reason, .. } => reason,
        }
    }

    /// Authorization failures are configuration problems, never retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Forbidden(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sequence positions
// ═══════════════════════════════════════════════════════════════════════════════

/// A position in a change feed.
///
/// Stores report either plain integers or opaque strings. Integers order
/// before opaque values; opaque values compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    Num(u64),
    Opaque(String),
}

impl Seq {
    /// The beginning of every feed.
    pub const ZERO: Seq = Seq::Num(0);

    pub fn is_zero(&self) -> bool {
        matches!(self, Seq::Num(0))
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::ZERO
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Seq::Num(a), Seq::Num(b)) => a.cmp(b),
            (Seq::Num(_), Seq::Opaque(_)) => Ordering::Less,
            (Seq::Opaque(_), Seq::Num(_)) => Ordering::Greater,
            (Seq::Opaque(a), Seq::Opaque(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Num(n) => write!(f, "{}", n),
            Seq::Opaque(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq::Num(n)
    }
}

impl FromStr for Seq {
    type Err = std::convert::Infallible;

    /// Digits-only strings become [`Seq::Num`]; anything else is opaque.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<u64>() {
            Ok(n) => Seq::Num(n),
            Err(_) => Seq::Opaque(s.to_string()),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Documents and feed entries
// ═══════════════════════════════════════════════════════════════════════════════

fn is_false(b: &bool) -> bool {
    !*b
}

/// A document at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: String,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: rev.into(),
            deleted: false,
            body: serde_json::Map::new(),
        }
    }

    /// Build a document from a JSON object body.
    ///
    /// Non-object values are stored under a `value` field.
    pub fn with_body(id: impl Into<String>, rev: impl Into<String>, body: serde_json::Value) -> Self {
        let body = match body {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            body,
            ..Self::new(id, rev)
        }
    }

    /// Revision generation (the `N` in `N-hash`), 0 if unparsable.
    pub fn generation(&self) -> u64 {
        rev_generation(&self.rev)
    }
}

/// Parse the generation prefix of a revision id.
pub fn rev_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(gen, _)| gen.parse().ok())
        .unwrap_or(0)
}

/// A revision reference inside a change entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevRef {
    pub rev: String,
}

/// One entry of a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    /// Sequence of this entry. Some stores omit it (e.g. with `seq_interval`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Seq>,
    pub changes: Vec<RevRef>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Present when the feed was opened with `include_docs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
    /// Remaining changes the source still has to send, when it reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<u64>,
}

impl Change {
    /// Revisions requested by this change.
    pub fn revs(&self) -> Vec<String> {
        self.changes.iter().map(|r| r.rev.clone()).collect()
    }
}

/// Items yielded by a [`ChangesStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A change entry that passed the store-side filters.
    Change(Change),
    /// The feed ended. `results` counts the changes it delivered.
    Complete { last_seq: Seq, results: usize },
}

/// Which revisions a change entry lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesStyle {
    /// Only the winning revision.
    MainOnly,
    /// Every leaf revision, conflicts included.
    #[default]
    AllDocs,
}

/// Request parameters for [`DocumentStore::changes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesOptions {
    pub since: Seq,
    pub limit: Option<usize>,
    pub batch_size: usize,
    pub style: ChangesStyle,
    pub doc_ids: Option<Vec<String>>,
    pub selector: Option<serde_json::Value>,
    /// Named server-side filter.
    pub filter: Option<String>,
    pub include_docs: bool,
    pub heartbeat: Option<Duration>,
    pub timeout: Option<Duration>,
    pub view: Option<String>,
    pub query_params: Option<serde_json::Map<String, serde_json::Value>>,
    pub seq_interval: Option<u64>,
    /// Keep tailing after the backlog is drained.
    pub live: bool,
}

/// What the target is missing for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<String>,
}

/// Options for [`DocumentStore::bulk_docs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkDocsOptions {
    /// `false` stores revisions as given instead of minting new ones.
    pub new_edits: bool,
    pub timeout: Option<Duration>,
}

impl Default for BulkDocsOptions {
    fn default() -> Self {
        Self {
            new_edits: true,
            timeout: None,
        }
    }
}

/// A per-document write failure, as reported in `ReplicationResult::errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub id: String,
    /// Wire error name (`"forbidden"`, `"conflict"`, ...).
    pub name: String,
    pub reason: String,
}

impl WriteFailure {
    pub fn new(id: impl Into<String>, error: &StoreError) -> Self {
        Self {
            id: id.into(),
            name: error.name().to_string(),
            reason: error.reason().to_string(),
        }
    }

    pub fn is_auth(&self) -> bool {
        self.name == "unauthorized" || self.name == "forbidden"
    }
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.id, self.name, self.reason)
    }
}

/// Outcome of writing one document in a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub id: String,
    pub rev: Option<String>,
    pub error: Option<WriteFailure>,
}

impl WriteResult {
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: &StoreError) -> Self {
        let id = id.into();
        Self {
            error: Some(WriteFailure::new(id.clone(), error)),
            id,
            rev: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Trait defining what we need from a document store.
///
/// Implementations must be cheap to call concurrently; the replicator may
/// issue a change feed request while a bulk write is still in flight.
pub trait DocumentStore: Send + Sync + 'static {
    /// Stable identifier used to derive the replication id.
    fn id(&self) -> String;

    /// Open a change feed.
    ///
    /// One-shot feeds end with [`FeedEvent::Complete`]. Live feeds keep
    /// yielding changes until dropped (or until `timeout` elapses idle).
    fn changes(&self, opts: ChangesOptions) -> ChangesStream;

    /// Ask which of the given revisions this store does not have.
    ///
    /// Documents with nothing missing may be omitted from the answer.
    fn revs_diff(
        &self,
        revs: BTreeMap<String, Vec<String>>,
    ) -> BoxFuture<'_, BTreeMap<String, RevsDiffEntry>>;

    /// Fetch specific revisions of one document.
    fn get_revs(&self, id: &str, revs: Vec<String>) -> BoxFuture<'_, Vec<Document>>;

    /// Write many documents at once.
    fn bulk_docs(&self, docs: Vec<Document>, opts: BulkDocsOptions)
        -> BoxFuture<'_, Vec<WriteResult>>;

    /// Read a local (non-replicated) document.
    fn get_local(&self, id: &str) -> BoxFuture<'_, Option<serde_json::Value>>;

    /// Write a local (non-replicated) document, replacing any previous value.
    fn put_local(&self, id: &str, value: serde_json::Value) -> BoxFuture<'_, ()>;
}
