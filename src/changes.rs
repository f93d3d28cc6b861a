// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed consumer.
//!
//! Tails the source's change feed and routes entries into the pending batch.
//!
//! # Paging
//!
//! The backlog is read in pages of `batch_size` one-shot requests. A page that
//! delivered results is followed by another page from its `last_seq`. An empty
//! page means the backlog is drained: one-shot replications are then done,
//! live replications re-subscribe with `live: true` and keep tailing.
//!
//! ```text
//! page(since=0) ──▶ 100 results ──▶ page(since=100) ──▶ 0 results
//!                                                        │
//!                              one-shot: completed ◀─────┤
//!                              live: tail(since=100) ◀───┘
//! ```
//!
//! # Cancellation
//!
//! At most one subscription is held. Starting a new one, or cancelling,
//! drops the previous stream, which cancels the request.

use crate::batch::PendingBatch;
use crate::config::{ChangeFilter, ReplicationOptions};
use crate::store::{
    Change, ChangesOptions, ChangesStream, ChangesStyle, DocumentStore, FeedEvent, Seq,
    StoreResult,
};
use futures::StreamExt;
use tracing::{debug, trace};

/// What the driver should do after a feed page completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCompletion {
    /// The page delivered results; request the next page.
    MoreAvailable,
    /// The backlog is drained at `last_seq`.
    Drained { last_seq: Seq },
}

/// Consumes a source's change feed for one replication attempt.
pub struct ChangesConsumer {
    /// Request template; `since` and `live` are filled per subscription.
    template: ChangesOptions,
    filter_fn: Option<ChangeFilter>,
    /// Position the next subscription starts from.
    since: Seq,
    /// Seq of the most recent change seen, for entries without one.
    last_known_seq: Seq,
    /// Tailing with `live: true` (backlog drained, live replication).
    live: bool,
    /// Whether the replication wants to tail after the backlog.
    continuous: bool,
    /// One-shot backlog drained; no further subscriptions.
    completed: bool,
    stream: Option<ChangesStream>,
}

impl ChangesConsumer {
    pub fn new(options: &ReplicationOptions, since: Seq) -> Self {
        let template = ChangesOptions {
            since: Seq::ZERO,
            limit: Some(options.batch_size),
            batch_size: options.batch_size,
            style: ChangesStyle::AllDocs,
            doc_ids: options.doc_ids.clone(),
            selector: options.selector.clone(),
            filter: options.filter.clone(),
            include_docs: options.filter_fn.is_some(),
            heartbeat: options.heartbeat_duration(),
            timeout: options.timeout_duration(),
            view: options.view.clone(),
            query_params: options.query_params.clone(),
            seq_interval: options.seq_interval,
            live: false,
        };
        Self {
            template,
            filter_fn: options.filter_fn.clone(),
            last_known_seq: since.clone(),
            since,
            live: false,
            continuous: options.live,
            completed: false,
            stream: None,
        }
    }

    /// Request for the next subscription.
    pub fn request(&self) -> ChangesOptions {
        ChangesOptions {
            since: self.since.clone(),
            live: self.live,
            ..self.template.clone()
        }
    }

    pub fn since(&self) -> &Seq {
        &self.since
    }

    /// Tailing live (the backlog has been drained).
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// One-shot backlog fully read.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_subscribed(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether a new subscription may start with `queued` batches waiting.
    pub fn can_fetch(&self, queued: usize, batches_limit: usize) -> bool {
        self.stream.is_none() && !self.completed && queued < batches_limit
    }

    /// Open the next page (or the live tail), dropping any previous stream.
    pub fn subscribe<S: DocumentStore + ?Sized>(&mut self, source: &S) {
        let request = self.request();
        debug!(since = %request.since, live = request.live, "Requesting changes");
        self.stream = Some(source.changes(request));
    }

    /// Drop the current subscription.
    pub fn cancel(&mut self) {
        if self.stream.take().is_some() {
            debug!("Change feed subscription cancelled");
        }
    }

    /// Next feed event. Never resolves while unsubscribed.
    ///
    /// A stream that ends without [`FeedEvent::Complete`] yields `None` and
    /// clears the subscription.
    pub async fn next_event(&mut self) -> Option<StoreResult<FeedEvent>> {
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };
        let event = stream.next().await;
        if event.is_none() {
            self.stream = None;
        }
        event
    }

    /// Route one change into `pending`. Returns whether the change was kept.
    ///
    /// The pending position advances even for changes the client-side filter
    /// rejects, so filtered-out tails still get checkpointed.
    pub fn route(&mut self, change: Change, pending: &mut PendingBatch) -> bool {
        let seq = change
            .seq
            .clone()
            .unwrap_or_else(|| self.last_known_seq.clone());
        self.last_known_seq = seq.clone();
        pending.seq = seq;

        if let Some(filter) = &self.filter_fn {
            if !filter.accepts(&change) {
                trace!(doc_id = %change.id, "Change rejected by filter");
                return false;
            }
        }

        trace!(doc_id = %change.id, seq = %pending.seq, "Change queued");
        if change.pending.is_some() {
            pending.pending = change.pending;
        }
        pending.changes.push(change);
        true
    }

    /// Account for a completed page. The subscription is released.
    pub fn on_complete(&mut self, last_seq: Seq, results: usize) -> FeedCompletion {
        self.stream = None;
        if last_seq > self.last_known_seq {
            self.last_known_seq = last_seq.clone();
        }
        if results > 0 {
            self.since = last_seq;
            FeedCompletion::MoreAvailable
        } else {
            FeedCompletion::Drained { last_seq }
        }
    }

    /// Continue after a drained page: go live, or stop fetching.
    pub fn after_drain(&mut self, last_seq: Seq) {
        self.since = last_seq;
        if self.continuous {
            self.live = true;
        } else {
            self.completed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::RevRef;
    use serde_json::json;

    fn change(id: &str, seq: Option<u64>) -> Change {
        Change {
            id: id.to_string(),
            seq: seq.map(Seq::Num),
            changes: vec![RevRef { rev: "1-a".into() }],
            deleted: false,
            doc: None,
            pending: None,
        }
    }

    #[test]
    fn test_request_shape() {
        let options = ReplicationOptions {
            batch_size: 25,
            doc_ids: Some(vec!["a".into()]),
            heartbeat: Some("10s".into()),
            ..Default::default()
        };
        let consumer = ChangesConsumer::new(&options, Seq::Num(7));
        let request = consumer.request();
        assert_eq!(request.since, Seq::Num(7));
        assert_eq!(request.limit, Some(25));
        assert_eq!(request.batch_size, 25);
        assert_eq!(request.style, ChangesStyle::AllDocs);
        assert!(!request.include_docs);
        assert!(!request.live);
        assert_eq!(request.heartbeat, Some(std::time::Duration::from_secs(10)));
        assert_eq!(request.doc_ids, Some(vec!["a".to_string()]));
    }

    #[test]
    fn test_filter_fn_requests_docs() {
        let options = ReplicationOptions::default().with_filter_fn(|_| true);
        let consumer = ChangesConsumer::new(&options, Seq::ZERO);
        assert!(consumer.request().include_docs);
    }

    #[test]
    fn test_route_advances_seq_for_rejected_changes() {
        let options = ReplicationOptions::default().with_filter_fn(|c| c.id != "skip");
        let mut consumer = ChangesConsumer::new(&options, Seq::ZERO);
        let mut pending = PendingBatch::new(Seq::ZERO);

        assert!(consumer.route(change("keep", Some(1)), &mut pending));
        assert!(!consumer.route(change("skip", Some(2)), &mut pending));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.seq, Seq::Num(2));
    }

    #[test]
    fn test_route_without_seq_uses_last_known() {
        let options = ReplicationOptions::default();
        let mut consumer = ChangesConsumer::new(&options, Seq::Num(4));
        let mut pending = PendingBatch::new(Seq::Num(4));

        consumer.route(change("a", None), &mut pending);
        assert_eq!(pending.seq, Seq::Num(4));
        consumer.route(change("b", Some(9)), &mut pending);
        consumer.route(change("c", None), &mut pending);
        assert_eq!(pending.seq, Seq::Num(9));
    }

    #[test]
    fn test_route_keeps_pending_count() {
        let mut consumer = ChangesConsumer::new(&ReplicationOptions::default(), Seq::ZERO);
        let mut pending = PendingBatch::new(Seq::ZERO);
        let mut with_pending = change("a", Some(1));
        with_pending.pending = Some(12);
        consumer.route(with_pending, &mut pending);
        consumer.route(change("b", Some(2)), &mut pending);
        assert_eq!(pending.pending, Some(12));
    }

    #[test]
    fn test_completion_paging() {
        let mut consumer = ChangesConsumer::new(&ReplicationOptions::default(), Seq::ZERO);
        assert_eq!(consumer.on_complete(Seq::Num(100), 100), FeedCompletion::MoreAvailable);
        assert_eq!(consumer.since(), &Seq::Num(100));

        assert_eq!(
            consumer.on_complete(Seq::Num(100), 0),
            FeedCompletion::Drained { last_seq: Seq::Num(100) }
        );
        consumer.after_drain(Seq::Num(100));
        assert!(consumer.is_completed());
        assert!(!consumer.can_fetch(0, 10));
    }

    #[test]
    fn test_continuous_goes_live_after_drain() {
        let options = ReplicationOptions {
            live: true,
            ..Default::default()
        };
        let mut consumer = ChangesConsumer::new(&options, Seq::ZERO);
        consumer.after_drain(Seq::Num(3));
        assert!(consumer.is_live());
        assert!(!consumer.is_completed());
        assert!(consumer.request().live);
        assert_eq!(consumer.request().since, Seq::Num(3));
    }

    #[test]
    fn test_can_fetch_respects_backpressure() {
        let consumer = ChangesConsumer::new(&ReplicationOptions::default(), Seq::ZERO);
        assert!(consumer.can_fetch(9, 10));
        assert!(!consumer.can_fetch(10, 10));
    }

    #[tokio::test]
    async fn test_subscribe_and_read_page() {
        let source = MemoryStore::new("source");
        source.put("a", json!({})).await.unwrap();
        source.put("b", json!({})).await.unwrap();

        let options = ReplicationOptions::default();
        let mut consumer = ChangesConsumer::new(&options, Seq::ZERO);
        consumer.subscribe(&source);
        assert!(consumer.is_subscribed());

        let mut pending = PendingBatch::new(Seq::ZERO);
        loop {
            match consumer.next_event().await.unwrap().unwrap() {
                FeedEvent::Change(c) => {
                    consumer.route(c, &mut pending);
                }
                FeedEvent::Complete { last_seq, results } => {
                    assert_eq!(results, 2);
                    assert_eq!(consumer.on_complete(last_seq, results), FeedCompletion::MoreAvailable);
                    break;
                }
            }
        }
        assert!(!consumer.is_subscribed());
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.seq, Seq::Num(2));
    }

    #[tokio::test]
    async fn test_cancel_drops_subscription() {
        let source = MemoryStore::new("source");
        let mut consumer = ChangesConsumer::new(&ReplicationOptions::default(), Seq::ZERO);
        consumer.subscribe(&source);
        consumer.cancel();
        assert!(!consumer.is_subscribed());

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(20), consumer.next_event()).await;
        assert!(waited.is_err());
    }
}
