//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A fault-injecting store wrapping [`MemoryStore`](doc_replicator::MemoryStore)
//! - Document seeding and event collection helpers

pub mod mock_store;

pub use mock_store::*;

use doc_replicator::{MemoryStore, ReplicationEvent};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Write `n` documents named `doc000`, `doc001`, ...
pub async fn seed_docs(store: &MemoryStore, n: usize) {
    for i in 0..n {
        store
            .put(&format!("doc{:03}", i), json!({ "i": i }))
            .await
            .expect("seed put");
    }
}

/// Collect events until the channel closes.
pub async fn drain_events(rx: &mut UnboundedReceiver<ReplicationEvent>) -> Vec<ReplicationEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Collect events until one matches `pred` (inclusive), failing after `within`.
pub async fn events_until(
    rx: &mut UnboundedReceiver<ReplicationEvent>,
    within: Duration,
    pred: impl Fn(&ReplicationEvent) -> bool,
) -> Vec<ReplicationEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                let done = pred(&event);
                events.push(event);
                if done {
                    return events;
                }
            }
            Ok(None) => panic!("event channel closed early, got {:?}", events),
            Err(_) => panic!("timed out waiting for event, got {:?}", events),
        }
    }
}

pub fn is_idle(event: &ReplicationEvent) -> bool {
    matches!(event, ReplicationEvent::Paused { error: None })
}

pub fn count<F: Fn(&ReplicationEvent) -> bool>(events: &[ReplicationEvent], pred: F) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
