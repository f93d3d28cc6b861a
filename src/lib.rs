//! # Document Replicator
//!
//! Checkpointed, batched replication of documents from a source document
//! store to a target document store, one-shot or continuous.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            ReplicationTask                                │
//! │                                                                           │
//! │  ┌─────────────────┐   ┌──────────────┐   ┌────────────────────────────┐  │
//! │  │ ChangesConsumer │──►│ PendingBatch │──►│ FIFO (≤ batches_limit)     │  │
//! │  │ (source feed)   │   │ (≤ batch_size│   └─────────────┬──────────────┘  │
//! │  └─────────────────┘   └──────────────┘                 ▼                 │
//! │                                       ┌────────────────────────────────┐  │
//! │                                       │ Batch: diff → fetch → write    │  │
//! │                                       │        (target)  (source)      │  │
//! │                                       └──────────────┬─────────────────┘  │
//! │                                                      ▼                    │
//! │                                       ┌────────────────────────────────┐  │
//! │                                       │ Checkpointer (_local/ docs on  │  │
//! │                                       │ source and/or target)          │  │
//! │                                       └────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once: a checkpoint is only written after its batch is
//! on the target, and a restart resumes from the last checkpoint both sides
//! agree on.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replicator::{replicate, MemoryStore, ReplicationEvent, ReplicationOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = Arc::new(MemoryStore::new("source"));
//!     let target = Arc::new(MemoryStore::new("target"));
//!
//!     let mut task = replicate(source, target, ReplicationOptions::default());
//!     let mut events = task.take_events().expect("events already taken");
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             if let ReplicationEvent::Denied(failure) = event {
//!                 eprintln!("denied: {}", failure);
//!             }
//!         }
//!     });
//!
//!     let result = task.join().await.expect("replication failed");
//!     println!("{} docs written", result.docs_written);
//! }
//! ```

pub mod batch;
pub mod changes;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod memory;
pub mod metrics;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use checkpoint::Checkpointer;
pub use config::{BackoffConfig, ChangeFilter, CheckpointMode, ReplicationOptions};
pub use coordinator::{
    replicate, ChangeInfo, ReplicationEvent, ReplicationFailure, ReplicationResult,
    ReplicationStatus, ReplicationTask, TaskState,
};
pub use error::{ReplicationError, Result};
pub use identity::generate_replication_id;
pub use memory::MemoryStore;
pub use store::{Document, DocumentStore, Seq, StoreError};
