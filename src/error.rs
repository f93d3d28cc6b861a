// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are categorized by the phase that produced them and carry enough
//! context to tell which collaborator call failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Unless auth | A source/target call failed (changes, revs_diff, bulk_docs) |
//! | `Checkpoint` | Unless auth | Reading or writing a checkpoint failed |
//! | `DocFetch` | Yes | Some missing revisions could not be fetched from the source |
//! | `DocWrite` | Unless auth | The target rejected a document for a non-auth reason |
//! | `Config` | No | Options are invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether the task should
//! back off and restart. Authorization failures (`unauthorized`, `forbidden`)
//! are never retried: they need a credentials or permissions fix.

use crate::store::{StoreError, WriteFailure};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that end a replication attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// A store call failed.
    #[error("Store error ({operation}): {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// Checkpoint persistence failed.
    #[error("Checkpoint error ({operation}): {source}")]
    Checkpoint {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// The source could not deliver every missing revision of a batch.
    #[error("There was a problem getting docs: {0}")]
    DocFetch(String),

    /// The target refused a document.
    #[error("Document write failed: {0}")]
    DocWrite(WriteFailure),

    /// Invalid options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a store error for the given operation.
    pub fn store(operation: &'static str, source: StoreError) -> Self {
        Self::Store { operation, source }
    }

    /// Create a checkpoint error for the given operation.
    pub fn checkpoint(operation: &'static str, source: StoreError) -> Self {
        Self::Checkpoint { operation, source }
    }

    /// Wire-style error name, as exposed to callers.
    pub fn name(&self) -> &str {
        match self {
            Self::Store { source, .. } | Self::Checkpoint { source, .. } => source.name(),
            Self::DocWrite(failure) => &failure.name,
            Self::DocFetch(_) => "doc_fetch",
            Self::Config(_) => "bad_request",
            Self::Internal(_) => "internal",
        }
    }

    /// Check if this is an `unauthorized`/`forbidden` failure.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Store { source, .. } | Self::Checkpoint { source, .. } => source.is_auth(),
            Self::DocWrite(failure) => failure.is_auth(),
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } | Self::Checkpoint { .. } | Self::DocWrite(_) => !self.is_auth(),
            Self::DocFetch(_) => true,
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }
}
