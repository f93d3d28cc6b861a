//! Replication identity.
//!
//! Two replications share a checkpoint only if they move the same documents
//! between the same stores, so the id hashes everything that narrows the
//! change feed.

use crate::config::ReplicationOptions;
use crate::store::DocumentStore;
use sha2::{Digest, Sha256};

/// Derive the checkpoint document id for a replication.
///
/// Deterministic: the same stores and filtering options always give the same
/// id. Ordering of `doc_ids` and `query_params` does not matter.
pub fn generate_replication_id<S, T>(source: &S, target: &T, options: &ReplicationOptions) -> String
where
    S: DocumentStore + ?Sized,
    T: DocumentStore + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut field = |name: &str, value: &str| {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    };

    field("source", &source.id());
    field("target", &target.id());

    if let Some(filter) = &options.filter {
        field("filter", filter);
    }
    if let Some(params) = &options.query_params {
        let mut sorted: Vec<_> = params.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in sorted {
            field("query_param", &format!("{}={}", key, value));
        }
    }
    if let Some(ids) = &options.doc_ids {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        field("doc_ids", &sorted.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\u{1f}"));
    }
    if let Some(selector) = &options.selector {
        field("selector", &selector.to_string());
    }
    if let Some(view) = &options.view {
        field("view", view);
    }

    format!("_local/{}", hex::encode(hasher.finalize()))
}
