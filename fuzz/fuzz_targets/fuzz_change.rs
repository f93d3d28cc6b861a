//! Fuzz target for change feed entries.
//!
//! Decoding arbitrary bytes into a change and batching it never panics.

#![no_main]

use doc_replicator::batch::Batch;
use doc_replicator::store::Change;
use doc_replicator::Seq;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(changes) = serde_json::from_slice::<Vec<Change>>(data) else { return };
    let batch = Batch::new(Seq::ZERO, changes, None);
    let request = batch.diff_request();
    assert!(request.len() <= batch.changes.len());
});
