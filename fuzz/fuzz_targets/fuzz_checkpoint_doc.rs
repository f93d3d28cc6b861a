//! Fuzz target for checkpoint documents read back from a store.
//!
//! Arbitrary JSON either fails to decode or compares without panicking.

#![no_main]

use doc_replicator::checkpoint::{compare_checkpoints, CheckpointDoc};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&[u8], &[u8])| {
    let (source, target) = data;
    let Ok(source) = serde_json::from_slice::<CheckpointDoc>(source) else { return };
    let Ok(target) = serde_json::from_slice::<CheckpointDoc>(target) else { return };

    let seq = compare_checkpoints(&source, &target);
    assert!(seq.is_zero() || seq == source.last_seq || seq == target.last_seq
        || source.history.iter().chain(&target.history).any(|h| h.last_seq == seq));

    let mut advanced = source.clone();
    advanced.advance(&target.last_seq, &target.session_id);
    assert!(advanced.history.len() <= doc_replicator::checkpoint::CHECKPOINT_HISTORY_SIZE);
});
