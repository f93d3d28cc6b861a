// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject failures and verify replication still converges.
//!
//! These tests verify the replicator handles failures without panics,
//! deadlocks, lost documents or a checkpoint that runs ahead of the target.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{drain_events, seed_docs, FaultyStore};
use doc_replicator::{
    replicate, MemoryStore, ReplicationEvent, ReplicationOptions, ReplicationStatus, Seq,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

/// Every live source document is on the target at the same winning revision.
async fn assert_converged(source: &MemoryStore, target: &MemoryStore) {
    let info = source.info().await;
    assert_eq!(target.info().await.doc_count, info.doc_count);
    for i in 0..info.doc_count {
        let id = format!("doc{:03}", i);
        let Some(expected) = source.get(&id).await else { continue };
        let actual = target.get(&id).await.unwrap_or_else(|| panic!("{} missing", id));
        assert_eq!(actual.rev, expected.rev, "{} at wrong revision", id);
        assert_eq!(actual.body, expected.body);
    }
}

// =============================================================================
// Transient Store Failures
// =============================================================================

/// Test: Every combination of transient faults still converges
#[tokio::test]
async fn transient_faults_converge() {
    for round in 0..8usize {
        let data = MemoryStore::new("source");
        seed_docs(&data, 45).await;
        let source = Arc::new(FaultyStore::wrap(data.clone()));
        let target = Arc::new(FaultyStore::new("target"));

        // Spread faults over the pipeline differently each round.
        source.fail_changes(round % 3);
        source.fail_get_revs((round / 2) % 3);
        target.fail_revs_diff(round % 2);
        target.fail_bulk_docs((round + 1) % 3);
        target.fail_put_local(round % 4);

        let task = replicate(Arc::clone(&source), Arc::clone(&target), ReplicationOptions::for_testing());
        let result = tokio::time::timeout(WAIT, task.join())
            .await
            .unwrap_or_else(|_| panic!("round {} deadlocked", round))
            .unwrap_or_else(|f| panic!("round {} failed: {}", round, f));

        assert!(result.ok, "round {}", round);
        assert_eq!(result.last_seq, Seq::Num(45), "round {}", round);
        assert_converged(&data, &target.inner).await;
        println!(
            "round {}: read={} written={} failures={}",
            round, result.docs_read, result.docs_written, result.doc_write_failures
        );
    }
}

/// Test: A checkpoint failing on every batch never reports progress it did not make
#[tokio::test]
async fn checkpoint_progress_never_regresses() {
    let source = Arc::new(MemoryStore::new("source"));
    seed_docs(&source, 60).await;
    let target = Arc::new(FaultyStore::new("target"));
    target.fail_put_local(5);

    let mut task = replicate(Arc::clone(&source), Arc::clone(&target), ReplicationOptions::for_testing());
    let mut events = task.take_events().unwrap();
    let result = tokio::time::timeout(WAIT, task.join()).await.unwrap().unwrap();
    assert!(result.ok);

    let mut high_water = Seq::ZERO;
    for event in drain_events(&mut events).await {
        if let ReplicationEvent::Change(info) = event {
            assert!(info.result.last_seq >= high_water);
            high_water = info.result.last_seq;
        }
    }
    assert_eq!(high_water, Seq::Num(60));
    assert_converged(&source, &target.inner).await;
}

// =============================================================================
// Cancellation
// =============================================================================

/// Test: Cancelling at arbitrary points never hangs, and a rerun finishes the job
#[tokio::test]
async fn cancel_at_random_points_then_resume() {
    let source = Arc::new(MemoryStore::new("source"));
    seed_docs(&source, 200).await;

    for delay_ms in [0u64, 1, 2, 5, 10] {
        let target = Arc::new(MemoryStore::new("target"));
        let task = replicate(Arc::clone(&source), Arc::clone(&target), ReplicationOptions::for_testing());
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        task.cancel();

        let result = tokio::time::timeout(WAIT, task.join())
            .await
            .unwrap_or_else(|_| panic!("cancel after {}ms hung", delay_ms))
            .unwrap();
        assert!(matches!(
            result.status,
            Some(ReplicationStatus::Cancelled) | Some(ReplicationStatus::Complete)
        ));
        // Whatever was checkpointed must already be on the target.
        if let Seq::Num(n) = result.last_seq {
            assert!(target.info().await.doc_count >= n as usize);
        }

        let result = replicate(Arc::clone(&source), Arc::clone(&target), ReplicationOptions::for_testing())
            .join()
            .await
            .unwrap();
        assert_eq!(result.last_seq, Seq::Num(200));
        assert_converged(&source, &target).await;
    }
}

/// Test: Dropping the event receiver does not stall the replication
#[tokio::test]
async fn dropped_event_receiver_is_harmless() {
    let source = Arc::new(MemoryStore::new("source"));
    seed_docs(&source, 30).await;
    let target = Arc::new(MemoryStore::new("target"));

    let mut task = replicate(Arc::clone(&source), Arc::clone(&target), ReplicationOptions::for_testing());
    drop(task.take_events());

    let result = tokio::time::timeout(WAIT, task.join()).await.unwrap().unwrap();
    assert!(result.ok);
    assert_converged(&source, &target).await;
}

// =============================================================================
// Concurrent Writers
// =============================================================================

/// Test: A continuous replication keeps up with a concurrent writer
#[tokio::test]
async fn continuous_under_concurrent_writes() {
    let source = Arc::new(MemoryStore::new("source"));
    seed_docs(&source, 20).await;
    let target = Arc::new(MemoryStore::new("target"));
    let options = ReplicationOptions {
        live: true,
        ..ReplicationOptions::for_testing()
    };

    let task = replicate(Arc::clone(&source), Arc::clone(&target), options);

    let writer = {
        let source = Arc::clone(&source);
        tokio::spawn(async move {
            for round in 0..5 {
                for i in 0..20 {
                    source
                        .put(&format!("doc{:03}", i), json!({ "i": i, "round": round }))
                        .await
                        .unwrap();
                }
                tokio::task::yield_now().await;
            }
            for i in 20..40 {
                source.put(&format!("doc{:03}", i), json!({ "i": i })).await.unwrap();
            }
        })
    };
    writer.await.unwrap();

    let expected_seq = source.info().await.update_seq;
    tokio::time::timeout(WAIT, async {
        loop {
            let caught_up = target.info().await.doc_count == 40
                && target.get("doc000").await.map(|d| d.body["round"] == json!(4)).unwrap_or(false);
            if caught_up {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("continuous replication fell behind");

    task.cancel();
    let result = tokio::time::timeout(WAIT, task.join()).await.unwrap().unwrap();
    assert_eq!(result.status, Some(ReplicationStatus::Cancelled));
    assert!(result.last_seq <= Seq::Num(expected_seq));
    assert_converged(&source, &target).await;
}

/// Test: Many replications into one target do not interfere
#[tokio::test]
async fn fan_in_to_shared_target() {
    let target = Arc::new(MemoryStore::new("target"));
    let mut tasks = Vec::new();
    for n in 0..6 {
        let source = Arc::new(MemoryStore::new(format!("source-{}", n)));
        for i in 0..25 {
            source.put(&format!("s{}-{:03}", n, i), json!({ "n": n })).await.unwrap();
        }
        tasks.push(replicate(source, Arc::clone(&target), ReplicationOptions::for_testing()));
    }

    for task in tasks {
        let result = tokio::time::timeout(WAIT, task.join()).await.unwrap().unwrap();
        assert!(result.ok);
        assert_eq!(result.docs_written, 25);
    }
    assert_eq!(target.info().await.doc_count, 150);
}
