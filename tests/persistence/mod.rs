//! Persistence engine contract tests.
//!
//! Every backend must pass these. Each implementation's test binary builds a
//! store and hands it to `run_persistence_tests!`.
//!
//! Tests use their own tenant so they can share one store. The lifecycle
//! tests that wipe everything run last.

use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use serde_json::json;
use uuid::Uuid;

use commitstore::model::{
    Commit, CommitAttempt, EventMessage, Headers, Payload, Snapshot, StreamHead, StreamRevision,
};
use commitstore::persistence::{PersistStreams, PersistenceError};

/// Build an attempt carrying `events` events that ends at `revision`.
pub fn make_attempt(
    tenant: &str,
    stream: &str,
    sequence: u32,
    revision: StreamRevision,
    events: u32,
) -> CommitAttempt {
    make_attempt_at(tenant, stream, sequence, revision, events, Utc::now())
}

pub fn make_attempt_at(
    tenant: &str,
    stream: &str,
    sequence: u32,
    revision: StreamRevision,
    events: u32,
    stamp: DateTime<Utc>,
) -> CommitAttempt {
    let first = revision + 1 - events.min(revision + 1);
    let mut headers = Headers::new();
    headers.insert("origin".to_string(), json!("contract"));
    CommitAttempt {
        tenant_id: tenant.to_string(),
        stream_id: stream.to_string(),
        stream_revision: revision,
        commit_id: Uuid::new_v4(),
        commit_sequence: sequence,
        commit_stamp: stamp,
        headers,
        events: (first..first + events)
            .map(|n| {
                EventMessage::new(Payload::new("Deposited", json!({ "amount": n })))
                    .with_header("n", json!(n))
            })
            .collect(),
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

async fn read_stream<S: PersistStreams>(
    store: &S,
    tenant: &str,
    stream: &str,
    min: StreamRevision,
    max: StreamRevision,
) -> Vec<Commit> {
    store
        .get(tenant, stream, min, max)
        .try_collect()
        .await
        .expect("get should succeed")
}

async fn read_from<S: PersistStreams>(store: &S, tenant: &str, checkpoint: i64) -> Vec<Commit> {
    store
        .get_from(tenant, checkpoint)
        .try_collect()
        .await
        .expect("get_from should succeed")
}

async fn heads<S: PersistStreams>(store: &S, tenant: &str, threshold: u32) -> Vec<StreamHead> {
    store
        .streams_to_snapshot(tenant, threshold)
        .try_collect()
        .await
        .expect("streams_to_snapshot should succeed")
}

// =============================================================================
// Commit tests
// =============================================================================

pub async fn test_commit_then_read<S: PersistStreams>(store: &S) {
    let tenant = "test_commit_then_read";
    let committed = store
        .commit(make_attempt(tenant, "s1", 1, 2, 2))
        .await
        .expect("commit should succeed")
        .expect("commit should be stored");

    assert!(committed.checkpoint_token > 0);
    assert_eq!(committed.stream_revision, 2);
    assert_eq!(committed.commit_sequence, 1);

    let commits = read_stream(store, tenant, "s1", 0, StreamRevision::MAX).await;
    assert_eq!(commits, vec![committed]);
}

pub async fn test_empty_attempt_stores_nothing<S: PersistStreams>(store: &S) {
    let tenant = "test_empty_attempt";
    let result = store
        .commit(make_attempt(tenant, "s1", 1, 0, 0))
        .await
        .expect("empty commit should not fail");
    assert!(result.is_none());
    assert!(read_from(store, tenant, 0).await.is_empty());
}

pub async fn test_duplicate_commit_returns_existing<S: PersistStreams>(store: &S) {
    let tenant = "test_duplicate_commit";
    let first = make_attempt(tenant, "s1", 1, 1, 1);
    let commit_id = first.commit_id;
    let stored = store.commit(first).await.unwrap().unwrap();

    // same id, next slot: still a duplicate, not a conflict
    let mut retry = make_attempt(tenant, "s1", 2, 2, 1);
    retry.commit_id = commit_id;
    match store.commit(retry).await {
        Err(PersistenceError::DuplicateCommit(existing)) => assert_eq!(*existing, stored),
        other => panic!("expected DuplicateCommit, got {:?}", other),
    }

    assert_eq!(read_from(store, tenant, 0).await.len(), 1);
}

pub async fn test_same_id_on_other_stream_is_allowed<S: PersistStreams>(store: &S) {
    let tenant = "test_same_id_other_stream";
    let first = make_attempt(tenant, "s1", 1, 1, 1);
    let mut second = make_attempt(tenant, "s2", 1, 1, 1);
    second.commit_id = first.commit_id;

    store.commit(first).await.unwrap();
    store.commit(second).await.expect("ids are scoped to a stream");
}

pub async fn test_occupied_slot_conflicts<S: PersistStreams>(store: &S) {
    let tenant = "test_occupied_slot";
    store
        .commit(make_attempt(tenant, "s1", 1, 2, 2))
        .await
        .unwrap();

    let result = store.commit(make_attempt(tenant, "s1", 1, 1, 1)).await;
    assert!(
        matches!(
            result,
            Err(PersistenceError::ConcurrencyConflict {
                commit_sequence: 1,
                ..
            })
        ),
        "got {:?}",
        result
    );
    assert_eq!(read_from(store, tenant, 0).await.len(), 1);
}

pub async fn test_gap_is_invalid<S: PersistStreams>(store: &S) {
    let tenant = "test_gap_is_invalid";
    store
        .commit(make_attempt(tenant, "s1", 1, 1, 1))
        .await
        .unwrap();

    let result = store.commit(make_attempt(tenant, "s1", 3, 5, 1)).await;
    assert!(
        matches!(result, Err(PersistenceError::InvalidAttempt(_))),
        "got {:?}",
        result
    );
}

pub async fn test_checkpoints_increase<S: PersistStreams>(store: &S) {
    let tenant = "test_checkpoints_increase";
    let a = store
        .commit(make_attempt(tenant, "a", 1, 1, 1))
        .await
        .unwrap()
        .unwrap();
    let b = store
        .commit(make_attempt(tenant, "b", 1, 1, 1))
        .await
        .unwrap()
        .unwrap();
    let c = store
        .commit(make_attempt(tenant, "a", 2, 2, 1))
        .await
        .unwrap()
        .unwrap();

    assert!(a.checkpoint_token < b.checkpoint_token);
    assert!(b.checkpoint_token < c.checkpoint_token);
}

// =============================================================================
// Read tests
// =============================================================================

pub async fn test_get_revision_window<S: PersistStreams>(store: &S) {
    let tenant = "test_get_revision_window";
    for (seq, rev) in [(1, 2), (2, 4), (3, 6)] {
        store
            .commit(make_attempt(tenant, "s1", seq, rev, 2))
            .await
            .unwrap();
    }

    let exact = read_stream(store, tenant, "s1", 3, 4).await;
    assert_eq!(
        exact.iter().map(|c| c.commit_sequence).collect::<Vec<_>>(),
        vec![2]
    );

    // ranges that only touch a commit still include it
    let overlapping = read_stream(store, tenant, "s1", 2, 5).await;
    assert_eq!(
        overlapping
            .iter()
            .map(|c| c.commit_sequence)
            .collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let all = read_stream(store, tenant, "s1", 0, StreamRevision::MAX).await;
    assert_eq!(all.len(), 3);
    assert!(all
        .windows(2)
        .all(|w| w[0].stream_revision < w[1].stream_revision));
}

pub async fn test_get_unknown_stream_is_empty<S: PersistStreams>(store: &S) {
    let commits = read_stream(store, "test_get_unknown", "nope", 0, StreamRevision::MAX).await;
    assert!(commits.is_empty());
}

pub async fn test_get_from_checkpoint<S: PersistStreams>(store: &S) {
    let tenant = "test_get_from_checkpoint";
    let other = "test_get_from_checkpoint_other";

    let first = store
        .commit(make_attempt(tenant, "a", 1, 1, 1))
        .await
        .unwrap()
        .unwrap();
    store
        .commit(make_attempt(other, "a", 1, 1, 1))
        .await
        .unwrap();
    let second = store
        .commit(make_attempt(tenant, "b", 1, 3, 3))
        .await
        .unwrap()
        .unwrap();

    let all = read_from(store, tenant, 0).await;
    assert_eq!(all, vec![first.clone(), second.clone()]);

    let after_first = read_from(store, tenant, first.checkpoint_token).await;
    assert_eq!(after_first, vec![second.clone()]);

    assert!(read_from(store, tenant, second.checkpoint_token)
        .await
        .is_empty());
}

pub async fn test_get_by_time<S: PersistStreams>(store: &S) {
    let tenant = "test_get_by_time";
    store
        .commit(make_attempt_at(tenant, "late", 1, 1, 1, at(30)))
        .await
        .unwrap();
    store
        .commit(make_attempt_at(tenant, "early", 1, 1, 1, at(10)))
        .await
        .unwrap();
    store
        .commit(make_attempt_at(tenant, "middle", 1, 1, 1, at(20)))
        .await
        .unwrap();

    let window: Vec<Commit> = store
        .get_by_time(tenant, at(10), Some(at(30)))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        window.iter().map(|c| c.stream_id.as_str()).collect::<Vec<_>>(),
        vec!["early", "middle"]
    );

    let open_ended: Vec<Commit> = store
        .get_by_time(tenant, at(15), None)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        open_ended
            .iter()
            .map(|c| c.stream_id.as_str())
            .collect::<Vec<_>>(),
        vec!["middle", "late"]
    );
}

pub async fn test_headers_survive_storage<S: PersistStreams>(store: &S) {
    let tenant = "test_headers_survive";
    let mut attempt = make_attempt(tenant, "s1", 1, 1, 1);
    attempt
        .headers
        .insert("nested".to_string(), json!({ "user": "ada", "roles": [1, 2] }));
    store.commit(attempt).await.unwrap();

    let commits = read_stream(store, tenant, "s1", 0, StreamRevision::MAX).await;
    assert_eq!(commits[0].headers["nested"], json!({ "user": "ada", "roles": [1, 2] }));
    assert_eq!(commits[0].events[0].headers["n"], json!(1));
    assert_eq!(commits[0].events[0].body.data, json!({ "amount": 1 }));
}

// =============================================================================
// Snapshot tests
// =============================================================================

pub async fn test_snapshot_rules<S: PersistStreams>(store: &S) {
    let tenant = "test_snapshot_rules";
    let balance = |n: i64| Payload::new("Balance", json!(n));

    assert!(!store
        .add_snapshot(Snapshot::new(tenant, "s1", 1, balance(1)))
        .await
        .unwrap());

    store
        .commit(make_attempt(tenant, "s1", 1, 4, 4))
        .await
        .unwrap();

    assert!(!store
        .add_snapshot(Snapshot::new(tenant, "s1", 5, balance(5)))
        .await
        .unwrap());
    assert!(store
        .add_snapshot(Snapshot::new(tenant, "s1", 2, balance(2)))
        .await
        .unwrap());
    assert!(!store
        .add_snapshot(Snapshot::new(tenant, "s1", 2, balance(99)))
        .await
        .unwrap());
    assert!(store
        .add_snapshot(Snapshot::new(tenant, "s1", 4, balance(4)))
        .await
        .unwrap());

    let latest = store.get_snapshot(tenant, "s1", StreamRevision::MAX).await.unwrap();
    assert_eq!(latest.map(|s| s.payload), Some(balance(4)));

    let bounded = store.get_snapshot(tenant, "s1", 3).await.unwrap().unwrap();
    assert_eq!(bounded.stream_revision, 2);
    assert_eq!(bounded.payload, balance(2));

    assert!(store.get_snapshot(tenant, "s1", 1).await.unwrap().is_none());
}

pub async fn test_streams_to_snapshot<S: PersistStreams>(store: &S) {
    let tenant = "test_streams_to_snapshot";
    store
        .commit(make_attempt(tenant, "busy", 1, 10, 10))
        .await
        .unwrap();
    store
        .commit(make_attempt(tenant, "quiet", 1, 2, 2))
        .await
        .unwrap();

    let due = heads(store, tenant, 5).await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].stream_id, "busy");
    assert_eq!(due[0].head_revision, 10);
    assert_eq!(due[0].snapshot_revision, 0);

    store
        .add_snapshot(Snapshot::new(
            tenant,
            "busy",
            8,
            Payload::new("Balance", json!(8)),
        ))
        .await
        .unwrap();
    assert!(heads(store, tenant, 5).await.is_empty());
    assert_eq!(heads(store, tenant, 1).await.len(), 2);
}

// =============================================================================
// Lifecycle tests
// =============================================================================

pub async fn test_delete_stream<S: PersistStreams>(store: &S) {
    let tenant = "test_delete_stream";
    store
        .commit(make_attempt(tenant, "gone", 1, 1, 1))
        .await
        .unwrap();
    store
        .commit(make_attempt(tenant, "kept", 1, 1, 1))
        .await
        .unwrap();
    store
        .add_snapshot(Snapshot::new(
            tenant,
            "gone",
            1,
            Payload::new("Balance", json!(1)),
        ))
        .await
        .unwrap();

    store.delete_stream(tenant, "gone").await.unwrap();

    assert!(read_stream(store, tenant, "gone", 0, StreamRevision::MAX)
        .await
        .is_empty());
    assert!(store
        .get_snapshot(tenant, "gone", StreamRevision::MAX)
        .await
        .unwrap()
        .is_none());
    assert_eq!(read_from(store, tenant, 0).await.len(), 1);

    // a deleted stream starts over
    store
        .commit(make_attempt(tenant, "gone", 1, 1, 1))
        .await
        .expect("recommit after delete");
}

pub async fn test_purge_tenant<S: PersistStreams>(store: &S) {
    let tenant = "test_purge_tenant";
    let other = "test_purge_tenant_other";
    store
        .commit(make_attempt(tenant, "s1", 1, 1, 1))
        .await
        .unwrap();
    store
        .commit(make_attempt(other, "s1", 1, 1, 1))
        .await
        .unwrap();

    store.purge(tenant).await.unwrap();

    assert!(read_from(store, tenant, 0).await.is_empty());
    assert!(heads(store, tenant, 0).await.is_empty());
    assert_eq!(read_from(store, other, 0).await.len(), 1);
}

pub async fn test_purge_all<S: PersistStreams>(store: &S) {
    let tenant = "test_purge_all";
    let before = store
        .commit(make_attempt(tenant, "s1", 1, 1, 1))
        .await
        .unwrap()
        .unwrap();

    store.purge_all().await.unwrap();
    assert!(read_from(store, tenant, 0).await.is_empty());

    let after = store
        .commit(make_attempt(tenant, "s1", 1, 1, 1))
        .await
        .unwrap()
        .unwrap();
    assert!(after.checkpoint_token > before.checkpoint_token);
}

pub async fn test_drop_and_initialize<S: PersistStreams>(store: &S) {
    let tenant = "test_drop_and_initialize";
    store
        .commit(make_attempt(tenant, "s1", 1, 1, 1))
        .await
        .unwrap();

    store.drop_store().await.unwrap();
    store.initialize().await.unwrap();
    store.initialize().await.expect("initialize is idempotent");

    assert!(read_from(store, tenant, 0).await.is_empty());
    store
        .commit(make_attempt(tenant, "s1", 1, 1, 1))
        .await
        .expect("commit after re-initialize");
}

/// Run every contract test against `$store`.
#[macro_export]
macro_rules! run_persistence_tests {
    ($store:expr) => {
        use $crate::persistence::*;

        test_commit_then_read($store).await;
        println!("  test_commit_then_read: PASSED");

        test_empty_attempt_stores_nothing($store).await;
        println!("  test_empty_attempt_stores_nothing: PASSED");

        test_duplicate_commit_returns_existing($store).await;
        println!("  test_duplicate_commit_returns_existing: PASSED");

        test_same_id_on_other_stream_is_allowed($store).await;
        println!("  test_same_id_on_other_stream_is_allowed: PASSED");

        test_occupied_slot_conflicts($store).await;
        println!("  test_occupied_slot_conflicts: PASSED");

        test_gap_is_invalid($store).await;
        println!("  test_gap_is_invalid: PASSED");

        test_checkpoints_increase($store).await;
        println!("  test_checkpoints_increase: PASSED");

        test_get_revision_window($store).await;
        println!("  test_get_revision_window: PASSED");

        test_get_unknown_stream_is_empty($store).await;
        println!("  test_get_unknown_stream_is_empty: PASSED");

        test_get_from_checkpoint($store).await;
        println!("  test_get_from_checkpoint: PASSED");

        test_get_by_time($store).await;
        println!("  test_get_by_time: PASSED");

        test_headers_survive_storage($store).await;
        println!("  test_headers_survive_storage: PASSED");

        test_snapshot_rules($store).await;
        println!("  test_snapshot_rules: PASSED");

        test_streams_to_snapshot($store).await;
        println!("  test_streams_to_snapshot: PASSED");

        test_delete_stream($store).await;
        println!("  test_delete_stream: PASSED");

        test_purge_tenant($store).await;
        println!("  test_purge_tenant: PASSED");

        test_purge_all($store).await;
        println!("  test_purge_all: PASSED");

        test_drop_and_initialize($store).await;
        println!("  test_drop_and_initialize: PASSED");
    };
}
