//! Integration tests for operations that outlive their time budget.
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p storygraph-graph --features test-utils --test timeout_test

#![cfg(feature = "test-utils")]

use std::time::Duration;

use storygraph_common::{CommitRequest, ErrorKind};
use storygraph_graph::testutil::{connect_client, story_store};
use storygraph_graph::{query, NarrativeStore, StoryStore};

async fn entry_count(store: &StoryStore, story_id: &str) -> i64 {
    let q = query("MATCH (e:Entry {story_id: $story_id}) RETURN count(e) AS n").param("story_id", story_id);
    let mut stream = store.client().inner().execute(q).await.unwrap();
    let row = stream.next().await.unwrap().unwrap();
    row.get::<i64>("n").unwrap()
}

#[tokio::test]
async fn commit_blocked_past_its_timeout_is_store_unavailable() {
    let (container, store) = story_store().await;
    let story = store.world().create_story(None).await.unwrap();
    store.commit(&CommitRequest::new(&story.id, "A", "a")).await.unwrap();

    // Hold the story's write lock in an open transaction.
    let mut blocker = store.client().inner().start_txn().await.unwrap();
    blocker
        .run(query("MATCH (s:Story {id: $id}) SET s.seq = s.seq + 1").param("id", story.id.as_str()))
        .await
        .unwrap();

    let slow = StoryStore::new(connect_client(&container).await.with_op_timeout(Duration::from_millis(500)));
    let err = slow
        .commit(&CommitRequest::new(&story.id, "B", "b"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

    // Closing the slow pool ends its abandoned server-side transaction.
    drop(slow);
    blocker.rollback().await.unwrap();

    // Nothing from the timed-out commit was persisted.
    assert_eq!(entry_count(&store, &story.id).await, 1);
    let view = store.load(&story.id).await.unwrap();
    assert_eq!(view.entry_texts(), vec!["A"]);

    // The store is usable again once the lock is released.
    store.commit(&CommitRequest::new(&story.id, "B", "b")).await.unwrap();
    assert_eq!(store.load(&story.id).await.unwrap().entry_texts(), vec!["A", "B"]);
}
