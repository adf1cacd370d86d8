//! Integration tests for schema setup.
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p storygraph-graph --features test-utils --test schema_test

#![cfg(feature = "test-utils")]

use storygraph_graph::{migrate, GraphClient};

async fn setup() -> (impl std::any::Any, GraphClient) {
    storygraph_graph::testutil::neo4j_container().await
}

#[tokio::test]
async fn migrate_twice_is_a_no_op() {
    let (_container, client) = setup().await;

    migrate::migrate(&client).await.unwrap();
    let first = migrate::constraint_names(&client).await.unwrap();

    migrate::migrate(&client).await.unwrap();
    let second = migrate::constraint_names(&client).await.unwrap();

    assert_eq!(first, second);
    for name in [
        "story_id_unique",
        "entry_id_unique",
        "history_id_unique",
        "trait_id_unique",
        "character_id_unique",
        "location_id_unique",
    ] {
        assert!(first.iter().any(|n| n == name), "missing constraint {name}");
    }
}

#[tokio::test]
async fn ping_reaches_the_store() {
    let (_container, client) = setup().await;
    client.ping().await.unwrap();
}
