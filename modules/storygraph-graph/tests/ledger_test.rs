//! Integration tests for object versioning.
//!
//! Verifies that:
//! - N updates after initialization leave N+1 records with exactly one current
//! - Updating a never-initialized object fails and writes nothing
//! - Double initialization is rejected
//! - Object static fields are first-writer-wins
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p storygraph-graph --features test-utils --test ledger_test

#![cfg(feature = "test-utils")]

use storygraph_common::{ErrorKind, ObjectKind, ObjectRef, StaticFields};
use storygraph_graph::{NarrativeStore, StoryStore};

async fn setup() -> (impl std::any::Any, StoryStore) {
    storygraph_graph::testutil::story_store().await
}

#[tokio::test]
async fn updates_retain_every_version_with_one_current() {
    let (_container, store) = setup().await;
    let story = store.world().create_story(Some("ledger")).await.unwrap();
    let brave = ObjectRef::trait_("brave");

    store
        .initialize_object(
            ObjectKind::Trait,
            "brave",
            &StaticFields::new("Brave", "Does not flinch"),
            &story.id,
            "v0",
        )
        .await
        .unwrap();

    for n in 1..=4 {
        store
            .ledger()
            .apply_update(&brave, &story.id, &format!("v{n}"))
            .await
            .unwrap();
    }

    let current = store.ledger().current_state(&brave).await.unwrap().unwrap();
    assert_eq!(current.state, "v4");

    let history = store.ledger().history(&brave).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);

    let states: Vec<&str> = history.iter().map(|v| v.state.as_str()).collect();
    assert_eq!(states, vec!["v0", "v1", "v2", "v3", "v4"]);

    // Each record points back at the one it replaced.
    for pair in history.windows(2) {
        assert_eq!(pair[1].supersedes, Some(pair[0].id));
    }
    assert_eq!(history[0].supersedes, None);
}

#[tokio::test]
async fn update_before_initialize_fails_and_writes_nothing() {
    let (_container, store) = setup().await;
    let story = store.world().create_story(None).await.unwrap();
    let ghost = ObjectRef::character("ghost");

    store
        .world()
        .upsert_object(&ghost, &StaticFields::new("Ghost", "Never versioned"))
        .await
        .unwrap();

    let err = store
        .ledger()
        .apply_update(&ghost, &story.id, "haunting")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotInitialized);

    assert!(store.ledger().history(&ghost).await.unwrap().is_empty());
    assert!(store.ledger().current_state(&ghost).await.unwrap().is_none());

    // Same answer when the object node does not exist at all.
    let err = store
        .ledger()
        .apply_update(&ObjectRef::location("nowhere"), &story.id, "x")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotInitialized);
}

#[tokio::test]
async fn double_initialize_is_rejected() {
    let (_container, store) = setup().await;
    let story = store.world().create_story(None).await.unwrap();
    let tavern = ObjectRef::location("tavern");
    let fields = StaticFields::new("The Tavern", "Smoky and loud");

    store
        .world()
        .initialize_object(&tavern, &fields, &story.id, "open")
        .await
        .unwrap();

    let err = store
        .world()
        .initialize_object(&tavern, &fields, &story.id, "closed")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyVersioned);

    let current = store.ledger().current_state(&tavern).await.unwrap().unwrap();
    assert_eq!(current.state, "open");
    assert_eq!(store.ledger().history(&tavern).await.unwrap().len(), 1);
}

#[tokio::test]
async fn initialize_without_object_node_is_object_not_found() {
    let (_container, store) = setup().await;
    let story = store.world().create_story(None).await.unwrap();

    let err = store
        .ledger()
        .initialize(&ObjectRef::trait_("unknown"), &story.id, "v1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
}

#[tokio::test]
async fn static_fields_are_first_writer_wins() {
    let (_container, store) = setup().await;
    let hero = ObjectRef::character("hero");

    let first = store
        .world()
        .upsert_object(&hero, &StaticFields::new("Aria", "A wandering bard"))
        .await
        .unwrap();
    let second = store
        .world()
        .upsert_object(&hero, &StaticFields::new("Impostor", "Should not stick"))
        .await
        .unwrap();

    assert_eq!(first.title, "Aria");
    assert_eq!(second.title, "Aria");
    assert_eq!(second.description, "A wandering bard");

    let stored = store.world().get_object(&hero).await.unwrap().unwrap();
    assert_eq!(stored.title, "Aria");
}

#[tokio::test]
async fn world_map_lists_objects_versioned_in_story() {
    let (_container, store) = setup().await;
    let story = store.world().create_story(None).await.unwrap();
    let other = store.world().create_story(None).await.unwrap();

    store
        .initialize_object(ObjectKind::Trait, "brave", &StaticFields::new("Brave", ""), &story.id, "v1")
        .await
        .unwrap();
    store
        .initialize_object(ObjectKind::Location, "keep", &StaticFields::new("Keep", ""), &story.id, "intact")
        .await
        .unwrap();
    store
        .initialize_object(ObjectKind::Character, "elsewhere", &StaticFields::new("Else", ""), &other.id, "idle")
        .await
        .unwrap();

    let map = store.world().world_map(&story.id).await.unwrap();
    let ids: Vec<&str> = map.iter().map(|o| o.object.id.as_str()).collect();
    assert_eq!(map.len(), 2);
    assert!(ids.contains(&"brave"));
    assert!(ids.contains(&"keep"));
}
