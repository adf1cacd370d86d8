//! Integration tests for snapshot reads under concurrent writers.
//!
//! Verifies that:
//! - A load never shows half of a commit made under another story
//! - A load that cannot settle fails as a concurrent modification
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p storygraph-graph --features test-utils --test reader_test

#![cfg(feature = "test-utils")]

use storygraph_common::{
    CommitRequest, ErrorKind, ObjectKind, ObjectRef, StateChange, StaticFields,
};
use storygraph_graph::{NarrativeStore, StoryStore};

const ROUNDS: usize = 25;

async fn setup() -> (impl std::any::Any, StoryStore) {
    storygraph_graph::testutil::story_store().await
}

#[tokio::test]
async fn load_never_sees_half_of_a_cross_story_commit() {
    let (_container, store) = setup().await;
    let home = store.world().create_story(Some("home")).await.unwrap();
    let away = store.world().create_story(Some("away")).await.unwrap();
    let sword = ObjectRef::trait_("sword");
    let shield = ObjectRef::trait_("shield");

    for (kind, id) in [(ObjectKind::Trait, "sword"), (ObjectKind::Trait, "shield")] {
        store
            .initialize_object(kind, id, &StaticFields::new(id, ""), &home.id, "v0")
            .await
            .unwrap();
    }
    store.commit(&CommitRequest::new(&home.id, "A", "a")).await.unwrap();

    // Another story moves both objects together in every commit; this never
    // ticks the home story's clock.
    let writer = async {
        for n in 1..=ROUNDS {
            let req = CommitRequest::new(&away.id, format!("away {n}"), "moved")
                .with_change(StateChange::update(sword.clone(), format!("v{n}")))
                .with_change(StateChange::update(shield.clone(), format!("v{n}")));
            store.commit(&req).await.unwrap();
        }
    };

    let reader = async {
        let mut settled = 0;
        for _ in 0..ROUNDS * 2 {
            match store.load(&home.id).await {
                Ok(view) => {
                    assert_eq!(view.current_state_of(&sword), view.current_state_of(&shield));
                    settled += 1;
                }
                Err(e) => assert_eq!(e.kind(), ErrorKind::ConcurrentModification),
            }
            tokio::task::yield_now().await;
        }
        settled
    };

    let ((), settled) = tokio::join!(writer, reader);
    assert!(settled > 0);

    let last = format!("v{ROUNDS}");
    let view = store.load(&home.id).await.unwrap();
    assert_eq!(view.entry_texts(), vec!["A"]);
    assert_eq!(view.current_state_of(&sword), Some(last.as_str()));
    assert_eq!(view.current_state_of(&shield), Some(last.as_str()));
}

#[tokio::test]
async fn load_of_a_quiet_story_is_unaffected_by_other_objects() {
    let (_container, store) = setup().await;
    let home = store.world().create_story(None).await.unwrap();
    let away = store.world().create_story(None).await.unwrap();
    let lamp = ObjectRef::location("lamp");

    store
        .initialize_object(ObjectKind::Trait, "calm", &StaticFields::new("Calm", ""), &home.id, "still")
        .await
        .unwrap();
    store
        .initialize_object(ObjectKind::Location, "lamp", &StaticFields::new("Lamp", ""), &away.id, "off")
        .await
        .unwrap();

    let writer = async {
        for n in 0..ROUNDS {
            let state = if n % 2 == 0 { "on" } else { "off" };
            let req = CommitRequest::new(&away.id, format!("flick {n}"), "flick")
                .with_change(StateChange::update(lamp.clone(), state));
            store.commit(&req).await.unwrap();
        }
    };
    let reader = async {
        for _ in 0..ROUNDS {
            // Objects outside the home story never force a retry.
            let view = store.load(&home.id).await.unwrap();
            assert_eq!(view.state.len(), 1);
            assert_eq!(view.current_state_of(&ObjectRef::trait_("calm")), Some("still"));
            tokio::task::yield_now().await;
        }
    };
    tokio::join!(writer, reader);
}
