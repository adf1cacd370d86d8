pub mod client;
pub mod ledger;
pub mod migrate;
pub mod prune;
pub mod reader;
mod rows;
pub mod store;
pub mod timeline;
pub mod world;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::GraphClient;
pub use ledger::ObjectVersionLedger;
pub use prune::PruneEngine;
pub use reader::StoryReader;
pub use store::{NarrativeStore, StoryStore};
pub use timeline::NarrativeTimeline;
pub use world::WorldRegistry;

// Re-export neo4rs query builder for use by dependents.
pub use neo4rs::query;
