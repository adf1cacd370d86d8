use neo4rs::query;
use tracing::{info, warn};

use storygraph_common::{StoreResult, StoryGraphError};

use crate::GraphClient;

/// Uniqueness constraints. Per-label `id` uniqueness on the world object
/// labels is `(kind, id)` uniqueness.
const CONSTRAINTS: [&str; 6] = [
    "CREATE CONSTRAINT story_id_unique IF NOT EXISTS FOR (s:Story) REQUIRE s.id IS UNIQUE",
    "CREATE CONSTRAINT entry_id_unique IF NOT EXISTS FOR (e:Entry) REQUIRE e.id IS UNIQUE",
    "CREATE CONSTRAINT history_id_unique IF NOT EXISTS FOR (h:History) REQUIRE h.id IS UNIQUE",
    "CREATE CONSTRAINT trait_id_unique IF NOT EXISTS FOR (t:Trait) REQUIRE t.id IS UNIQUE",
    "CREATE CONSTRAINT character_id_unique IF NOT EXISTS FOR (c:Character) REQUIRE c.id IS UNIQUE",
    "CREATE CONSTRAINT location_id_unique IF NOT EXISTS FOR (l:Location) REQUIRE l.id IS UNIQUE",
];

const INDEXES: [&str; 3] = [
    "CREATE INDEX entry_story_id IF NOT EXISTS FOR (e:Entry) ON (e.story_id)",
    "CREATE INDEX history_story_id IF NOT EXISTS FOR (h:History) ON (h.story_id)",
    "CREATE INDEX history_object IF NOT EXISTS FOR (h:History) ON (h.object_kind, h.object_id)",
];

/// Run idempotent schema migrations: constraints, indexes.
pub async fn migrate(client: &GraphClient) -> StoreResult<()> {
    let g = &client.graph;

    info!("Running schema migrations...");

    for c in &CONSTRAINTS {
        run_ignoring_exists(g, c).await?;
    }
    info!("Uniqueness constraints created");

    for idx in &INDEXES {
        run_ignoring_exists(g, idx).await?;
    }
    info!("Indexes created");

    info!("Schema migration complete");
    Ok(())
}

/// Names of the constraints currently defined, sorted.
pub async fn constraint_names(client: &GraphClient) -> StoreResult<Vec<String>> {
    let mut stream = client
        .graph
        .execute(query("SHOW CONSTRAINTS YIELD name RETURN name ORDER BY name"))
        .await
        .map_err(schema_err)?;

    let mut names = Vec::new();
    while let Some(row) = stream.next().await.map_err(schema_err)? {
        if let Ok(name) = row.get::<String>("name") {
            names.push(name);
        }
    }
    Ok(names)
}

/// Run a Cypher statement, ignoring errors that indicate the constraint/index already exists.
async fn run_ignoring_exists(g: &neo4rs::Graph, cypher: &str) -> StoreResult<()> {
    match g.run(query(cypher)).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("already exists") || msg.contains("equivalent") {
                warn!("Already exists (skipped): {}", cypher.chars().take(80).collect::<String>());
                Ok(())
            } else {
                Err(schema_err(e))
            }
        }
    }
}

fn schema_err(e: neo4rs::Error) -> StoryGraphError {
    StoryGraphError::Schema(e.to_string())
}
