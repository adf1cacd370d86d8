use chrono::{DateTime, Utc};
use neo4rs::{query, Row, Txn};
use tracing::info;
use uuid::Uuid;

use storygraph_common::{
    ObjectKind, ObjectRef, StaticFields, StoreResult, Story, StoryGraphError, VersionRecord,
    WorldObject,
};

use crate::client::{fetch_all, fetch_one};
use crate::ledger::{initialize_in, WriteContext};
use crate::rows::{
    datetime_field, field, format_datetime, object_from_row, object_kind_field, opt_string,
    OBJECT_COLUMNS,
};
use crate::GraphClient;

/// Stories and the static side of world objects.
#[derive(Clone)]
pub struct WorldRegistry {
    client: GraphClient,
}

const STORY_COLUMNS: &str = "s.id AS story_id, s.title AS story_title, \
    coalesce(s.seq, 0) AS story_seq, s.created_at AS story_created_at";

impl WorldRegistry {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Start a new story with a fresh id.
    pub async fn create_story(&self, title: Option<&str>) -> StoreResult<Story> {
        self.create_story_with_id(&Uuid::new_v4().to_string(), title).await
    }

    /// Get-or-create a story. An existing story keeps its title.
    pub async fn create_story_with_id(&self, story_id: &str, title: Option<&str>) -> StoreResult<Story> {
        self.client
            .bounded("create_story", async {
                let cypher = format!(
                    "MERGE (s:Story {{id: $id}})
                     ON CREATE SET s.title = $title, s.created_at = datetime($now), s.seq = 0
                     RETURN {STORY_COLUMNS}"
                );
                let q = query(&cypher)
                    .param("id", story_id)
                    .param("title", title.map(str::to_string))
                    .param("now", format_datetime(&Utc::now()));

                let mut txn = self.client.begin().await?;
                let result = match fetch_one(&mut txn, q).await {
                    Ok(Some(row)) => story_from_row(&row),
                    Ok(None) => Err(StoryGraphError::Database(format!("story {story_id} was not created"))),
                    Err(e) => Err(e),
                };
                let story = self.client.finish(txn, result).await?;
                info!(story_id = %story.id, "Story ready");
                Ok(story)
            })
            .await
    }

    pub async fn get_story(&self, story_id: &str) -> StoreResult<Option<Story>> {
        self.client
            .bounded("get_story", async {
                let cypher = format!("MATCH (s:Story {{id: $id}}) RETURN {STORY_COLUMNS}");
                let mut txn = self.client.begin().await?;
                let result = match fetch_one(&mut txn, query(&cypher).param("id", story_id)).await {
                    Ok(Some(row)) => story_from_row(&row).map(Some),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                };
                self.client.finish(txn, result).await
            })
            .await
    }

    pub async fn list_stories(&self) -> StoreResult<Vec<Story>> {
        self.client
            .bounded("list_stories", async {
                let cypher = format!("MATCH (s:Story) RETURN {STORY_COLUMNS} ORDER BY s.created_at");
                let mut txn = self.client.begin().await?;
                let result = match fetch_all(&mut txn, query(&cypher)).await {
                    Ok(rows) => rows.iter().map(story_from_row).collect(),
                    Err(e) => Err(e),
                };
                self.client.finish(txn, result).await
            })
            .await
    }

    /// Create the object if absent. An existing object's static fields are never overwritten.
    pub async fn upsert_object(&self, object: &ObjectRef, fields: &StaticFields) -> StoreResult<WorldObject> {
        self.client
            .bounded("upsert_object", async {
                let mut txn = self.client.begin().await?;
                let result = upsert_object_in(&mut txn, object, fields, Utc::now()).await;
                self.client.finish(txn, result).await
            })
            .await
    }

    pub async fn get_object(&self, object: &ObjectRef) -> StoreResult<Option<WorldObject>> {
        self.client
            .bounded("get_object", async {
                let cypher = format!(
                    "MATCH (o:{label} {{id: $id}}) RETURN {OBJECT_COLUMNS}",
                    label = object.kind.label()
                );
                let mut txn = self.client.begin().await?;
                let result = match fetch_one(&mut txn, query(&cypher).param("id", object.id.as_str())).await {
                    Ok(Some(row)) => object_from_row(&row, object.kind).map(Some),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                };
                self.client.finish(txn, result).await
            })
            .await
    }

    /// Upsert the object and give it its first version, in one transaction.
    pub async fn initialize_object(
        &self,
        object: &ObjectRef,
        fields: &StaticFields,
        story_id: &str,
        initial_state: &str,
    ) -> StoreResult<VersionRecord> {
        self.client
            .bounded("initialize_object", async {
                let mut txn = self.client.begin().await?;
                let result =
                    initialize_object_in(&mut txn, object, fields, story_id, initial_state).await;
                self.client.finish(txn, result).await
            })
            .await
    }

    /// Every object that has been versioned under `story_id`, with its static fields.
    pub async fn world_map(&self, story_id: &str) -> StoreResult<Vec<WorldObject>> {
        self.client
            .bounded("world_map", async {
                let q = query(
                    "MATCH (h:History {story_id: $story_id})
                     WITH DISTINCT h.object_kind AS kind, h.object_id AS object_id
                     RETURN kind, object_id
                     ORDER BY kind, object_id",
                )
                .param("story_id", story_id);

                let mut txn = self.client.begin().await?;
                let result = world_map_in(&mut txn, q).await;
                self.client.finish(txn, result).await
            })
            .await
    }
}

async fn initialize_object_in(
    txn: &mut Txn,
    object: &ObjectRef,
    fields: &StaticFields,
    story_id: &str,
    initial_state: &str,
) -> StoreResult<VersionRecord> {
    let now = Utc::now();
    let seq = tick_story(txn, story_id, now).await?;
    upsert_object_in(txn, object, fields, now).await?;
    let ctx = WriteContext {
        story_id,
        seq,
        entry_id: None,
        now,
    };
    initialize_in(txn, &ctx, 0, object, initial_state).await
}

async fn world_map_in(txn: &mut Txn, q: neo4rs::Query) -> StoreResult<Vec<WorldObject>> {
    let mut objects = Vec::new();
    for row in fetch_all(txn, q).await? {
        let kind: ObjectKind = object_kind_field(&row, "kind")?;
        let object = ObjectRef::new(kind, field::<String>(&row, "object_id")?);
        let cypher = format!(
            "MATCH (o:{label} {{id: $id}}) RETURN {OBJECT_COLUMNS}",
            label = kind.label()
        );
        if let Some(row) = fetch_one(txn, query(&cypher).param("id", object.id.as_str())).await? {
            objects.push(object_from_row(&row, kind)?);
        }
    }
    Ok(objects)
}

pub(crate) async fn upsert_object_in(
    txn: &mut Txn,
    object: &ObjectRef,
    fields: &StaticFields,
    now: DateTime<Utc>,
) -> StoreResult<WorldObject> {
    // MERGE on a uniquely-constrained id is an atomic get-or-create.
    let cypher = format!(
        "MERGE (o:{label} {{id: $id}})
         ON CREATE SET o.{title_field} = $title,
                       o.description = $description,
                       o.created_at = datetime($now)
         RETURN {OBJECT_COLUMNS}",
        label = object.kind.label(),
        title_field = object.kind.title_field(),
    );
    let q = query(&cypher)
        .param("id", object.id.as_str())
        .param("title", fields.title.as_str())
        .param("description", fields.description.as_str())
        .param("now", format_datetime(&now));

    let row = fetch_one(txn, q)
        .await?
        .ok_or_else(|| StoryGraphError::ObjectNotFound(object.clone()))?;
    object_from_row(&row, object.kind)
}

/// Advance the story clock, creating the story on first use, and return the
/// new value. The write holds the story's lock until the transaction ends,
/// which serializes mutations per story.
pub(crate) async fn tick_story(txn: &mut Txn, story_id: &str, now: DateTime<Utc>) -> StoreResult<i64> {
    let q = query(
        "MERGE (s:Story {id: $story_id})
         ON CREATE SET s.created_at = datetime($now), s.seq = 0
         SET s.seq = coalesce(s.seq, 0) + 1
         RETURN s.seq AS seq",
    )
    .param("story_id", story_id)
    .param("now", format_datetime(&now));

    let row = fetch_one(txn, q)
        .await?
        .ok_or_else(|| StoryGraphError::Database(format!("story clock for {story_id} unavailable")))?;
    field(&row, "seq")
}

/// Read the story clock without locking. `None` when the story has never been written.
pub(crate) async fn story_clock(txn: &mut Txn, story_id: &str) -> StoreResult<Option<i64>> {
    let q = query("MATCH (s:Story {id: $story_id}) RETURN s.seq AS seq").param("story_id", story_id);
    Ok(fetch_one(txn, q)
        .await?
        .and_then(|row| row.get::<Option<i64>>("seq").ok().flatten()))
}

fn story_from_row(row: &Row) -> StoreResult<Story> {
    Ok(Story {
        id: field(row, "story_id")?,
        title: opt_string(row, "story_title"),
        seq: field(row, "story_seq")?,
        created_at: datetime_field(row, "story_created_at"),
    })
}
