use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use neo4rs::{query, Txn};
use tracing::{debug, info, warn};
use uuid::Uuid;

use storygraph_common::{
    BranchEdge, ChangeMode, CommitRequest, Entry, ObjectRef, StoreResult, StoryGraphError,
    BRANCH_PLACEHOLDER_TEXT,
};

use crate::client::{fetch_all, fetch_one};
use crate::ledger::{apply_update_in, initialize_in, lock_object, WriteContext};
use crate::rows::{
    branch_from_row, entry_from_row, field, format_datetime, BRANCH_COLUMNS, ENTRY_COLUMNS,
};
use crate::world::tick_story;
use crate::GraphClient;

/// The root of a story's main chain: an entry of the story that nothing
/// points at with NEXT and that was not created by a branch.
pub(crate) const MAIN_ROOT_MATCH: &str = "MATCH (root:Entry {story_id: $story_id})
     WHERE coalesce(root.branch_root, false) = false
       AND NOT EXISTS { MATCH (:Entry)-[:NEXT]->(root) }";

/// Appends narrative steps and forks timelines.
#[derive(Clone)]
pub struct NarrativeTimeline {
    client: GraphClient,
}

impl NarrativeTimeline {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Append an entry with its summary and apply its state changes, all or nothing.
    /// Returns the new entry's id.
    pub async fn commit(&self, request: &CommitRequest) -> StoreResult<Uuid> {
        self.client
            .bounded("commit", async {
                let mut txn = self.client.begin().await?;
                let result = commit_in(&mut txn, request, Utc::now()).await;
                let entry = self.client.finish(txn, result).await?;
                info!(
                    story_id = %request.story_id,
                    entry_id = %entry.id,
                    seq = entry.seq,
                    versions = request.state_changes.len(),
                    "Entry committed"
                );
                Ok(entry.id)
            })
            .await
    }

    /// Fork a new, detached chain from `from_entry_id`. Returns the placeholder root's id.
    pub async fn branch(
        &self,
        from_entry_id: Uuid,
        title: Option<&str>,
        branch_id: Option<&str>,
    ) -> StoreResult<Uuid> {
        self.client
            .bounded("branch", async {
                let mut txn = self.client.begin().await?;
                let result = branch_in(&mut txn, from_entry_id, title, branch_id, Utc::now()).await;
                let root = self.client.finish(txn, result).await?;
                info!(
                    story_id = %root.story_id,
                    from_entry_id = %from_entry_id,
                    branch_root = %root.id,
                    branch_id = branch_id.unwrap_or(""),
                    "Branch created"
                );
                Ok(root.id)
            })
            .await
    }

    /// Head of the story's main chain, or `None` if nothing was committed yet.
    pub async fn head_of(&self, story_id: &str) -> StoreResult<Option<Entry>> {
        self.client
            .bounded("head_of", async {
                let mut txn = self.client.begin().await?;
                let result = main_head_in(&mut txn, story_id).await;
                self.client.finish(txn, result).await
            })
            .await
    }

    /// Head of the chain that starts at (or passes through) `entry_id`.
    pub async fn head_after(&self, entry_id: Uuid) -> StoreResult<Entry> {
        self.client
            .bounded("head_after", async {
                let mut txn = self.client.begin().await?;
                let result = chain_head_in(&mut txn, entry_id).await;
                self.client.finish(txn, result).await
            })
            .await
    }

    pub async fn branches_from(&self, entry_id: Uuid) -> StoreResult<Vec<BranchEdge>> {
        self.client
            .bounded("branches_from", async {
                let cypher = format!(
                    "MATCH (src:Entry {{id: $id}})-[b:BRANCH]->(dst:Entry)
                     RETURN {BRANCH_COLUMNS}
                     ORDER BY dst.seq"
                );
                let mut txn = self.client.begin().await?;
                let result = match fetch_all(&mut txn, query(&cypher).param("id", entry_id.to_string())).await {
                    Ok(rows) => rows.iter().map(branch_from_row).collect(),
                    Err(e) => Err(e),
                };
                self.client.finish(txn, result).await
            })
            .await
    }
}

pub(crate) async fn commit_in(
    txn: &mut Txn,
    request: &CommitRequest,
    now: DateTime<Utc>,
) -> StoreResult<Entry> {
    let story_id = request.story_id.as_str();
    let seq = tick_story(txn, story_id, now).await?;

    let head = match request.expected_head {
        Some(expected) => Some(expected_head_in(txn, story_id, expected).await?),
        None => main_head_in(txn, story_id).await?,
    };
    debug!(story_id, head = ?head.as_ref().map(|h| h.id), "Resolved commit head");

    // Lock every touched object up front in a fixed order so two commits
    // touching the same objects cannot deadlock on each other.
    let touched: BTreeSet<&ObjectRef> = request.state_changes.iter().map(|c| &c.object).collect();
    for object in touched {
        lock_object(txn, object, now).await?;
    }

    let entry = create_entry(txn, request, seq, head.as_ref().map(|h| h.id), now).await?;

    let ctx = WriteContext {
        story_id,
        seq,
        entry_id: Some(entry.id),
        now,
    };
    for (step, change) in request.state_changes.iter().enumerate() {
        let step = step as i64;
        match change.mode {
            ChangeMode::Initialize => {
                initialize_in(txn, &ctx, step, &change.object, &change.new_state).await?
            }
            ChangeMode::Update => {
                apply_update_in(txn, &ctx, step, &change.object, &change.new_state).await?
            }
        };
    }

    Ok(entry)
}

async fn create_entry(
    txn: &mut Txn,
    request: &CommitRequest,
    seq: i64,
    head_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> StoreResult<Entry> {
    let cypher = format!(
        "CREATE (e:Entry {{id: $id, story_id: $story_id, text: $text, seq: $seq, created_at: datetime($now)}})
         CREATE (s:Summary {{story_id: $story_id, text: $summary, created_at: datetime($now)}})
         CREATE (e)-[:NEXT]->(s)
         WITH e
         OPTIONAL MATCH (head:Entry {{id: $head_id}})
         FOREACH (h IN CASE WHEN head IS NULL THEN [] ELSE [head] END | CREATE (h)-[:NEXT]->(e))
         RETURN {ENTRY_COLUMNS}"
    );
    let q = query(&cypher)
        .param("id", Uuid::new_v4().to_string())
        .param("story_id", request.story_id.as_str())
        .param("text", request.text.as_str())
        .param("summary", request.summary.as_str())
        .param("seq", seq)
        .param("now", format_datetime(&now))
        .param("head_id", head_id.map(|id| id.to_string()));

    let row = fetch_one(txn, q)
        .await?
        .ok_or_else(|| StoryGraphError::Database("entry was not created".to_string()))?;
    entry_from_row(&row)
}

/// Validate a caller-supplied head: it must exist in the story and still be a chain end.
async fn expected_head_in(txn: &mut Txn, story_id: &str, expected: Uuid) -> StoreResult<Entry> {
    let cypher = format!(
        "MATCH (e:Entry {{id: $id}})
         RETURN {ENTRY_COLUMNS}, EXISTS {{ MATCH (e)-[:NEXT]->(:Entry) }} AS has_successor"
    );
    let row = fetch_one(txn, query(&cypher).param("id", expected.to_string()))
        .await?
        .ok_or(StoryGraphError::EntryNotFound(expected))?;

    let entry = entry_from_row(&row)?;
    // An entry from another story is as good as missing for this one.
    if entry.story_id != story_id {
        return Err(StoryGraphError::EntryNotFound(expected));
    }
    if field::<bool>(&row, "has_successor")? {
        return Err(StoryGraphError::ConcurrentModification(format!(
            "entry {expected} is no longer the head of its chain"
        )));
    }
    Ok(entry)
}

pub(crate) async fn main_head_in(txn: &mut Txn, story_id: &str) -> StoreResult<Option<Entry>> {
    let cypher = format!(
        "{MAIN_ROOT_MATCH}
         MATCH (root)-[:NEXT*0..]->(e:Entry)
         WHERE NOT EXISTS {{ MATCH (e)-[:NEXT]->(:Entry) }}
         RETURN {ENTRY_COLUMNS}
         ORDER BY e.seq DESC"
    );
    let rows = fetch_all(txn, query(&cypher).param("story_id", story_id)).await?;
    if rows.len() > 1 {
        warn!(story_id, heads = rows.len(), "Story has more than one main chain head");
    }
    match rows.first() {
        Some(row) => Ok(Some(entry_from_row(row)?)),
        None => Ok(None),
    }
}

async fn chain_head_in(txn: &mut Txn, entry_id: Uuid) -> StoreResult<Entry> {
    let cypher = format!(
        "MATCH (start:Entry {{id: $id}})
         MATCH (start)-[:NEXT*0..]->(e:Entry)
         WHERE NOT EXISTS {{ MATCH (e)-[:NEXT]->(:Entry) }}
         RETURN {ENTRY_COLUMNS}
         ORDER BY e.seq DESC"
    );
    let row = fetch_one(txn, query(&cypher).param("id", entry_id.to_string()))
        .await?
        .ok_or(StoryGraphError::EntryNotFound(entry_id))?;
    entry_from_row(&row)
}

pub(crate) async fn branch_in(
    txn: &mut Txn,
    from_entry_id: Uuid,
    title: Option<&str>,
    branch_id: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<Entry> {
    let from = from_entry_id.to_string();

    let story_id: String = {
        let row = fetch_one(
            txn,
            query("MATCH (src:Entry {id: $id}) RETURN src.story_id AS story_id").param("id", from.as_str()),
        )
        .await?
        .ok_or(StoryGraphError::EntryNotFound(from_entry_id))?;
        field(&row, "story_id")?
    };
    let seq = tick_story(txn, &story_id, now).await?;

    let cypher = format!(
        "MATCH (src:Entry {{id: $from_id}})
         CREATE (e:Entry {{
             id: $id,
             story_id: src.story_id,
             text: $text,
             seq: $seq,
             created_at: datetime($now),
             branch_root: true
         }})
         CREATE (src)-[:BRANCH {{title: $title, id: $branch_id}}]->(e)
         RETURN {ENTRY_COLUMNS}"
    );
    let q = query(&cypher)
        .param("from_id", from.as_str())
        .param("id", Uuid::new_v4().to_string())
        .param("text", BRANCH_PLACEHOLDER_TEXT)
        .param("seq", seq)
        .param("now", format_datetime(&now))
        .param("title", title.map(str::to_string))
        .param("branch_id", branch_id.map(str::to_string));

    // The source can vanish between the lookup and the lock if a prune won the race.
    let row = fetch_one(txn, q)
        .await?
        .ok_or(StoryGraphError::EntryNotFound(from_entry_id))?;
    entry_from_row(&row)
}
