use std::collections::{HashMap, HashSet};

use neo4rs::{query, Txn};
use tracing::{debug, warn};
use uuid::Uuid;

use storygraph_common::{
    BranchEdge, EntryView, ObjectRef, ObjectState, StoreResult, StoryGraphError, StoryView, Summary,
};

use crate::client::{fetch_all, fetch_one};
use crate::rows::{
    branch_from_row, entry_from_row, field, object_from_row, object_kind_field, opt_string,
    version_from_row, BRANCH_COLUMNS, ENTRY_COLUMNS, OBJECT_COLUMNS, VERSION_COLUMNS,
};
use crate::timeline::MAIN_ROOT_MATCH;
use crate::world::story_clock;
use crate::GraphClient;

/// A read is retried this many times when a writer moves the story clock, or
/// the version clock of an object in the view, under it.
pub const MAX_SNAPSHOT_ATTEMPTS: usize = 3;

/// Read-only snapshots of a story: ordered entries plus current world state.
#[derive(Clone)]
pub struct StoryReader {
    client: GraphClient,
}

/// Where a chain walk starts.
#[derive(Debug, Clone, Copy)]
enum ChainStart<'a> {
    MainRoot(&'a str),
    Entry(Uuid),
}

impl StoryReader {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// The story's main chain, root to head, and the current state of every
    /// object versioned under the story. Branch chains are listed on the entry
    /// they fork from, never walked. An unknown story loads as empty.
    pub async fn load(&self, story_id: &str) -> StoreResult<StoryView> {
        self.client
            .bounded("load", self.snapshot(story_id, ChainStart::MainRoot(story_id)))
            .await
    }

    /// Same shape as `load`, walking the chain that starts at `root_entry_id`.
    /// Use with a branch root to read a forked timeline.
    pub async fn load_chain(&self, root_entry_id: Uuid) -> StoreResult<StoryView> {
        self.client
            .bounded("load_chain", async {
                let story_id = {
                    let mut txn = self.client.begin().await?;
                    let result = entry_story_in(&mut txn, root_entry_id).await;
                    self.client.finish(txn, result).await?
                };
                self.snapshot(&story_id, ChainStart::Entry(root_entry_id)).await
            })
            .await
    }

    async fn snapshot(&self, story_id: &str, start: ChainStart<'_>) -> StoreResult<StoryView> {
        for attempt in 1..=MAX_SNAPSHOT_ATTEMPTS {
            let mut txn = self.client.begin().await?;
            let result = read_view_in(&mut txn, story_id, start).await;
            let read = self.client.finish(txn, result).await?;
            if read.is_stable() {
                return Ok(read.view);
            }
            debug!(
                story_id,
                attempt,
                before = ?read.story_clock.0,
                after = ?read.story_clock.1,
                "Story changed during read, retrying"
            );
        }
        warn!(story_id, attempts = MAX_SNAPSHOT_ATTEMPTS, "Could not read a stable snapshot");
        Err(StoryGraphError::ConcurrentModification(format!(
            "story {story_id} kept changing during {MAX_SNAPSHOT_ATTEMPTS} read attempts"
        )))
    }
}

/// A view plus the clocks observed around it. Versions of objects shared with
/// other stories move without touching this story's clock, so each object's
/// `version_clock` is checked too.
struct ViewRead {
    view: StoryView,
    story_clock: (Option<i64>, Option<i64>),
    object_clocks: Vec<(i64, i64)>,
}

impl ViewRead {
    fn is_stable(&self) -> bool {
        self.story_clock.0 == self.story_clock.1 && self.object_clocks.iter().all(|(seen, now)| seen == now)
    }
}

async fn read_view_in(txn: &mut Txn, story_id: &str, start: ChainStart<'_>) -> StoreResult<ViewRead> {
    let before = story_clock(txn, story_id).await?;
    let entries = match start {
        ChainStart::MainRoot(story_id) => main_chain_in(txn, story_id).await?,
        ChainStart::Entry(root) => {
            let entries = chain_from_in(txn, root).await?;
            if entries.is_empty() {
                return Err(StoryGraphError::EntryNotFound(root));
            }
            entries
        }
    };
    let (state, seen) = story_state_in(txn, story_id).await?;
    let after = story_clock(txn, story_id).await?;

    let mut object_clocks = Vec::with_capacity(seen.len());
    for (object, clock) in &seen {
        object_clocks.push((*clock, object_clock(txn, object).await?));
    }

    Ok(ViewRead {
        view: StoryView {
            story_id: story_id.to_string(),
            entries,
            state,
        },
        story_clock: (before, after),
        object_clocks,
    })
}

async fn entry_story_in(txn: &mut Txn, entry_id: Uuid) -> StoreResult<String> {
    let q = query("MATCH (e:Entry {id: $id}) RETURN e.story_id AS story_id").param("id", entry_id.to_string());
    let row = fetch_one(txn, q).await?.ok_or(StoryGraphError::EntryNotFound(entry_id))?;
    field(&row, "story_id")
}

async fn main_chain_in(txn: &mut Txn, story_id: &str) -> StoreResult<Vec<EntryView>> {
    let cypher = format!(
        "{MAIN_ROOT_MATCH}
         WITH root ORDER BY root.seq LIMIT 1
         MATCH path = (root)-[:NEXT*0..]->(e:Entry)
         OPTIONAL MATCH (e)-[:NEXT]->(s:Summary)
         RETURN {ENTRY_COLUMNS}, s.text AS summary_text, length(path) AS depth
         ORDER BY depth, e.seq"
    );
    let rows = fetch_all(txn, query(&cypher).param("story_id", story_id)).await?;
    chain_views(txn, rows).await
}

async fn chain_from_in(txn: &mut Txn, root: Uuid) -> StoreResult<Vec<EntryView>> {
    let cypher = format!(
        "MATCH (root:Entry {{id: $id}})
         MATCH path = (root)-[:NEXT*0..]->(e:Entry)
         OPTIONAL MATCH (e)-[:NEXT]->(s:Summary)
         RETURN {ENTRY_COLUMNS}, s.text AS summary_text, length(path) AS depth
         ORDER BY depth, e.seq"
    );
    let rows = fetch_all(txn, query(&cypher).param("id", root.to_string())).await?;
    chain_views(txn, rows).await
}

/// Decode chain rows in walk order and attach each entry's outgoing branch edges.
async fn chain_views(txn: &mut Txn, rows: Vec<neo4rs::Row>) -> StoreResult<Vec<EntryView>> {
    let mut seen = HashSet::new();
    let mut views = Vec::with_capacity(rows.len());
    for row in &rows {
        let entry = entry_from_row(row)?;
        if !seen.insert(entry.id) {
            continue;
        }
        views.push(EntryView {
            entry,
            summary: opt_string(row, "summary_text").map(|text| Summary { text }),
            branches: Vec::new(),
        });
    }

    let ids: Vec<String> = views.iter().map(|v| v.entry.id.to_string()).collect();
    let mut branches = branches_in(txn, ids).await?;
    for view in &mut views {
        if let Some(edges) = branches.remove(&view.entry.id) {
            view.branches = edges;
        }
    }
    Ok(views)
}

async fn branches_in(txn: &mut Txn, entry_ids: Vec<String>) -> StoreResult<HashMap<Uuid, Vec<BranchEdge>>> {
    if entry_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let cypher = format!(
        "MATCH (src:Entry)-[b:BRANCH]->(dst:Entry)
         WHERE src.id IN $ids
         RETURN {BRANCH_COLUMNS}
         ORDER BY dst.seq"
    );
    let mut by_source: HashMap<Uuid, Vec<BranchEdge>> = HashMap::new();
    for row in fetch_all(txn, query(&cypher).param("ids", entry_ids)).await? {
        let edge = branch_from_row(&row)?;
        by_source.entry(edge.from).or_default().push(edge);
    }
    Ok(by_source)
}

/// Current version of every object that has a version attributed to the story,
/// with the object's version clock as read alongside it.
async fn story_state_in(txn: &mut Txn, story_id: &str) -> StoreResult<(Vec<ObjectState>, Vec<(ObjectRef, i64)>)> {
    let q = query(
        "MATCH (h:History {story_id: $story_id})
         WITH DISTINCT h.object_kind AS kind, h.object_id AS object_id
         RETURN kind, object_id
         ORDER BY kind, object_id",
    )
    .param("story_id", story_id);

    let mut state = Vec::new();
    let mut clocks = Vec::new();
    for row in fetch_all(txn, q).await? {
        let object = ObjectRef::new(object_kind_field(&row, "kind")?, field::<String>(&row, "object_id")?);
        let cypher = format!(
            "MATCH (o:{label} {{id: $object_id}})
             OPTIONAL MATCH (h:History)-[:CURRENT]->(o)
             RETURN {VERSION_COLUMNS}, {OBJECT_COLUMNS}, h IS NOT NULL AS has_current,
                    coalesce(o.version_clock, 0) AS object_clock",
            label = object.kind.label()
        );
        let Some(row) = fetch_one(txn, query(&cypher).param("object_id", object.id.as_str())).await? else {
            continue;
        };
        clocks.push((object.clone(), field::<i64>(&row, "object_clock")?));
        // An object whose versions were all pruned has no CURRENT and drops out.
        if field::<bool>(&row, "has_current")? {
            state.push(ObjectState {
                object: object_from_row(&row, object.kind)?,
                current: version_from_row(&row)?,
            });
        }
    }
    Ok((state, clocks))
}

async fn object_clock(txn: &mut Txn, object: &ObjectRef) -> StoreResult<i64> {
    let cypher = format!(
        "MATCH (o:{label} {{id: $object_id}}) RETURN coalesce(o.version_clock, 0) AS object_clock",
        label = object.kind.label()
    );
    match fetch_one(txn, query(&cypher).param("object_id", object.id.as_str())).await? {
        Some(row) => field(&row, "object_clock"),
        None => Ok(-1),
    }
}
