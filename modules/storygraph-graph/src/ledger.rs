use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use neo4rs::{query, Txn};
use tracing::{info, warn};
use uuid::Uuid;

use storygraph_common::{ObjectRef, StoreResult, StoryGraphError, VersionRecord};

use crate::client::{fetch_all, fetch_one};
use crate::rows::{format_datetime, opt_string, version_from_row, VERSION_COLUMNS};
use crate::world::tick_story;
use crate::GraphClient;

/// Owns the CURRENT pointer of each world object and its retained history.
#[derive(Clone)]
pub struct ObjectVersionLedger {
    client: GraphClient,
}

/// Where a version write happens: the story it is attributed to, the story
/// clock of the enclosing transaction and, inside a commit, the new entry.
#[derive(Debug, Clone)]
pub(crate) struct WriteContext<'a> {
    pub story_id: &'a str,
    pub seq: i64,
    pub entry_id: Option<Uuid>,
    pub now: DateTime<Utc>,
}

/// State of an object's version chain, observed under the object lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Versioning {
    Missing,
    Unversioned,
    Current(Uuid),
}

impl ObjectVersionLedger {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Create the first version of `object` and mark it current.
    pub async fn initialize(
        &self,
        object: &ObjectRef,
        story_id: &str,
        initial_state: &str,
    ) -> StoreResult<VersionRecord> {
        self.client
            .bounded("initialize", async {
                let mut txn = self.client.begin().await?;
                let result = standalone_write(&mut txn, object, story_id, initial_state, true).await;
                self.client.finish(txn, result).await
            })
            .await
    }

    /// Retire the current version of `object` into history and make `new_state` current.
    pub async fn apply_update(
        &self,
        object: &ObjectRef,
        story_id: &str,
        new_state: &str,
    ) -> StoreResult<VersionRecord> {
        self.client
            .bounded("apply_update", async {
                let mut txn = self.client.begin().await?;
                let result = standalone_write(&mut txn, object, story_id, new_state, false).await;
                self.client.finish(txn, result).await
            })
            .await
    }

    pub async fn current_state(&self, object: &ObjectRef) -> StoreResult<Option<VersionRecord>> {
        self.client
            .bounded("current_state", async {
                let mut txn = self.client.begin().await?;
                let result = current_in(&mut txn, object).await;
                self.client.finish(txn, result).await
            })
            .await
    }

    /// Every version of `object`, oldest first.
    pub async fn history(&self, object: &ObjectRef) -> StoreResult<Vec<VersionRecord>> {
        self.client
            .bounded("history", async {
                let mut txn = self.client.begin().await?;
                let result = history_in(&mut txn, object).await;
                self.client.finish(txn, result).await
            })
            .await
    }
}

async fn standalone_write(
    txn: &mut Txn,
    object: &ObjectRef,
    story_id: &str,
    state: &str,
    initialize: bool,
) -> StoreResult<VersionRecord> {
    let now = Utc::now();
    let seq = tick_story(txn, story_id, now).await?;
    let ctx = WriteContext {
        story_id,
        seq,
        entry_id: None,
        now,
    };
    if initialize {
        initialize_in(txn, &ctx, 0, object, state).await
    } else {
        apply_update_in(txn, &ctx, 0, object, state).await
    }
}

pub(crate) async fn initialize_in(
    txn: &mut Txn,
    ctx: &WriteContext<'_>,
    step: i64,
    object: &ObjectRef,
    state: &str,
) -> StoreResult<VersionRecord> {
    match lock_and_inspect(txn, object, ctx.now).await? {
        Versioning::Missing => Err(StoryGraphError::ObjectNotFound(object.clone())),
        Versioning::Current(_) => Err(StoryGraphError::AlreadyVersioned(object.clone())),
        Versioning::Unversioned => {
            let record = write_version(txn, ctx, step, object, state, None).await?;
            info!(object = %object, story_id = ctx.story_id, version_id = %record.id, "Object initialized");
            Ok(record)
        }
    }
}

pub(crate) async fn apply_update_in(
    txn: &mut Txn,
    ctx: &WriteContext<'_>,
    step: i64,
    object: &ObjectRef,
    state: &str,
) -> StoreResult<VersionRecord> {
    match lock_and_inspect(txn, object, ctx.now).await? {
        Versioning::Missing | Versioning::Unversioned => {
            Err(StoryGraphError::ObjectNotInitialized(object.clone()))
        }
        Versioning::Current(previous) => {
            let record = write_version(txn, ctx, step, object, state, Some(previous)).await?;
            info!(
                object = %object,
                story_id = ctx.story_id,
                version_id = %record.id,
                supersedes = %previous,
                "Object updated"
            );
            Ok(record)
        }
    }
}

/// Take the object's write lock, then report its current version.
/// Writing `last_versioned_at` is what acquires the lock. Every lock also bumps
/// `version_clock`, which readers compare to detect a change under them.
pub(crate) async fn lock_object(
    txn: &mut Txn,
    object: &ObjectRef,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    Ok(lock_and_inspect(txn, object, now).await? != Versioning::Missing)
}

async fn lock_and_inspect(txn: &mut Txn, object: &ObjectRef, now: DateTime<Utc>) -> StoreResult<Versioning> {
    let cypher = format!(
        "MATCH (o:{label} {{id: $object_id}})
         SET o.last_versioned_at = datetime($now),
             o.version_clock = coalesce(o.version_clock, 0) + 1
         WITH o
         OPTIONAL MATCH (cur:History)-[:CURRENT]->(o)
         RETURN cur.id AS current_id",
        label = object.kind.label()
    );
    let q = query(&cypher)
        .param("object_id", object.id.as_str())
        .param("now", format_datetime(&now));

    let rows = fetch_all(txn, q).await?;
    if rows.is_empty() {
        return Ok(Versioning::Missing);
    }

    let current: Vec<String> = rows.iter().filter_map(|r| opt_string(r, "current_id")).collect();
    match current.as_slice() {
        [] => Ok(Versioning::Unversioned),
        [id] => Uuid::parse_str(id)
            .map(Versioning::Current)
            .map_err(|e| StoryGraphError::Database(format!("bad History id {id}: {e}"))),
        many => {
            warn!(object = %object, count = many.len(), "Object has more than one CURRENT version");
            Err(StoryGraphError::Database(format!(
                "{object} has {} current versions",
                many.len()
            )))
        }
    }
}

/// Detach CURRENT from `supersedes` (if any), create the new record and point CURRENT at it.
async fn write_version(
    txn: &mut Txn,
    ctx: &WriteContext<'_>,
    step: i64,
    object: &ObjectRef,
    state: &str,
    supersedes: Option<Uuid>,
) -> StoreResult<VersionRecord> {
    let cypher = format!(
        "MATCH (o:{label} {{id: $object_id}})
         OPTIONAL MATCH (:History {{id: $supersedes}})-[r:CURRENT]->(o)
         DELETE r
         CREATE (h:History {{
             id: $id,
             story_id: $story_id,
             state: $state,
             seq: $seq,
             step: $step,
             created_at: datetime($now),
             object_kind: $object_kind,
             object_id: $object_id,
             entry_id: $entry_id,
             supersedes: $supersedes
         }})
         CREATE (h)-[:CURRENT]->(o)
         RETURN {VERSION_COLUMNS}",
        label = object.kind.label()
    );
    let q = query(&cypher)
        .param("id", Uuid::new_v4().to_string())
        .param("story_id", ctx.story_id)
        .param("state", state)
        .param("seq", ctx.seq)
        .param("step", step)
        .param("now", format_datetime(&ctx.now))
        .param("object_kind", object.kind.label())
        .param("object_id", object.id.as_str())
        .param("entry_id", ctx.entry_id.map(|id| id.to_string()))
        .param("supersedes", supersedes.map(|id| id.to_string()));

    let row = fetch_one(txn, q)
        .await?
        .ok_or_else(|| StoryGraphError::ObjectNotFound(object.clone()))?;
    version_from_row(&row)
}

pub(crate) async fn current_in(txn: &mut Txn, object: &ObjectRef) -> StoreResult<Option<VersionRecord>> {
    let cypher = format!(
        "MATCH (h:History)-[:CURRENT]->(o:{label} {{id: $object_id}})
         RETURN {VERSION_COLUMNS}",
        label = object.kind.label()
    );
    let q = query(&cypher).param("object_id", object.id.as_str());
    match fetch_one(txn, q).await? {
        Some(row) => Ok(Some(version_from_row(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn history_in(txn: &mut Txn, object: &ObjectRef) -> StoreResult<Vec<VersionRecord>> {
    let cypher = format!(
        "MATCH (h:History {{object_kind: $object_kind, object_id: $object_id}})
         RETURN {VERSION_COLUMNS}
         ORDER BY h.created_at, h.seq, h.step"
    );
    let q = query(&cypher)
        .param("object_kind", object.kind.label())
        .param("object_id", object.id.as_str());
    fetch_all(txn, q)
        .await?
        .iter()
        .map(version_from_row)
        .collect()
}

// --- Version repair after a prune ---

/// The part of a version record that matters for repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VersionLink {
    pub id: Uuid,
    pub supersedes: Option<Uuid>,
    pub is_current: bool,
    /// Written outside any commit, under the pruned story, after the cut.
    pub standalone_in_window: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RepairPlan {
    /// Set when the current version is being removed: the surviving version
    /// that takes over CURRENT, or `None` when nothing survives.
    pub restore_current: Option<Option<Uuid>>,
    /// Surviving versions whose `supersedes` must skip over removed ones.
    pub relink: Vec<(Uuid, Option<Uuid>)>,
}

/// Decide which of one object's versions a prune removes.
///
/// `removed` are the versions produced by the pruned commits. A standalone
/// version written in the window goes with them, unless a surviving version
/// descends from it through removed ones: then it belongs to a chain that
/// stays and is kept.
pub(crate) fn settle_doomed(links: &[VersionLink], removed: &HashSet<Uuid>) -> HashSet<Uuid> {
    let by_id: HashMap<Uuid, &VersionLink> = links.iter().map(|l| (l.id, l)).collect();
    let mut doomed: HashSet<Uuid> = links
        .iter()
        .filter(|l| removed.contains(&l.id) || l.standalone_in_window)
        .map(|l| l.id)
        .collect();

    loop {
        let mut spared = Vec::new();
        for survivor in links.iter().filter(|l| !doomed.contains(&l.id)) {
            let mut cursor = survivor.supersedes;
            for _ in 0..=links.len() {
                let Some(id) = cursor else { break };
                if !doomed.contains(&id) {
                    break;
                }
                match by_id.get(&id) {
                    Some(link) if link.standalone_in_window && !removed.contains(&id) => {
                        spared.push(id);
                        break;
                    }
                    Some(link) => cursor = link.supersedes,
                    None => break,
                }
            }
        }
        if spared.is_empty() {
            return doomed;
        }
        for id in spared {
            doomed.remove(&id);
        }
    }
}

/// Plan how one object's version chain heals once `doomed` versions are deleted.
pub(crate) fn plan_repair(links: &[VersionLink], doomed: &HashSet<Uuid>) -> RepairPlan {
    let by_id: HashMap<Uuid, &VersionLink> = links.iter().map(|l| (l.id, l)).collect();

    let surviving_ancestor = |start: Option<Uuid>| -> Option<Uuid> {
        let mut cursor = start;
        // Bounded walk: a malformed chain must not loop forever.
        for _ in 0..=links.len() {
            let id = cursor?;
            match by_id.get(&id) {
                Some(link) if doomed.contains(&id) => cursor = link.supersedes,
                Some(_) => return Some(id),
                None => return None,
            }
        }
        None
    };

    let restore_current = links
        .iter()
        .find(|l| l.is_current && doomed.contains(&l.id))
        .map(|l| surviving_ancestor(l.supersedes));

    let mut relink: Vec<(Uuid, Option<Uuid>)> = links
        .iter()
        .filter(|l| !doomed.contains(&l.id))
        .filter(|l| l.supersedes.is_some_and(|s| doomed.contains(&s)))
        .map(|l| (l.id, surviving_ancestor(l.supersedes)))
        .collect();
    relink.sort();

    RepairPlan {
        restore_current,
        relink,
    }
}
