use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use neo4rs::{query, Txn};
use tracing::{debug, info};
use uuid::Uuid;

use storygraph_common::{ObjectRef, PruneReport, StoreResult, StoryGraphError};

use crate::client::{fetch_all, fetch_one, run};
use crate::ledger::{lock_object, plan_repair, settle_doomed, RepairPlan, VersionLink};
use crate::rows::{
    entry_from_row, field, object_kind_field, opt_uuid_field, uuid_field, ENTRY_COLUMNS,
};
use crate::world::tick_story;
use crate::GraphClient;

/// Rolls a timeline back to a cut point.
#[derive(Clone)]
pub struct PruneEngine {
    client: GraphClient,
}

/// Entries downstream of a cut, with the number of summaries attached to them.
struct Downstream {
    entry_ids: Vec<String>,
    summaries: usize,
}

impl PruneEngine {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Delete everything committed after `cut_entry_id` on its chain, and the
    /// versions those commits produced. The cut entry itself survives.
    pub async fn prune(&self, cut_entry_id: Uuid) -> StoreResult<PruneReport> {
        self.client
            .bounded("prune", async {
                let mut txn = self.client.begin().await?;
                let result = prune_in(&mut txn, cut_entry_id, Utc::now()).await;
                let report = self.client.finish(txn, result).await?;
                if report.is_noop() {
                    debug!(cut_entry_id = %cut_entry_id, "Nothing downstream of cut, prune is a no-op");
                } else {
                    info!(
                        cut_entry_id = %cut_entry_id,
                        entries = report.entries_removed,
                        versions = report.versions_removed,
                        restored = report.objects_restored.len(),
                        "Story pruned"
                    );
                }
                Ok(report)
            })
            .await
    }
}

pub(crate) async fn prune_in(txn: &mut Txn, cut_entry_id: Uuid, now: DateTime<Utc>) -> StoreResult<PruneReport> {
    let cut_id = cut_entry_id.to_string();
    let noop = PruneReport {
        cut_entry_id,
        entries_removed: 0,
        summaries_removed: 0,
        versions_removed: 0,
        objects_restored: Vec::new(),
    };

    // Unlocked look first: a missing cut or an empty suffix needs no lock.
    let story_id = cut_story(txn, &cut_id).await?.ok_or(StoryGraphError::EntryNotFound(cut_entry_id))?;
    if downstream(txn, &cut_id).await?.entry_ids.is_empty() {
        return Ok(noop);
    }

    tick_story(txn, &story_id, now).await?;

    // Re-read under the lock; a concurrent prune may have removed the cut or its suffix.
    let cut = {
        let cypher = format!("MATCH (e:Entry {{id: $id}}) RETURN {ENTRY_COLUMNS}");
        let row = fetch_one(txn, query(&cypher).param("id", cut_id.as_str()))
            .await?
            .ok_or(StoryGraphError::EntryNotFound(cut_entry_id))?;
        entry_from_row(&row)?
    };
    let doomed_entries = downstream(txn, &cut_id).await?;
    if doomed_entries.entry_ids.is_empty() {
        return Ok(noop);
    }

    // Versions produced by the removed commits. Commits on surviving branch
    // chains share the story id but are kept.
    let q = query(
        "MATCH (h:History {story_id: $story_id})
         WHERE h.seq > $cut_seq AND h.entry_id IN $entry_ids
         RETURN h.id AS version_id, h.object_kind AS version_kind, h.object_id AS version_object_id",
    )
    .param("story_id", cut.story_id.as_str())
    .param("cut_seq", cut.seq)
    .param("entry_ids", doomed_entries.entry_ids.clone());

    let mut removed: HashSet<Uuid> = HashSet::new();
    let mut affected: BTreeSet<ObjectRef> = BTreeSet::new();
    for row in fetch_all(txn, q).await? {
        removed.insert(uuid_field(&row, "version_id")?);
        let object = ObjectRef::new(
            object_kind_field(&row, "version_kind")?,
            field::<String>(&row, "version_object_id")?,
        );
        affected.insert(object);
    }

    // Standalone writes in the window are only considered for objects the
    // removed commits touched; everything else belongs to chains that stay.
    let mut doomed_versions: HashSet<Uuid> = HashSet::new();
    let mut plans: Vec<(ObjectRef, RepairPlan)> = Vec::new();
    for object in &affected {
        lock_object(txn, object, now).await?;
        let links = version_links(txn, object, &cut.story_id, cut.seq).await?;
        let doomed = settle_doomed(&links, &removed);
        plans.push((object.clone(), plan_repair(&links, &doomed)));
        doomed_versions.extend(doomed);
    }

    run(
        txn,
        query(
            "MATCH (d:Entry) WHERE d.id IN $entry_ids
             OPTIONAL MATCH (d)-[:NEXT]->(s:Summary)
             DETACH DELETE d, s",
        )
        .param("entry_ids", doomed_entries.entry_ids.clone()),
    )
    .await?;

    let version_ids: Vec<String> = doomed_versions.iter().map(Uuid::to_string).collect();
    run(
        txn,
        query("MATCH (h:History) WHERE h.id IN $version_ids DETACH DELETE h")
            .param("version_ids", version_ids),
    )
    .await?;

    let mut objects_restored = Vec::new();
    for (object, plan) in &plans {
        apply_repair(txn, object, plan).await?;
        if plan.restore_current.is_some() {
            objects_restored.push(object.clone());
        }
    }

    Ok(PruneReport {
        cut_entry_id,
        entries_removed: doomed_entries.entry_ids.len(),
        summaries_removed: doomed_entries.summaries,
        versions_removed: doomed_versions.len(),
        objects_restored,
    })
}

async fn cut_story(txn: &mut Txn, cut_id: &str) -> StoreResult<Option<String>> {
    let q = query("MATCH (cut:Entry {id: $id}) RETURN cut.story_id AS story_id").param("id", cut_id);
    match fetch_one(txn, q).await? {
        Some(row) => Ok(Some(field(&row, "story_id")?)),
        None => Ok(None),
    }
}

/// Follow NEXT forward from the cut. BRANCH edges are not followed.
async fn downstream(txn: &mut Txn, cut_id: &str) -> StoreResult<Downstream> {
    let q = query(
        "MATCH (:Entry {id: $id})-[:NEXT*1..]->(d:Entry)
         OPTIONAL MATCH (d)-[:NEXT]->(s:Summary)
         RETURN d.id AS entry_id, count(s) AS summaries",
    )
    .param("id", cut_id);

    let mut entry_ids = Vec::new();
    let mut summaries = 0usize;
    for row in fetch_all(txn, q).await? {
        entry_ids.push(field::<String>(&row, "entry_id")?);
        summaries += field::<i64>(&row, "summaries")? as usize;
    }
    entry_ids.sort();
    entry_ids.dedup();
    Ok(Downstream { entry_ids, summaries })
}

async fn version_links(
    txn: &mut Txn,
    object: &ObjectRef,
    story_id: &str,
    cut_seq: i64,
) -> StoreResult<Vec<VersionLink>> {
    let q = query(
        "MATCH (h:History {object_kind: $object_kind, object_id: $object_id})
         RETURN h.id AS version_id,
                h.supersedes AS version_supersedes,
                EXISTS { MATCH (h)-[:CURRENT]->() } AS version_is_current,
                (h.entry_id IS NULL AND h.story_id = $story_id AND h.seq > $cut_seq) AS version_in_window",
    )
    .param("object_kind", object.kind.label())
    .param("object_id", object.id.as_str())
    .param("story_id", story_id)
    .param("cut_seq", cut_seq);

    fetch_all(txn, q)
        .await?
        .iter()
        .map(|row| {
            Ok(VersionLink {
                id: uuid_field(row, "version_id")?,
                supersedes: opt_uuid_field(row, "version_supersedes")?,
                is_current: field(row, "version_is_current")?,
                standalone_in_window: field(row, "version_in_window")?,
            })
        })
        .collect()
}

async fn apply_repair(txn: &mut Txn, object: &ObjectRef, plan: &RepairPlan) -> StoreResult<()> {
    for (version_id, supersedes) in &plan.relink {
        run(
            txn,
            query("MATCH (h:History {id: $id}) SET h.supersedes = $supersedes")
                .param("id", version_id.to_string())
                .param("supersedes", supersedes.map(|s| s.to_string())),
        )
        .await?;
    }

    if let Some(Some(restored)) = plan.restore_current {
        let cypher = format!(
            "MATCH (h:History {{id: $version_id}})
             MATCH (o:{label} {{id: $object_id}})
             WHERE NOT EXISTS {{ MATCH (:History)-[:CURRENT]->(o) }}
             CREATE (h)-[:CURRENT]->(o)",
            label = object.kind.label()
        );
        run(
            txn,
            query(&cypher)
                .param("version_id", restored.to_string())
                .param("object_id", object.id.as_str()),
        )
        .await?;
        debug!(object = %object, version_id = %restored, "Current version restored");
    }
    Ok(())
}
