// NarrativeStore is the boundary an API layer talks to.
//
// StoryStore implements it on Neo4j by delegating to the components, each of
// which is also usable on its own for finer-grained work (history, load_chain,
// world registry).

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use storygraph_common::{
    CommitRequest, Config, ObjectKind, ObjectRef, PruneReport, StaticFields, StoreResult, StoryView,
};

use crate::{
    migrate, GraphClient, NarrativeTimeline, ObjectVersionLedger, PruneEngine, StoryReader,
    WorldRegistry,
};

#[async_trait]
pub trait NarrativeStore: Send + Sync {
    /// Append an entry with its summary and state changes. Returns the entry id.
    async fn commit(&self, request: &CommitRequest) -> StoreResult<Uuid>;

    /// Fork from an entry. Returns the new branch root's id.
    async fn branch(
        &self,
        from_entry_id: Uuid,
        title: Option<&str>,
        branch_id: Option<&str>,
    ) -> StoreResult<Uuid>;

    /// Roll the cut entry's chain back to it.
    async fn prune(&self, cut_entry_id: Uuid) -> StoreResult<PruneReport>;

    async fn load(&self, story_id: &str) -> StoreResult<StoryView>;

    /// Create the object if needed and give it its first version under `story_id`.
    async fn initialize_object(
        &self,
        kind: ObjectKind,
        id: &str,
        fields: &StaticFields,
        story_id: &str,
        initial_state: &str,
    ) -> StoreResult<()>;
}

/// Neo4j-backed store: one client shared by every component.
#[derive(Clone)]
pub struct StoryStore {
    client: GraphClient,
    timeline: NarrativeTimeline,
    ledger: ObjectVersionLedger,
    pruner: PruneEngine,
    reader: StoryReader,
    world: WorldRegistry,
}

impl StoryStore {
    pub fn new(client: GraphClient) -> Self {
        Self {
            timeline: NarrativeTimeline::new(client.clone()),
            ledger: ObjectVersionLedger::new(client.clone()),
            pruner: PruneEngine::new(client.clone()),
            reader: StoryReader::new(client.clone()),
            world: WorldRegistry::new(client.clone()),
            client,
        }
    }

    pub async fn connect(config: &Config) -> StoreResult<Self> {
        let client = GraphClient::connect_with(config).await?;
        Ok(Self::new(client))
    }

    /// Idempotent schema setup.
    pub async fn setup(&self) -> StoreResult<()> {
        migrate::migrate(&self.client).await?;
        info!("Story store ready");
        Ok(())
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    pub fn timeline(&self) -> &NarrativeTimeline {
        &self.timeline
    }

    pub fn ledger(&self) -> &ObjectVersionLedger {
        &self.ledger
    }

    pub fn pruner(&self) -> &PruneEngine {
        &self.pruner
    }

    pub fn reader(&self) -> &StoryReader {
        &self.reader
    }

    pub fn world(&self) -> &WorldRegistry {
        &self.world
    }
}

#[async_trait]
impl NarrativeStore for StoryStore {
    async fn commit(&self, request: &CommitRequest) -> StoreResult<Uuid> {
        self.timeline.commit(request).await
    }

    async fn branch(
        &self,
        from_entry_id: Uuid,
        title: Option<&str>,
        branch_id: Option<&str>,
    ) -> StoreResult<Uuid> {
        self.timeline.branch(from_entry_id, title, branch_id).await
    }

    async fn prune(&self, cut_entry_id: Uuid) -> StoreResult<PruneReport> {
        self.pruner.prune(cut_entry_id).await
    }

    async fn load(&self, story_id: &str) -> StoreResult<StoryView> {
        self.reader.load(story_id).await
    }

    async fn initialize_object(
        &self,
        kind: ObjectKind,
        id: &str,
        fields: &StaticFields,
        story_id: &str,
        initial_state: &str,
    ) -> StoreResult<()> {
        let object = ObjectRef::new(kind, id);
        self.world
            .initialize_object(&object, fields, story_id, initial_state)
            .await?;
        Ok(())
    }
}
