use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stories are addressed by caller-chosen string ids ("story1", a UUID, ...).
pub type StoryId = String;

/// Text given to the placeholder entry created at a fork point.
pub const BRANCH_PLACEHOLDER_TEXT: &str = "Branch starting point";

// --- World objects ---

/// The kinds of mutable world fact holders. Each kind is its own node label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Trait,
    Character,
    Location,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 3] = [ObjectKind::Trait, ObjectKind::Character, ObjectKind::Location];

    /// Node label used in the graph.
    pub fn label(&self) -> &'static str {
        match self {
            ObjectKind::Trait => "Trait",
            ObjectKind::Character => "Character",
            ObjectKind::Location => "Location",
        }
    }

    /// Property holding the display name: traits have a title, the rest a name.
    pub fn title_field(&self) -> &'static str {
        match self {
            ObjectKind::Trait => "title",
            ObjectKind::Character | ObjectKind::Location => "name",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectKind::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown object kind: {s}"))
    }
}

/// Identity of a world object: `(kind, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn trait_(id: impl Into<String>) -> Self {
        Self::new(ObjectKind::Trait, id)
    }

    pub fn character(id: impl Into<String>) -> Self {
        Self::new(ObjectKind::Character, id)
    }

    pub fn location(id: impl Into<String>) -> Self {
        Self::new(ObjectKind::Location, id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Descriptive fields set once when an object is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticFields {
    /// Title for traits, name for characters and locations.
    pub title: String,
    pub description: String,
}

impl StaticFields {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldObject {
    pub object: ObjectRef,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

// --- Story and timeline ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub title: Option<String>,
    /// Logical clock, bumped by every mutation on the story.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

/// One immutable narrative step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub story_id: StoryId,
    pub text: String,
    /// Story clock value of the transaction that created the entry.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    /// True for placeholder entries created by a branch.
    pub branch_root: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
}

/// An out-of-band fork edge `from --BRANCH--> to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEdge {
    pub from: Uuid,
    pub to: Uuid,
    pub title: Option<String>,
    pub branch_id: Option<String>,
}

// --- Versions ---

/// One historical state snapshot of a world object ("History" node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: Uuid,
    pub object: ObjectRef,
    pub story_id: StoryId,
    /// Opaque state payload.
    pub state: String,
    pub seq: i64,
    /// Position among versions written in the same transaction.
    pub step: i64,
    /// Entry whose commit produced this version; `None` for standalone initialization.
    pub entry_id: Option<Uuid>,
    /// The version that was current before this one.
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    /// First version of an object: fails if one is already current.
    Initialize,
    /// Replace the current version: fails if there is none.
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub object: ObjectRef,
    pub new_state: String,
    pub mode: ChangeMode,
}

impl StateChange {
    pub fn update(object: ObjectRef, new_state: impl Into<String>) -> Self {
        Self {
            object,
            new_state: new_state.into(),
            mode: ChangeMode::Update,
        }
    }

    pub fn initialize(object: ObjectRef, new_state: impl Into<String>) -> Self {
        Self {
            object,
            new_state: new_state.into(),
            mode: ChangeMode::Initialize,
        }
    }
}

/// Input to `NarrativeTimeline::commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub story_id: StoryId,
    pub text: String,
    pub summary: String,
    #[serde(default)]
    pub state_changes: Vec<StateChange>,
    /// The head the caller believes it is extending. `None` means the story's main chain head.
    #[serde(default)]
    pub expected_head: Option<Uuid>,
}

impl CommitRequest {
    pub fn new(
        story_id: impl Into<StoryId>,
        text: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            story_id: story_id.into(),
            text: text.into(),
            summary: summary.into(),
            state_changes: Vec::new(),
            expected_head: None,
        }
    }

    pub fn with_change(mut self, change: StateChange) -> Self {
        self.state_changes.push(change);
        self
    }

    /// Commit after a specific entry (a branch root or a known head).
    pub fn after(mut self, head: Uuid) -> Self {
        self.expected_head = Some(head);
        self
    }
}

// --- Read models ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryView {
    pub entry: Entry,
    pub summary: Option<Summary>,
    /// Forks leaving this entry. They are listed, never followed.
    pub branches: Vec<BranchEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub object: WorldObject,
    pub current: VersionRecord,
}

/// Snapshot returned by retrieval: ordered steps plus current world state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryView {
    pub story_id: StoryId,
    pub entries: Vec<EntryView>,
    pub state: Vec<ObjectState>,
}

impl StoryView {
    pub fn entry_texts(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.entry.text.as_str()).collect()
    }

    pub fn head(&self) -> Option<&Entry> {
        self.entries.last().map(|e| &e.entry)
    }

    pub fn current_state_of(&self, object: &ObjectRef) -> Option<&str> {
        self.state
            .iter()
            .find(|s| &s.object.object == object)
            .map(|s| s.current.state.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub cut_entry_id: Uuid,
    pub entries_removed: usize,
    pub summaries_removed: usize,
    pub versions_removed: usize,
    /// Objects whose current version moved back to an earlier record (or was cleared).
    pub objects_restored: Vec<ObjectRef>,
}

impl PruneReport {
    pub fn is_noop(&self) -> bool {
        self.entries_removed == 0 && self.versions_removed == 0
    }

    pub fn message(&self) -> String {
        format!("Story successfully rolled back to Entry {}.", self.cut_entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> EntryView {
        EntryView {
            entry: Entry {
                id: Uuid::new_v4(),
                story_id: "story1".to_string(),
                text: text.to_string(),
                seq: 1,
                created_at: Utc::now(),
                branch_root: false,
            },
            summary: None,
            branches: vec![],
        }
    }

    #[test]
    fn object_kind_parses_case_insensitively() {
        assert_eq!("trait".parse::<ObjectKind>().unwrap(), ObjectKind::Trait);
        assert_eq!("Character".parse::<ObjectKind>().unwrap(), ObjectKind::Character);
        assert_eq!("LOCATION".parse::<ObjectKind>().unwrap(), ObjectKind::Location);
        assert!("weapon".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn every_kind_parses_back_from_its_label() {
        for kind in ObjectKind::ALL {
            assert_eq!(kind.label().parse::<ObjectKind>().unwrap(), kind);
            assert_eq!(kind.to_string().to_lowercase().parse::<ObjectKind>().unwrap(), kind);
        }
    }

    #[test]
    fn title_field_differs_for_traits() {
        assert_eq!(ObjectKind::Trait.title_field(), "title");
        assert_eq!(ObjectKind::Character.title_field(), "name");
        assert_eq!(ObjectKind::Location.title_field(), "name");
    }

    #[test]
    fn object_ref_display_is_kind_and_id() {
        assert_eq!(ObjectRef::trait_("brave").to_string(), "Trait:brave");
    }

    #[test]
    fn commit_request_builder_keeps_change_order() {
        let req = CommitRequest::new("story1", "text", "sum")
            .with_change(StateChange::initialize(ObjectRef::trait_("a"), "v1"))
            .with_change(StateChange::update(ObjectRef::trait_("b"), "v2"));
        assert_eq!(req.state_changes.len(), 2);
        assert_eq!(req.state_changes[0].mode, ChangeMode::Initialize);
        assert_eq!(req.state_changes[1].object.id, "b");
        assert!(req.expected_head.is_none());
    }

    #[test]
    fn commit_request_deserializes_without_optional_fields() {
        let req: CommitRequest = serde_json::from_value(serde_json::json!({
            "story_id": "story1",
            "text": "The hero embarks on a journey.",
            "summary": "The journey begins."
        }))
        .unwrap();
        assert!(req.state_changes.is_empty());
        assert!(req.expected_head.is_none());
    }

    #[test]
    fn story_view_helpers() {
        let view = StoryView {
            story_id: "story1".to_string(),
            entries: vec![entry("A"), entry("B")],
            state: vec![],
        };
        assert_eq!(view.entry_texts(), vec!["A", "B"]);
        assert_eq!(view.head().map(|e| e.text.as_str()), Some("B"));
        assert!(view.current_state_of(&ObjectRef::trait_("brave")).is_none());
    }

    #[test]
    fn prune_report_message_names_cut_entry() {
        let id = Uuid::new_v4();
        let report = PruneReport {
            cut_entry_id: id,
            entries_removed: 0,
            summaries_removed: 0,
            versions_removed: 0,
            objects_restored: vec![],
        };
        assert!(report.is_noop());
        assert_eq!(report.message(), format!("Story successfully rolled back to Entry {id}."));
    }
}
