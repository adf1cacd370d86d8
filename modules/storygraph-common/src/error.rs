use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::ObjectRef;

pub type StoreResult<T> = Result<T, StoryGraphError>;

#[derive(Error, Debug)]
pub enum StoryGraphError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("World object not found: {0}")]
    ObjectNotFound(ObjectRef),

    #[error("World object {0} has no current version; initialize it first")]
    ObjectNotInitialized(ObjectRef),

    #[error("World object {0} already has a current version")]
    AlreadyVersioned(ObjectRef),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Stable error tag reported across the store boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SchemaError,
    EntryNotFound,
    ObjectNotFound,
    ObjectNotInitialized,
    AlreadyVersioned,
    ConcurrentModification,
    StoreUnavailable,
    ConfigError,
    DatabaseError,
}

impl StoryGraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoryGraphError::Schema(_) => ErrorKind::SchemaError,
            StoryGraphError::EntryNotFound(_) => ErrorKind::EntryNotFound,
            StoryGraphError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            StoryGraphError::ObjectNotInitialized(_) => ErrorKind::ObjectNotInitialized,
            StoryGraphError::AlreadyVersioned(_) => ErrorKind::AlreadyVersioned,
            StoryGraphError::ConcurrentModification(_) => ErrorKind::ConcurrentModification,
            StoryGraphError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            StoryGraphError::Config(_) => ErrorKind::ConfigError,
            StoryGraphError::Database(_) => ErrorKind::DatabaseError,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Tagged error form (kind + human-readable detail) handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<StoryGraphError> for ErrorReport {
    fn from(err: StoryGraphError) -> Self {
        err.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        let obj = ObjectRef::trait_("brave");
        assert_eq!(
            StoryGraphError::ObjectNotInitialized(obj.clone()).kind(),
            ErrorKind::ObjectNotInitialized
        );
        assert_eq!(
            StoryGraphError::AlreadyVersioned(obj).kind(),
            ErrorKind::AlreadyVersioned
        );
        assert_eq!(
            StoryGraphError::EntryNotFound(Uuid::nil()).kind(),
            ErrorKind::EntryNotFound
        );
        assert_eq!(
            StoryGraphError::StoreUnavailable("timeout".into()).kind(),
            ErrorKind::StoreUnavailable
        );
    }

    #[test]
    fn report_serializes_kind_and_message() {
        let report = StoryGraphError::ObjectNotInitialized(ObjectRef::trait_("brave")).report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "ObjectNotInitialized");
        assert!(json["message"].as_str().unwrap().contains("Trait:brave"));
    }
}
