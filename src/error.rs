use crate::change::EntityType;

/// Why a proposal was refused before it could enter the staging area.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("{action} is not supported for {entity_type}")]
    UnsupportedAction {
        entity_type: EntityType,
        action: String,
    },

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' must be a JSON object")]
    NotAnObject(&'static str),

    #[error("merge needs at least 2 source entries, got {0}")]
    MergeTooSmall(usize),

    #[error("merge source entry at index {0} has no id")]
    MergeEntryWithoutId(usize),

    #[error("merge lists entry '{0}' more than once")]
    DuplicateMergeEntry(String),

    #[error("malformed proposal: {0}")]
    Malformed(String),
}

/// Failure to write an approved change into the entity stores. The change
/// stays pending whenever one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("no change with id '{0}'")]
    UnknownChange(String),

    #[error("{entity_type} '{target_id}' no longer exists")]
    StaleTarget {
        entity_type: EntityType,
        target_id: String,
    },

    #[error("lorebook '{lorebook_id}' has a malformed entry list: {reason}")]
    CorruptLorebook { lorebook_id: String, reason: String },

    #[error("store write failed: {0}")]
    Store(#[from] anyhow::Error),
}

/// One failed commit out of an `approve_all` run.
#[derive(Debug, thiserror::Error)]
#[error("change {change_id}: {error}")]
pub struct CommitFailure {
    pub change_id: String,
    #[source]
    pub error: CommitError,
}
