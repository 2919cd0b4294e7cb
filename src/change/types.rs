use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// A JSON object holding some or all of an entity's fields.
pub type Fields = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Character,
    LorebookEntry,
    Scenario,
    Lorebook,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Character,
        EntityType::LorebookEntry,
        EntityType::Scenario,
        EntityType::Lorebook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Character => "character",
            EntityType::LorebookEntry => "lorebook-entry",
            EntityType::Scenario => "scenario",
            EntityType::Lorebook => "lorebook",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
    Merge,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Merge => "merge",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Rejected,
}

impl ChangeStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ChangeStatus::Pending)
    }
}

/// A change to a character or a scenario. Both stores share the same shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum EntityChange {
    Create {
        data: Fields,
    },
    Update {
        target_id: String,
        data: Fields,
        previous: Fields,
    },
    Delete {
        target_id: String,
        previous: Fields,
    },
}

/// A change to one or more entries of a single lorebook.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum EntryChange {
    Create {
        data: Fields,
    },
    Update {
        target_id: String,
        data: Fields,
        previous: Fields,
    },
    Delete {
        target_id: String,
        previous: Fields,
    },
    Merge {
        previous_entries: Vec<Fields>,
        data: Fields,
    },
}

/// What a change does, keyed by entity type and action. Each variant only
/// carries the fields that make sense for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "kebab-case")]
pub enum Proposal {
    Character(EntityChange),
    Scenario(EntityChange),
    Lorebook {
        data: Fields,
    },
    LorebookEntry {
        lorebook_id: String,
        change: EntryChange,
    },
}

impl Proposal {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Proposal::Character(_) => EntityType::Character,
            Proposal::Scenario(_) => EntityType::Scenario,
            Proposal::Lorebook { .. } => EntityType::Lorebook,
            Proposal::LorebookEntry { .. } => EntityType::LorebookEntry,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Proposal::Character(c) | Proposal::Scenario(c) => match c {
                EntityChange::Create { .. } => Action::Create,
                EntityChange::Update { .. } => Action::Update,
                EntityChange::Delete { .. } => Action::Delete,
            },
            Proposal::Lorebook { .. } => Action::Create,
            Proposal::LorebookEntry { change, .. } => match change {
                EntryChange::Create { .. } => Action::Create,
                EntryChange::Update { .. } => Action::Update,
                EntryChange::Delete { .. } => Action::Delete,
                EntryChange::Merge { .. } => Action::Merge,
            },
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            Proposal::Character(c) | Proposal::Scenario(c) => match c {
                EntityChange::Create { .. } => None,
                EntityChange::Update { target_id, .. } | EntityChange::Delete { target_id, .. } => {
                    Some(target_id)
                }
            },
            Proposal::Lorebook { .. } => None,
            Proposal::LorebookEntry { change, .. } => match change {
                EntryChange::Update { target_id, .. } | EntryChange::Delete { target_id, .. } => {
                    Some(target_id)
                }
                EntryChange::Create { .. } | EntryChange::Merge { .. } => None,
            },
        }
    }

    pub fn lorebook_id(&self) -> Option<&str> {
        match self {
            Proposal::LorebookEntry { lorebook_id, .. } => Some(lorebook_id),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Fields> {
        match self {
            Proposal::Character(c) | Proposal::Scenario(c) => match c {
                EntityChange::Create { data } | EntityChange::Update { data, .. } => Some(data),
                EntityChange::Delete { .. } => None,
            },
            Proposal::Lorebook { data } => Some(data),
            Proposal::LorebookEntry { change, .. } => match change {
                EntryChange::Create { data }
                | EntryChange::Update { data, .. }
                | EntryChange::Merge { data, .. } => Some(data),
                EntryChange::Delete { .. } => None,
            },
        }
    }

    fn data_mut(&mut self) -> Option<&mut Fields> {
        match self {
            Proposal::Character(c) | Proposal::Scenario(c) => match c {
                EntityChange::Create { data } | EntityChange::Update { data, .. } => Some(data),
                EntityChange::Delete { .. } => None,
            },
            Proposal::Lorebook { data } => Some(data),
            Proposal::LorebookEntry { change, .. } => match change {
                EntryChange::Create { data }
                | EntryChange::Update { data, .. }
                | EntryChange::Merge { data, .. } => Some(data),
                EntryChange::Delete { .. } => None,
            },
        }
    }

    pub fn previous(&self) -> Option<&Fields> {
        match self {
            Proposal::Character(c) | Proposal::Scenario(c) => match c {
                EntityChange::Update { previous, .. } | EntityChange::Delete { previous, .. } => {
                    Some(previous)
                }
                EntityChange::Create { .. } => None,
            },
            Proposal::LorebookEntry { change, .. } => match change {
                EntryChange::Update { previous, .. } | EntryChange::Delete { previous, .. } => {
                    Some(previous)
                }
                _ => None,
            },
            Proposal::Lorebook { .. } => None,
        }
    }

    pub fn previous_entries(&self) -> Option<&[Fields]> {
        match self {
            Proposal::LorebookEntry {
                change: EntryChange::Merge { previous_entries, .. },
                ..
            } => Some(previous_entries),
            _ => None,
        }
    }

    /// The key two pending changes must share for the newer one to replace
    /// the older. Creates have none.
    pub fn dedup_key(&self) -> Option<(EntityType, String)> {
        let entity_type = self.entity_type();
        match self {
            Proposal::LorebookEntry {
                lorebook_id,
                change: EntryChange::Merge { previous_entries, .. },
            } => {
                let mut ids: Vec<&str> = previous_entries.iter().filter_map(entry_id).collect();
                ids.sort_unstable();
                Some((entity_type, format!("{}/merge:{}", lorebook_id, ids.join(","))))
            }
            Proposal::LorebookEntry { lorebook_id, .. } => self
                .target_id()
                .map(|target| (entity_type, format!("{}/{}", lorebook_id, target))),
            _ => self.target_id().map(|target| (entity_type, target.to_string())),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(target) = self.target_id() {
            if target.is_empty() {
                return Err(ValidationError::MissingField("targetId"));
            }
        }
        if let Some(lorebook_id) = self.lorebook_id() {
            if lorebook_id.is_empty() {
                return Err(ValidationError::MissingField("lorebookId"));
            }
        }
        if self.action() == Action::Update && self.data().is_some_and(|data| data.is_empty()) {
            return Err(ValidationError::MissingField("data"));
        }
        if let Some(entries) = self.previous_entries() {
            if entries.len() < 2 {
                return Err(ValidationError::MergeTooSmall(entries.len()));
            }
            let mut seen = std::collections::HashSet::new();
            for (index, entry) in entries.iter().enumerate() {
                let id = entry_id(entry).ok_or(ValidationError::MergeEntryWithoutId(index))?;
                if !seen.insert(id) {
                    return Err(ValidationError::DuplicateMergeEntry(id.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Reads the `"id"` field of an entity or lorebook entry.
pub fn entry_id(fields: &Fields) -> Option<&str> {
    fields.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

/// One staged, reviewable mutation of the vault.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedRecord")]
pub struct ChangeRecord {
    id: String,
    status: ChangeStatus,
    proposal: Proposal,
}

/// A serialized record read back in. The status is ignored: a record that
/// comes back in starts out pending.
#[derive(Deserialize)]
struct UncheckedRecord {
    id: String,
    proposal: Proposal,
}

impl TryFrom<UncheckedRecord> for ChangeRecord {
    type Error = ValidationError;

    fn try_from(unchecked: UncheckedRecord) -> Result<Self, Self::Error> {
        ChangeRecord::with_id(unchecked.id, unchecked.proposal)
    }
}

impl ChangeRecord {
    /// Builds a pending change with a fresh id.
    pub fn new(proposal: Proposal) -> Result<Self, ValidationError> {
        Self::with_id(Uuid::now_v7().to_string(), proposal)
    }

    pub fn with_id(id: impl Into<String>, proposal: Proposal) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        proposal.validate()?;
        Ok(Self {
            id,
            status: ChangeStatus::Pending,
            proposal,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ChangeStatus {
        self.status
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn entity_type(&self) -> EntityType {
        self.proposal.entity_type()
    }

    pub fn action(&self) -> Action {
        self.proposal.action()
    }

    pub fn target_id(&self) -> Option<&str> {
        self.proposal.target_id()
    }

    pub fn data(&self) -> Option<&Fields> {
        self.proposal.data()
    }

    pub fn previous(&self) -> Option<&Fields> {
        self.proposal.previous()
    }

    pub fn previous_entries(&self) -> Option<&[Fields]> {
        self.proposal.previous_entries()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }

    /// Shallow-merges `edits` into the proposed data. `previous` and
    /// `previous_entries` are never touched. Returns false for deletes,
    /// which carry no data.
    pub(crate) fn merge_edits(&mut self, edits: Fields) -> bool {
        match self.proposal.data_mut() {
            Some(data) => {
                data.extend(edits);
                true
            }
            None => false,
        }
    }

    /// Moves a pending change to a terminal status. Settled changes keep
    /// their status.
    pub(crate) fn settle(&mut self, status: ChangeStatus) -> bool {
        if self.status.is_settled() || !status.is_settled() {
            return false;
        }
        self.status = status;
        true
    }
}
