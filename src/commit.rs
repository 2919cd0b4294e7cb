use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::change::{
    entry_id, ChangeRecord, EntityChange, EntityType, EntryChange, Fields, Proposal,
};
use crate::error::CommitError;
use crate::store::{EntityStore, SqliteVault};

/// Writes an approved change into the entity stores.
pub trait CommitAdapter: Send + Sync {
    fn commit(&self, change: &ChangeRecord) -> Result<(), CommitError>;
}

/// Commits changes against one store per entity kind. Every commit is a
/// single store call; lorebook entry changes rewrite the owning lorebook's
/// `entries` array in one `update`.
#[derive(Clone)]
pub struct VaultCommitter {
    characters: Arc<dyn EntityStore>,
    scenarios: Arc<dyn EntityStore>,
    lorebooks: Arc<dyn EntityStore>,
}

impl VaultCommitter {
    pub fn new(
        characters: Arc<dyn EntityStore>,
        scenarios: Arc<dyn EntityStore>,
        lorebooks: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            characters,
            scenarios,
            lorebooks,
        }
    }

    pub fn for_vault(vault: &SqliteVault) -> Self {
        Self::new(
            Arc::new(vault.characters()),
            Arc::new(vault.scenarios()),
            Arc::new(vault.lorebooks()),
        )
    }

    fn commit_entity(
        &self,
        store: &dyn EntityStore,
        entity_type: EntityType,
        change: &EntityChange,
    ) -> Result<(), CommitError> {
        match change {
            EntityChange::Create { data } => {
                store.add(data.clone())?;
            }
            EntityChange::Update { target_id, data, .. } => {
                require(store, entity_type, target_id)?;
                store.update(target_id, data.clone())?;
            }
            EntityChange::Delete { target_id, .. } => {
                require(store, entity_type, target_id)?;
                store.delete(target_id)?;
            }
        }
        Ok(())
    }

    fn commit_entry(&self, lorebook_id: &str, change: &EntryChange) -> Result<(), CommitError> {
        let lorebook = self
            .lorebooks
            .get_by_id(lorebook_id)?
            .ok_or_else(|| CommitError::StaleTarget {
                entity_type: EntityType::Lorebook,
                target_id: lorebook_id.to_string(),
            })?;
        let mut entries = entries_of(lorebook_id, &lorebook)?;

        match change {
            EntryChange::Create { data } => {
                let mut entry = data.clone();
                let taken: HashSet<&str> = entries.iter().filter_map(entry_id).collect();
                assign_entry_id(lorebook_id, &mut entry, &taken);
                entries.push(entry);
            }
            EntryChange::Update { target_id, data, .. } => {
                let index = position(&entries, lorebook_id, target_id)?;
                for (key, value) in data {
                    if key != "id" {
                        entries[index].insert(key.clone(), value.clone());
                    }
                }
            }
            EntryChange::Delete { target_id, .. } => {
                let index = position(&entries, lorebook_id, target_id)?;
                entries.remove(index);
            }
            EntryChange::Merge {
                previous_entries,
                data,
            } => {
                entries = merge_entries(lorebook_id, entries, previous_entries, data);
            }
        }

        let mut update = Map::new();
        update.insert(
            "entries".to_string(),
            Value::Array(entries.into_iter().map(Value::Object).collect()),
        );
        self.lorebooks.update(lorebook_id, update)?;
        Ok(())
    }
}

impl CommitAdapter for VaultCommitter {
    fn commit(&self, change: &ChangeRecord) -> Result<(), CommitError> {
        log::debug!(
            "COMMIT: {} {} change='{}' target={:?}",
            change.action(),
            change.entity_type(),
            change.id(),
            change.target_id()
        );
        match change.proposal() {
            Proposal::Character(c) => {
                self.commit_entity(self.characters.as_ref(), EntityType::Character, c)
            }
            Proposal::Scenario(c) => {
                self.commit_entity(self.scenarios.as_ref(), EntityType::Scenario, c)
            }
            Proposal::Lorebook { data } => {
                let mut lorebook = data.clone();
                lorebook
                    .entry("entries".to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                self.lorebooks.add(lorebook)?;
                Ok(())
            }
            Proposal::LorebookEntry {
                lorebook_id,
                change,
            } => self.commit_entry(lorebook_id, change),
        }
    }
}

fn require(store: &dyn EntityStore, entity_type: EntityType, id: &str) -> Result<(), CommitError> {
    match store.get_by_id(id)? {
        Some(_) => Ok(()),
        None => Err(CommitError::StaleTarget {
            entity_type,
            target_id: id.to_string(),
        }),
    }
}

fn entries_of(lorebook_id: &str, lorebook: &Fields) -> Result<Vec<Fields>, CommitError> {
    let corrupt = |reason: &str| CommitError::CorruptLorebook {
        lorebook_id: lorebook_id.to_string(),
        reason: reason.to_string(),
    };
    match lorebook.get("entries") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(entry) => Ok(entry.clone()),
                _ => Err(corrupt("entry is not an object")),
            })
            .collect(),
        Some(_) => Err(corrupt("entries is not an array")),
    }
}

fn position(entries: &[Fields], lorebook_id: &str, target_id: &str) -> Result<usize, CommitError> {
    entries
        .iter()
        .position(|e| entry_id(e) == Some(target_id))
        .ok_or_else(|| CommitError::StaleTarget {
            entity_type: EntityType::LorebookEntry,
            target_id: format!("{}/{}", lorebook_id, target_id),
        })
}

/// Keeps the entry's own id unless another entry of the lorebook already
/// uses it. Otherwise a fresh one is minted.
fn assign_entry_id(lorebook_id: &str, entry: &mut Fields, taken: &HashSet<&str>) {
    if let Some(id) = entry_id(entry) {
        if !taken.contains(id) {
            return;
        }
        log::warn!(
            "Entry id '{}' is already used in lorebook '{}', assigning a new one",
            id,
            lorebook_id
        );
    }
    entry.insert("id".to_string(), Value::String(Uuid::now_v7().to_string()));
}

/// Removes every source entry still present, matched by entry id, and puts
/// the merged entry where the first of them was. Sources that are already
/// gone are skipped.
fn merge_entries(
    lorebook_id: &str,
    entries: Vec<Fields>,
    previous_entries: &[Fields],
    data: &Fields,
) -> Vec<Fields> {
    let sources: HashSet<&str> = previous_entries.iter().filter_map(entry_id).collect();
    let mut merged = data.clone();
    // The merged entry may keep the id of one of its sources.
    let taken: HashSet<&str> = entries
        .iter()
        .filter_map(entry_id)
        .filter(|id| !sources.contains(id))
        .collect();
    assign_entry_id(lorebook_id, &mut merged, &taken);

    let mut result = Vec::with_capacity(entries.len());
    let mut inserted = false;
    let mut removed = 0;
    for entry in entries {
        if entry_id(&entry).is_some_and(|id| sources.contains(id)) {
            removed += 1;
            if !inserted {
                result.push(merged.clone());
                inserted = true;
            }
        } else {
            result.push(entry);
        }
    }
    if !inserted {
        result.push(merged);
    }
    if removed < sources.len() {
        log::warn!(
            "Merge into lorebook '{}' found {} of {} source entries",
            lorebook_id,
            removed,
            sources.len()
        );
    }
    result
}
