use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

use super::types::{ChangeRecord, Fields, Proposal};

/// One field that differs between the vault and a proposed change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeRecord {
    /// Field-level differences for rendering a diff card, sorted by field
    /// name. Updates are diffed against the untouched `previous` snapshot, so
    /// user edits show up here as well.
    pub fn diff(&self) -> Vec<FieldDiff> {
        let proposal = self.proposal();
        match (proposal.previous(), proposal.data()) {
            (Some(previous), Some(data)) => diff_update(previous, data),
            (Some(previous), None) => diff_fields(Some(previous), None),
            (None, Some(data)) => match proposal {
                Proposal::LorebookEntry { .. } if proposal.previous_entries().is_some() => {
                    let combined = combine(proposal.previous_entries().unwrap_or_default());
                    diff_fields(Some(&combined), Some(data))
                }
                _ => diff_fields(None, Some(data)),
            },
            (None, None) => Vec::new(),
        }
    }
}

/// Only the keys an update touches are compared.
fn diff_update(previous: &Fields, data: &Fields) -> Vec<FieldDiff> {
    let mut diffs = data
        .iter()
        .filter(|(key, value)| previous.get(key.as_str()) != Some(value))
        .map(|(key, value)| FieldDiff {
            field: key.clone(),
            before: previous.get(key.as_str()).cloned(),
            after: Some(value.clone()),
        })
        .collect::<Vec<_>>();
    diffs.sort_by(|a, b| a.field.cmp(&b.field));
    diffs
}

fn diff_fields(old: Option<&Fields>, new: Option<&Fields>) -> Vec<FieldDiff> {
    let empty = Fields::new();
    let old_obj = old.unwrap_or(&empty);
    let new_obj = new.unwrap_or(&empty);

    let mut all_keys = BTreeSet::new();
    all_keys.extend(old_obj.keys());
    all_keys.extend(new_obj.keys());

    let mut changes = Vec::new();
    for key in all_keys {
        let old_val = old_obj.get(key).filter(|v| !v.is_null());
        let new_val = new_obj.get(key).filter(|v| !v.is_null());
        if old_val != new_val {
            changes.push(FieldDiff {
                field: key.clone(),
                before: old_val.cloned(),
                after: new_val.cloned(),
            });
        }
    }
    changes
}

/// Folds merge sources into one object for display. Text fields that differ
/// between sources are joined with blank lines.
fn combine(entries: &[Fields]) -> Fields {
    let mut combined = Fields::new();
    for entry in entries {
        for (key, value) in entry {
            if let Some(existing) = combined.get_mut(key) {
                if let (Value::String(existing), Value::String(next)) = (existing, value) {
                    if key != "id" && *existing != *next {
                        existing.push_str("\n\n");
                        existing.push_str(next);
                    }
                }
                continue;
            }
            combined.insert(key.clone(), value.clone());
        }
    }
    combined
}
