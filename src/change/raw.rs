use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ChangeRecord, EntityChange, EntityType, EntryChange, Fields, Proposal};
use crate::error::ValidationError;

/// The loosely shaped change an assistant attaches to a tool call. Every
/// field is optional here; `ChangeRecord::try_from` decides which ones the
/// entity type and action actually require.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChange {
    #[serde(default)]
    pub id: Option<String>,
    pub entity_type: String,
    pub action: String,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub lorebook_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub previous: Option<Value>,
    #[serde(default)]
    pub previous_entries: Option<Vec<Value>>,
}

impl RawChange {
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    fn entity_type(&self) -> Result<EntityType, ValidationError> {
        match self.entity_type.as_str() {
            "character" => Ok(EntityType::Character),
            "scenario" => Ok(EntityType::Scenario),
            "lorebook" => Ok(EntityType::Lorebook),
            "lorebook-entry" | "lorebook_entry" | "entry" => Ok(EntityType::LorebookEntry),
            other => Err(ValidationError::UnknownEntityType(other.to_string())),
        }
    }

    fn unsupported(&self, entity_type: EntityType) -> ValidationError {
        ValidationError::UnsupportedAction {
            entity_type,
            action: self.action.clone(),
        }
    }

    fn data(&self) -> Result<Fields, ValidationError> {
        object(self.data.as_ref(), "data")
    }

    fn previous(&self) -> Result<Fields, ValidationError> {
        object(self.previous.as_ref(), "previous")
    }

    fn target_id(&self) -> Result<String, ValidationError> {
        self.target_id
            .clone()
            .ok_or(ValidationError::MissingField("targetId"))
    }

    fn entity_change(&self) -> Result<EntityChange, ValidationError> {
        Ok(match self.action.as_str() {
            "create" => EntityChange::Create { data: self.data()? },
            "update" => EntityChange::Update {
                target_id: self.target_id()?,
                data: self.data()?,
                previous: self.previous()?,
            },
            "delete" => EntityChange::Delete {
                target_id: self.target_id()?,
                previous: self.previous()?,
            },
            "merge" => return Err(self.unsupported(self.entity_type()?)),
            other => return Err(ValidationError::UnknownAction(other.to_string())),
        })
    }

    fn entry_change(&self) -> Result<EntryChange, ValidationError> {
        Ok(match self.action.as_str() {
            "create" => EntryChange::Create { data: self.data()? },
            "update" => EntryChange::Update {
                target_id: self.target_id()?,
                data: self.data()?,
                previous: self.previous()?,
            },
            "delete" => EntryChange::Delete {
                target_id: self.target_id()?,
                previous: self.previous()?,
            },
            "merge" => {
                let entries = self
                    .previous_entries
                    .as_ref()
                    .ok_or(ValidationError::MissingField("previousEntries"))?;
                let previous_entries = entries
                    .iter()
                    .map(|entry| object(Some(entry), "previousEntries"))
                    .collect::<Result<Vec<_>, _>>()?;
                EntryChange::Merge {
                    previous_entries,
                    data: self.data()?,
                }
            }
            other => return Err(ValidationError::UnknownAction(other.to_string())),
        })
    }
}

fn object(value: Option<&Value>, field: &'static str) -> Result<Fields, ValidationError> {
    match value {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(ValidationError::NotAnObject(field)),
        None => Err(ValidationError::MissingField(field)),
    }
}

impl TryFrom<RawChange> for ChangeRecord {
    type Error = ValidationError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        let entity_type = raw.entity_type()?;
        let proposal = match entity_type {
            EntityType::Character => Proposal::Character(raw.entity_change()?),
            EntityType::Scenario => Proposal::Scenario(raw.entity_change()?),
            EntityType::Lorebook => match raw.action.as_str() {
                "create" => Proposal::Lorebook { data: raw.data()? },
                _ => return Err(raw.unsupported(entity_type)),
            },
            EntityType::LorebookEntry => Proposal::LorebookEntry {
                lorebook_id: raw
                    .lorebook_id
                    .clone()
                    .ok_or(ValidationError::MissingField("lorebookId"))?,
                change: raw.entry_change()?,
            },
        };
        match raw.id.filter(|id| !id.is_empty()) {
            Some(id) => ChangeRecord::with_id(id, proposal),
            None => ChangeRecord::new(proposal),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::change::Action;

    #[test]
    fn parses_character_update() {
        let raw = RawChange::from_value(json!({
            "id": "chg-1",
            "entityType": "character",
            "action": "update",
            "targetId": "c1",
            "data": {"name": "Anna"},
            "previous": {"id": "c1", "name": "Ana"}
        }))
        .unwrap();
        let record = ChangeRecord::try_from(raw).unwrap();
        assert_eq!(record.id(), "chg-1");
        assert_eq!(record.entity_type(), EntityType::Character);
        assert_eq!(record.action(), Action::Update);
        assert_eq!(record.target_id(), Some("c1"));
    }

    #[test]
    fn parses_entry_merge() {
        let raw = RawChange::from_value(json!({
            "entityType": "lorebook-entry",
            "action": "merge",
            "lorebookId": "lb1",
            "previousEntries": [{"id": "e1"}, {"id": "e2"}],
            "data": {"name": "Dragons"}
        }))
        .unwrap();
        let record = ChangeRecord::try_from(raw).unwrap();
        assert_eq!(record.action(), Action::Merge);
        assert_eq!(record.previous_entries().unwrap().len(), 2);
        assert!(!record.id().is_empty());
    }

    #[test]
    fn rejects_bad_shapes() {
        let cases = [
            (
                json!({"entityType": "spaceship", "action": "create", "data": {}}),
                ValidationError::UnknownEntityType("spaceship".to_string()),
            ),
            (
                json!({"entityType": "character", "action": "merge", "data": {}}),
                ValidationError::UnsupportedAction {
                    entity_type: EntityType::Character,
                    action: "merge".to_string(),
                },
            ),
            (
                json!({"entityType": "lorebook", "action": "delete", "targetId": "lb1"}),
                ValidationError::UnsupportedAction {
                    entity_type: EntityType::Lorebook,
                    action: "delete".to_string(),
                },
            ),
            (
                json!({"entityType": "scenario", "action": "update", "targetId": "s1", "data": {}}),
                ValidationError::MissingField("previous"),
            ),
            (
                json!({
                    "entityType": "character",
                    "action": "update",
                    "targetId": "c1",
                    "data": {},
                    "previous": {"id": "c1"}
                }),
                ValidationError::MissingField("data"),
            ),
            (
                json!({"entityType": "character", "action": "create", "data": "Anna"}),
                ValidationError::NotAnObject("data"),
            ),
            (
                json!({"entityType": "lorebook-entry", "action": "create", "data": {}}),
                ValidationError::MissingField("lorebookId"),
            ),
            (
                json!({
                    "entityType": "lorebook-entry",
                    "action": "merge",
                    "lorebookId": "lb1",
                    "previousEntries": [{"id": "e1"}],
                    "data": {}
                }),
                ValidationError::MergeTooSmall(1),
            ),
        ];
        for (value, expected) in cases {
            let raw = RawChange::from_value(value).unwrap();
            assert_eq!(ChangeRecord::try_from(raw).unwrap_err(), expected);
        }
    }

    #[test]
    fn rejects_missing_tags() {
        let err = RawChange::from_value(json!({"action": "create"})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }
}
