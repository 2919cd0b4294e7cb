use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::change::{entry_id, Fields};

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteVault, StoredChange};

pub mod memory;
pub mod sqlite;

/// A persisted collection of characters, scenarios or lorebooks. Once a
/// change is committed the store is the source of truth.
pub trait EntityStore: Send + Sync {
    /// Inserts a new entity and returns it as stored. A non-empty `"id"` in
    /// `fields` is kept, otherwise one is generated.
    fn add(&self, fields: Fields) -> Result<Fields>;

    /// Shallow-merges `fields` into the entity. Keys not present in `fields`
    /// are left alone. Fails when `id` is unknown.
    fn update(&self, id: &str, fields: Fields) -> Result<()>;

    /// Fails when `id` is unknown.
    fn delete(&self, id: &str) -> Result<()>;

    fn get_by_id(&self, id: &str) -> Result<Option<Fields>>;

    fn list(&self) -> Result<Vec<Fields>>;
}

/// Gives the entity a UUIDv7 `"id"` unless it already carries one, and
/// returns the id.
pub(crate) fn ensure_id(fields: &mut Fields) -> String {
    if let Some(id) = entry_id(fields) {
        return id.to_string();
    }
    let id = Uuid::now_v7().to_string();
    fields.insert("id".to_string(), Value::String(id.clone()));
    id
}

/// Applies a partial update the way every store does: top-level keys are
/// replaced, the `"id"` is never changed.
pub(crate) fn apply_partial(entity: &mut Fields, fields: Fields) {
    for (key, value) in fields {
        if key != "id" {
            entity.insert(key, value);
        }
    }
}
