use std::sync::{Arc, RwLock};

use anyhow::Result;

use super::{apply_partial, ensure_id, EntityStore};
use crate::change::{entry_id, Fields};

/// Insertion-ordered, in-process store. Clones share the same collection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    name: String,
    entities: Arc<RwLock<Vec<Fields>>>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entities: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn position(entities: &[Fields], id: &str) -> Option<usize> {
        entities.iter().position(|e| entry_id(e) == Some(id))
    }
}

impl EntityStore for MemoryStore {
    fn add(&self, mut fields: Fields) -> Result<Fields> {
        let id = ensure_id(&mut fields);
        let mut entities = self
            .entities
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;
        if Self::position(&entities, &id).is_some() {
            anyhow::bail!("{} '{}' already exists", self.name, id);
        }
        log::debug!("STORE ADD: {} id='{}'", self.name, id);
        entities.push(fields.clone());
        Ok(fields)
    }

    fn update(&self, id: &str, fields: Fields) -> Result<()> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;
        let index = Self::position(&entities, id)
            .ok_or_else(|| anyhow::anyhow!("{} '{}' not found", self.name, id))?;
        log::debug!("STORE UPDATE: {} id='{}', {} fields", self.name, id, fields.len());
        apply_partial(&mut entities[index], fields);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;
        let index = Self::position(&entities, id)
            .ok_or_else(|| anyhow::anyhow!("{} '{}' not found", self.name, id))?;
        log::debug!("STORE DELETE: {} id='{}'", self.name, id);
        entities.remove(index);
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Fields>> {
        let entities = self
            .entities
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock"))?;
        Ok(Self::position(&entities, id).map(|index| entities[index].clone()))
    }

    fn list(&self) -> Result<Vec<Fields>> {
        let entities = self
            .entities
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock"))?;
        Ok(entities.clone())
    }
}
