use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{apply_partial, ensure_id, EntityStore};
use crate::change::Fields;

const CHARACTERS: &str = "character";
const SCENARIOS: &str = "scenario";
const LOREBOOKS: &str = "lorebook";

/// A row of the vault change log. Every store write records one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredChange {
    pub id: String,
    pub kind: String,
    pub entity_id: String,
    pub change_type: String,
    pub old_values: Option<String>,
    pub new_values: Option<String>,
    pub timestamp: i64,
}

/// SQLite-backed story vault. Entities are kept as JSON bodies keyed by
/// kind and id, and every write is logged to `vault_change` inside the same
/// transaction.
#[derive(Clone)]
pub struct SqliteVault {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVault {
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::migrations().to_latest(&mut conn)?;
        Ok(SqliteVault {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrations() -> Migrations<'static> {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE vault_entity (
                    kind TEXT NOT NULL,
                    id   TEXT NOT NULL,
                    body TEXT NOT NULL,
                    PRIMARY KEY (kind, id)
                );",
            ),
            M::up(
                "CREATE TABLE vault_change (
                    id          TEXT NOT NULL PRIMARY KEY,
                    kind        TEXT NOT NULL,
                    entity_id   TEXT NOT NULL,
                    change_type TEXT NOT NULL,
                    old_values  TEXT,
                    new_values  TEXT,
                    timestamp   INTEGER NOT NULL
                );
                CREATE INDEX idx_vault_change_entity ON vault_change (kind, entity_id);",
            ),
        ])
    }

    pub fn characters(&self) -> SqliteStore {
        self.store(CHARACTERS)
    }

    pub fn scenarios(&self) -> SqliteStore {
        self.store(SCENARIOS)
    }

    pub fn lorebooks(&self) -> SqliteStore {
        self.store(LOREBOOKS)
    }

    fn store(&self, kind: &'static str) -> SqliteStore {
        SqliteStore {
            vault: self.clone(),
            kind,
        }
    }

    /// Logged writes for one entity, oldest first.
    pub fn history(&self, kind: &str, entity_id: &str) -> Result<Vec<StoredChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, entity_id, change_type, old_values, new_values, timestamp
             FROM vault_change
             WHERE kind = ? AND entity_id = ?
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query(params![kind, entity_id])?;
        let changes =
            serde_rusqlite::from_rows::<StoredChange>(rows).collect::<Result<Vec<_>, _>>()?;
        Ok(changes)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire connection lock"))
    }

    fn read_body(tx: &Transaction, kind: &str, id: &str) -> Result<Option<String>> {
        let body = tx
            .query_row(
                "SELECT body FROM vault_entity WHERE kind = ? AND id = ?",
                params![kind, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(body)
    }

    fn record_change(
        tx: &Transaction,
        kind: &str,
        entity_id: &str,
        change_type: &str,
        old_values: Option<&str>,
        new_values: Option<&str>,
    ) -> Result<()> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_millis() as i64;

        log::debug!(
            "SQL EXECUTE: INSERT INTO vault_change ({} {} '{}')",
            change_type,
            kind,
            entity_id
        );
        let affected = tx.execute(
            "INSERT INTO vault_change
                 (id, kind, entity_id, change_type, old_values, new_values, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                Uuid::now_v7().to_string(),
                kind,
                entity_id,
                change_type,
                old_values,
                new_values,
                timestamp,
            ],
        )?;
        log::debug!("SQL EXECUTE RESULT: {} rows affected", affected);
        Ok(())
    }
}

/// One kind of entity inside a `SqliteVault`.
#[derive(Clone)]
pub struct SqliteStore {
    vault: SqliteVault,
    kind: &'static str,
}

impl SqliteStore {
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

fn parse_body(body: &str) -> Result<Fields> {
    Ok(serde_json::from_str(body)?)
}

impl EntityStore for SqliteStore {
    fn add(&self, mut fields: Fields) -> Result<Fields> {
        let id = ensure_id(&mut fields);
        let body = serde_json::to_string(&fields)?;

        let mut conn = self.vault.lock()?;
        let tx = conn.transaction()?;
        if SqliteVault::read_body(&tx, self.kind, &id)?.is_some() {
            anyhow::bail!("{} '{}' already exists", self.kind, id);
        }
        tx.execute(
            "INSERT INTO vault_entity (kind, id, body) VALUES (?, ?, ?)",
            params![self.kind, id, body],
        )?;
        SqliteVault::record_change(&tx, self.kind, &id, "Insert", None, Some(&body))?;
        tx.commit()?;
        Ok(fields)
    }

    fn update(&self, id: &str, fields: Fields) -> Result<()> {
        let mut conn = self.vault.lock()?;
        let tx = conn.transaction()?;
        let old_body = SqliteVault::read_body(&tx, self.kind, id)?
            .ok_or_else(|| anyhow::anyhow!("{} '{}' not found", self.kind, id))?;

        let mut entity = parse_body(&old_body)?;
        apply_partial(&mut entity, fields);
        let new_body = serde_json::to_string(&entity)?;

        tx.execute(
            "UPDATE vault_entity SET body = ? WHERE kind = ? AND id = ?",
            params![new_body, self.kind, id],
        )?;
        SqliteVault::record_change(&tx, self.kind, id, "Update", Some(&old_body), Some(&new_body))?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.vault.lock()?;
        let tx = conn.transaction()?;
        let old_body = SqliteVault::read_body(&tx, self.kind, id)?
            .ok_or_else(|| anyhow::anyhow!("{} '{}' not found", self.kind, id))?;

        tx.execute(
            "DELETE FROM vault_entity WHERE kind = ? AND id = ?",
            params![self.kind, id],
        )?;
        SqliteVault::record_change(&tx, self.kind, id, "Delete", Some(&old_body), None)?;
        tx.commit()?;
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Fields>> {
        let conn = self.vault.lock()?;
        let body = conn
            .query_row(
                "SELECT body FROM vault_entity WHERE kind = ? AND id = ?",
                params![self.kind, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        body.as_deref().map(parse_body).transpose()
    }

    fn list(&self) -> Result<Vec<Fields>> {
        let conn = self.vault.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM vault_entity WHERE kind = ? ORDER BY rowid")?;
        let bodies = stmt
            .query_map(params![self.kind], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies.iter().map(|body| parse_body(body)).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::change::entry_id;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn open_memory() -> Result<()> {
        let _ = SqliteVault::open_memory()?;
        Ok(())
    }

    #[test]
    fn kinds_are_separate() -> Result<()> {
        let vault = SqliteVault::open_memory()?;
        vault.characters().add(fields(json!({"id": "x", "name": "Ana"})))?;
        assert!(vault.scenarios().get_by_id("x")?.is_none());
        vault.scenarios().add(fields(json!({"id": "x", "name": "Harbor"})))?;
        assert_eq!(vault.characters().get_by_id("x")?.unwrap()["name"], "Ana");
        Ok(())
    }

    #[test]
    fn partial_update_and_history() -> Result<()> {
        let vault = SqliteVault::open_memory()?;
        let characters = vault.characters();
        let ana = characters.add(fields(json!({"name": "Ana", "age": 30})))?;
        let id = entry_id(&ana).unwrap().to_string();

        characters.update(&id, fields(json!({"name": "Anna"})))?;
        let stored = characters.get_by_id(&id)?.unwrap();
        assert_eq!(stored["name"], "Anna");
        assert_eq!(stored["age"], 30);

        characters.delete(&id)?;
        assert!(characters.get_by_id(&id)?.is_none());

        let history = vault.history("character", &id)?;
        let types: Vec<&str> = history.iter().map(|c| c.change_type.as_str()).collect();
        assert_eq!(types, vec!["Insert", "Update", "Delete"]);
        assert!(history[1].old_values.as_ref().unwrap().contains("Ana"));
        assert!(history[2].new_values.is_none());
        Ok(())
    }

    #[test]
    fn list_keeps_insertion_order() -> Result<()> {
        let vault = SqliteVault::open_memory()?;
        let lorebooks = vault.lorebooks();
        for name in ["b", "a", "c"] {
            lorebooks.add(fields(json!({"name": name})))?;
        }
        let names: Vec<String> = lorebooks
            .list()?
            .iter()
            .map(|l| l["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        Ok(())
    }

    #[test]
    fn failed_write_rolls_back() -> Result<()> {
        let vault = SqliteVault::open_memory()?;
        assert!(vault.characters().update("missing", Fields::new()).is_err());
        assert!(vault.history("character", "missing")?.is_empty());
        Ok(())
    }

    #[test]
    fn reopen_from_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vault.db");
        {
            let vault = SqliteVault::open(&path)?;
            vault.lorebooks().add(fields(json!({"id": "lb1", "entries": []})))?;
        }
        let vault = SqliteVault::open(&path)?;
        assert!(vault.lorebooks().get_by_id("lb1")?.is_some());
        Ok(())
    }
}
