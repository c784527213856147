//! Target-fields storage for direct drivers.
//!
//! A direct driver fetches live state from its backend, but the backend
//! cannot tell which fields of a resource are orchestrator-managed. The
//! storage persists exactly that: the target-field name set per
//! `(kind, uuid)`, so observed values hash with the same field set the
//! target was created with. Fields are taken from storage, never from the
//! live object — a field set drifting over an object's lifetime would
//! silently change hashes and break convergence.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;

/// One stored target-field set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFieldItem {
    pub kind: String,
    pub uuid: Uuid,
    pub fields: BTreeSet<String>,
}

impl TargetFieldItem {
    pub fn new(kind: impl Into<String>, uuid: Uuid, fields: BTreeSet<String>) -> Self {
        Self {
            kind: kind.into(),
            uuid,
            fields,
        }
    }
}

/// Persistent map `(kind, uuid)` → target-field set.
///
/// Mutated only by the driver owning the capability kind; no cross-driver
/// writes.
pub trait TargetFieldsStorage: Send + Sync {
    /// Load persisted state. Called from the driver's `start`.
    fn load(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Persist state. Called from the driver's `finalize`.
    fn persist(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn get(&self, kind: &str, uuid: Uuid) -> Result<TargetFieldItem, StorageError>;

    fn list(&self, kind: &str) -> Result<Vec<TargetFieldItem>, StorageError>;

    /// Store an item. With `force`, an existing item is overwritten.
    fn create(&self, item: &TargetFieldItem, force: bool) -> Result<(), StorageError>;

    /// Upsert an item's field set.
    fn update(&self, item: &TargetFieldItem) -> Result<(), StorageError>;

    /// Remove an item; missing items are ignored.
    fn delete(&self, kind: &str, uuid: Uuid) -> Result<(), StorageError>;
}

/// SQLite-backed storage, durable across agent restarts.
pub struct SqliteTargetFieldsStorage {
    conn: Mutex<Connection>,
}

impl SqliteTargetFieldsStorage {
    /// Open or create a storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;

        Ok(storage)
    }

    /// Open an in-memory storage (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS target_fields (
                kind TEXT NOT NULL,
                uuid TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (kind, uuid)
            );
            "#,
        )?;

        debug!("Target-fields storage schema initialized");
        Ok(())
    }

    fn encode_fields(fields: &BTreeSet<String>) -> Result<String, StorageError> {
        Ok(serde_json::to_string(fields)?)
    }

    fn decode_fields(raw: &str) -> Result<BTreeSet<String>, StorageError> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl TargetFieldsStorage for SqliteTargetFieldsStorage {
    fn get(&self, kind: &str, uuid: Uuid) -> Result<TargetFieldItem, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let raw: Option<String> = conn
            .query_row(
                "SELECT fields FROM target_fields WHERE kind = ?1 AND uuid = ?2",
                params![kind, uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(TargetFieldItem::new(kind, uuid, Self::decode_fields(&raw)?)),
            None => Err(StorageError::NotFound {
                kind: kind.to_string(),
                uuid,
            }),
        }
    }

    fn list(&self, kind: &str) -> Result<Vec<TargetFieldItem>, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT uuid, fields FROM target_fields WHERE kind = ?1 ORDER BY uuid")?;

        let rows = stmt.query_map(params![kind], |row| {
            let uuid: String = row.get(0)?;
            let fields: String = row.get(1)?;
            Ok((uuid, fields))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (raw_uuid, fields) = row?;
            let uuid: Uuid = raw_uuid.parse().map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("malformed uuid in storage: {raw_uuid}"),
                ))
            })?;
            items.push(TargetFieldItem::new(kind, uuid, Self::decode_fields(&fields)?));
        }

        Ok(items)
    }

    fn create(&self, item: &TargetFieldItem, force: bool) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let now = chrono::Utc::now().timestamp();
        let fields = Self::encode_fields(&item.fields)?;

        if force {
            conn.execute(
                r#"
                INSERT INTO target_fields (kind, uuid, fields, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(kind, uuid) DO UPDATE SET
                    fields = excluded.fields,
                    updated_at = excluded.updated_at
                "#,
                params![item.kind, item.uuid.to_string(), fields, now],
            )?;
            return Ok(());
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO target_fields (kind, uuid, fields, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![item.kind, item.uuid.to_string(), fields, now],
        )?;

        if inserted == 0 {
            return Err(StorageError::AlreadyExists {
                kind: item.kind.clone(),
                uuid: item.uuid,
            });
        }
        Ok(())
    }

    fn update(&self, item: &TargetFieldItem) -> Result<(), StorageError> {
        // Upsert: an update for a missing item recreates it.
        self.create(item, true)
    }

    fn delete(&self, kind: &str, uuid: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "DELETE FROM target_fields WHERE kind = ?1 AND uuid = ?2",
            params![kind, uuid.to_string()],
        )?;
        Ok(())
    }
}

/// In-memory storage for tests and ephemeral agents.
#[derive(Default)]
pub struct InMemoryTargetFieldsStorage {
    items: Mutex<BTreeMap<(String, Uuid), BTreeSet<String>>>,
}

impl InMemoryTargetFieldsStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TargetFieldsStorage for InMemoryTargetFieldsStorage {
    fn get(&self, kind: &str, uuid: Uuid) -> Result<TargetFieldItem, StorageError> {
        let items = self.items.lock().expect("storage mutex poisoned");
        items
            .get(&(kind.to_string(), uuid))
            .map(|fields| TargetFieldItem::new(kind, uuid, fields.clone()))
            .ok_or_else(|| StorageError::NotFound {
                kind: kind.to_string(),
                uuid,
            })
    }

    fn list(&self, kind: &str) -> Result<Vec<TargetFieldItem>, StorageError> {
        let items = self.items.lock().expect("storage mutex poisoned");
        Ok(items
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|((k, uuid), fields)| TargetFieldItem::new(k.clone(), *uuid, fields.clone()))
            .collect())
    }

    fn create(&self, item: &TargetFieldItem, force: bool) -> Result<(), StorageError> {
        let mut items = self.items.lock().expect("storage mutex poisoned");
        let key = (item.kind.clone(), item.uuid);
        if !force && items.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                kind: item.kind.clone(),
                uuid: item.uuid,
            });
        }
        items.insert(key, item.fields.clone());
        Ok(())
    }

    fn update(&self, item: &TargetFieldItem) -> Result<(), StorageError> {
        self.create(item, true)
    }

    fn delete(&self, kind: &str, uuid: Uuid) -> Result<(), StorageError> {
        let mut items = self.items.lock().expect("storage mutex poisoned");
        items.remove(&(kind.to_string(), uuid));
        Ok(())
    }
}
