use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cairn_core::{Entity, EntityRef, Location, UpdateLogEvent, UpdateStatus};
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::{EntityStore, EntityTx, StoreError, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS locations (
    id     TEXT PRIMARY KEY,
    type   TEXT NOT NULL,
    target TEXT NOT NULL,
    UNIQUE (type, target)
);
CREATE TABLE IF NOT EXISTS entities (
    uid         TEXT PRIMARY KEY,
    etag        TEXT NOT NULL,
    generation  INTEGER NOT NULL,
    namespace   TEXT NOT NULL,
    name        TEXT NOT NULL,
    location_id TEXT,
    data        TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_ns_name ON entities(namespace, name);
CREATE TABLE IF NOT EXISTS location_update_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    location_id    TEXT NOT NULL,
    status         TEXT NOT NULL,
    component_name TEXT,
    message        TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_update_log_location ON location_update_log(location_id, id DESC);
";

/// SQLite-backed store. One connection guarded by a mutex; write transactions
/// are opened IMMEDIATE so concurrent processes serialize on the write lock.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> StoreResult<Self> {
        let path = std::env::var("CAIRN_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> StoreResult<Self> {
        let started = Instant::now();
        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "opened sqlite store");
        Ok(me)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> StoreResult<Self> {
        db.busy_timeout(Duration::from_millis(busy_timeout_ms()))?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn location(&self, id: &str) -> StoreResult<Option<Location>> {
        let db = self.lock();
        let row = db
            .query_row("SELECT id, type, target FROM locations WHERE id = ?1", [id], |row| {
                Ok(Location { id: row.get(0)?, kind: row.get(1)?, target: row.get(2)? })
            })
            .optional()?;
        Ok(row)
    }

    /// Register a location. Adding the same `(type, target)` twice returns the
    /// existing row.
    pub fn add_location(&self, kind: &str, target: &str) -> StoreResult<Location> {
        if kind.is_empty() || target.is_empty() {
            return Err(StoreError::InvalidInput("location type and target must be non-empty".into()));
        }
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO locations(id, type, target) VALUES (?1, ?2, ?3)",
            params![uuid::Uuid::new_v4().to_string(), kind, target],
        )?;
        let loc = tx.query_row(
            "SELECT id, type, target FROM locations WHERE type = ?1 AND target = ?2",
            params![kind, target],
            |row| Ok(Location { id: row.get(0)?, kind: row.get(1)?, target: row.get(2)? }),
        )?;
        tx.commit()?;
        Ok(loc)
    }

    /// Remove a location. Entities it produced stay in the catalog, detached.
    pub fn remove_location(&self, id: &str) -> StoreResult<bool> {
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("UPDATE entities SET location_id = NULL WHERE location_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM locations WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn entities(&self) -> StoreResult<Vec<Entity>> {
        let db = self.lock();
        let mut stmt = db.prepare("SELECT data FROM entities ORDER BY namespace, name")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }

    pub fn entity_by_ref(&self, r: &EntityRef) -> StoreResult<Option<Entity>> {
        let db = self.lock();
        select_entity(&db, &r.name, r.namespace.as_deref())
    }

    pub fn entity_by_uid(&self, uid: &str) -> StoreResult<Option<Entity>> {
        let db = self.lock();
        let data: Option<String> =
            db.query_row("SELECT data FROM entities WHERE uid = ?1", [uid], |row| row.get(0)).optional()?;
        data.map(|d| serde_json::from_str(&d)).transpose().map_err(StoreError::from)
    }

    /// Location id that last wrote the entity with `uid`.
    pub fn entity_location(&self, uid: &str) -> StoreResult<Option<String>> {
        let db = self.lock();
        let loc: Option<Option<String>> =
            db.query_row("SELECT location_id FROM entities WHERE uid = ?1", [uid], |row| row.get(0)).optional()?;
        Ok(loc.flatten())
    }

    /// Most recent update log events for a location, newest first.
    pub fn location_update_log(&self, location_id: &str, limit: usize) -> StoreResult<Vec<UpdateLogEvent>> {
        let db = self.lock();
        let mut stmt = db.prepare(
            "SELECT id, location_id, status, component_name, message, created_at
             FROM location_update_log WHERE location_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![location_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(2)?;
            let created_at: String = row.get(5)?;
            out.push(UpdateLogEvent {
                id: row.get(0)?,
                location_id: row.get(1)?,
                status: UpdateStatus::parse(&status)
                    .ok_or_else(|| StoreError::InvalidInput(format!("unknown update status {:?}", status)))?,
                component_name: row.get(3)?,
                message: row.get(4)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&chrono::Utc))
                    .map_err(|e| StoreError::InvalidInput(format!("bad created_at {:?}: {}", created_at, e)))?,
            });
        }
        Ok(out)
    }
}

impl EntityStore for SqliteStore {
    fn locations(&self) -> StoreResult<Vec<Location>> {
        let db = self.lock();
        let mut stmt = db.prepare("SELECT id, type, target FROM locations ORDER BY rowid")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Location { id: row.get(0)?, kind: row.get(1)?, target: row.get(2)? });
        }
        Ok(out)
    }

    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn EntityTx) -> StoreResult<T>,
    {
        let started = Instant::now();
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Dropping `tx` without commit rolls back.
        let out = f(&mut SqliteTx { tx: &tx })?;
        tx.commit()?;
        histogram!("persist_tx_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn add_location_update_log_event(
        &self,
        location_id: &str,
        status: UpdateStatus,
        component_name: Option<&str>,
        message: Option<&str>,
    ) -> StoreResult<()> {
        let db = self.lock();
        db.execute(
            "INSERT INTO location_update_log(location_id, status, component_name, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![location_id, status.as_str(), component_name, message, chrono::Utc::now().to_rfc3339()],
        )?;
        counter!("persist_update_log_total", 1u64);
        Ok(())
    }
}

struct SqliteTx<'t, 'c> {
    tx: &'t rusqlite::Transaction<'c>,
}

impl EntityTx for SqliteTx<'_, '_> {
    fn entity(&mut self, name: &str, namespace: Option<&str>) -> StoreResult<Option<Entity>> {
        select_entity(self.tx, name, namespace)
    }

    fn add_entity(&mut self, location_id: &str, entity: &Entity) -> StoreResult<()> {
        if entity.metadata.uid.is_some() {
            return Err(StoreError::InvalidInput("new entities may not carry a uid".into()));
        }
        let name = entity
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::InvalidInput("entity has no metadata.name".into()))?;
        let mut row = entity.clone();
        let uid = uuid::Uuid::new_v4().to_string();
        row.metadata.uid = Some(uid.clone());
        row.metadata.etag = Some(new_etag());
        row.metadata.generation = Some(1);
        self.tx.execute(
            "INSERT INTO entities(uid, etag, generation, namespace, name, location_id, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uid,
                row.metadata.etag,
                1i64,
                ns_key(row.metadata.namespace.as_deref()),
                name,
                location_id,
                serde_json::to_string(&row)?,
            ],
        )?;
        counter!("persist_entity_insert_total", 1u64);
        Ok(())
    }

    fn update_entity(&mut self, location_id: &str, entity: &Entity) -> StoreResult<()> {
        let uid = entity
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| StoreError::InvalidInput("updated entities must carry a uid".into()))?;
        let name = entity
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::InvalidInput("entity has no metadata.name".into()))?;
        let current: Option<(i64, Option<String>, String)> = self
            .tx
            .query_row(
                "SELECT generation, location_id, data FROM entities WHERE uid = ?1",
                [uid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((generation, current_location, data)) = current else {
            return Err(StoreError::NotFound(format!("entity uid {}", uid)));
        };
        if let Some(expected) = entity.metadata.generation {
            if expected as i64 != generation {
                return Err(StoreError::Conflict(format!(
                    "generation mismatch for {}: expected {}, stored {}",
                    uid, expected, generation
                )));
            }
        }
        let stored: Entity = serde_json::from_str(&data)?;

        let mut next = entity.clone();
        let next_generation = if next.spec != stored.spec { generation + 1 } else { generation };
        next.metadata.generation = Some(next_generation as u64);
        next.metadata.etag = stored.metadata.etag.clone();
        if next == stored && current_location.as_deref() == Some(location_id) {
            return Ok(());
        }
        if next != stored {
            next.metadata.etag = Some(new_etag());
        }

        let n = self.tx.execute(
            "UPDATE entities
             SET etag = ?3, generation = ?4, namespace = ?5, name = ?6, location_id = ?7, data = ?8
             WHERE uid = ?1 AND generation = ?2",
            params![
                uid,
                generation,
                next.metadata.etag,
                next_generation,
                ns_key(next.metadata.namespace.as_deref()),
                name,
                location_id,
                serde_json::to_string(&next)?,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::Conflict(format!("entity {} changed concurrently", uid)));
        }
        counter!("persist_entity_update_total", 1u64);
        Ok(())
    }
}

fn select_entity(db: &Connection, name: &str, namespace: Option<&str>) -> StoreResult<Option<Entity>> {
    let data: Option<String> = db
        .query_row(
            "SELECT data FROM entities WHERE namespace = ?1 AND name = ?2",
            params![ns_key(namespace), name],
            |row| row.get(0),
        )
        .optional()?;
    data.map(|d| serde_json::from_str(&d)).transpose().map_err(StoreError::from)
}

/// Absent namespace is stored as the empty string so the unique index holds.
fn ns_key(namespace: Option<&str>) -> &str {
    namespace.unwrap_or("")
}

fn new_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn busy_timeout_ms() -> u64 {
    std::env::var("CAIRN_BUSY_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(5_000)
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".cairn");
        let _ = std::fs::create_dir_all(&p);
        p.push("cairn.db");
        return p.to_string_lossy().to_string();
    }
    "cairn.db".to_string()
}
