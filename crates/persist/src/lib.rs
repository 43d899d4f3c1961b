//! Cairn persistence: the entity store contract and its SQLite backend.
//!
//! Everything here is synchronous. Callers on an async runtime treat each call
//! as a blocking point; the refresh loop is sequential so this stays cheap.

#![forbid(unsafe_code)]

use cairn_core::{Entity, Location, UpdateStatus};

mod sqlite;

pub use sqlite::{default_db_path, SqliteStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lost a race against another writer (unique key, stale generation, busy db).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("sqlite: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => StoreError::Conflict(e.to_string()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Conflict(e.to_string()),
            _ => StoreError::Sqlite(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Entity reads and writes scoped to one open transaction.
pub trait EntityTx {
    /// Look up the stored entity for `(name, namespace)`.
    fn entity(&mut self, name: &str, namespace: Option<&str>) -> StoreResult<Option<Entity>>;

    /// Insert a new entity. The store assigns `uid`, `etag` and `generation`;
    /// input carrying a `uid` is rejected.
    fn add_entity(&mut self, location_id: &str, entity: &Entity) -> StoreResult<()>;

    /// Replace the entity with the same `uid`. A present `generation` must match
    /// the stored one.
    fn update_entity(&mut self, location_id: &str, entity: &Entity) -> StoreResult<()>;
}

/// Durable storage for locations, entities and the location update log.
pub trait EntityStore: Send + Sync {
    /// All known locations, in the order they were added.
    fn locations(&self) -> StoreResult<Vec<Location>>;

    /// Run `f` inside a write transaction. Commits when `f` returns `Ok`,
    /// rolls back otherwise.
    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn EntityTx) -> StoreResult<T>;

    fn add_location_update_log_event(
        &self,
        location_id: &str,
        status: UpdateStatus,
        component_name: Option<&str>,
        message: Option<&str>,
    ) -> StoreResult<()>;
}
