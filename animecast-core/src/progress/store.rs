use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

use crate::sqlite::{open_configured, open_flags};

const STATE_SCHEMA: &str = include_str!("../../../sql/state.sql");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to create state database directory {path}: {source}")]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on state database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("state store path not configured")]
    MissingStore,
    #[error("failed to encode state value: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// Key-value storage with per-entry expiry. Writes replace the whole value.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> StateResult<Option<String>>;
    fn put(&self, key: &str, value: &str, ttl: Duration) -> StateResult<()>;
    fn forget(&self, key: &str) -> StateResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> StateResult<Option<String>> {
        let mut entries = self.entries();
        let now = Utc::now();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> StateResult<()> {
        self.entries()
            .insert(key.to_string(), (value.to_string(), Utc::now() + ttl));
        Ok(())
    }

    fn forget(&self, key: &str) -> StateResult<()> {
        self.entries().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStateStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteStateStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteStateStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StateResult<SqliteStateStore> {
        let path = self.path.ok_or(StateError::MissingStore)?;
        Ok(SqliteStateStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

/// State shared between the request side and detached transcode processes.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteStateStore {
    pub fn builder() -> SqliteStateStoreBuilder {
        SqliteStateStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StateResult<Self> {
        SqliteStateStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> StateResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| StateError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> StateResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::CreateDir {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        let conn = self.open()?;
        conn.execute_batch(STATE_SCHEMA)?;
        Ok(())
    }

    pub fn purge_expired(&self) -> StateResult<usize> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM transient_state WHERE expires_at <= ?1",
            [Utc::now()],
        )?;
        Ok(removed)
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> StateResult<Option<String>> {
        let conn = self.open()?;
        let row: Option<(String, DateTime<Utc>)> = conn
            .query_row(
                "SELECT value, expires_at FROM transient_state WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((value, expires_at)) if expires_at > Utc::now() => Ok(Some(value)),
            Some(_) => {
                conn.execute(
                    "DELETE FROM transient_state WHERE key = ?1 AND expires_at <= ?2",
                    params![key, Utc::now()],
                )?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> StateResult<()> {
        let conn = self.open()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO transient_state (key, value, expires_at, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                 expires_at = excluded.expires_at, updated_at = excluded.updated_at",
            params![key, value, now + ttl, now],
        )?;
        Ok(())
    }

    fn forget(&self, key: &str) -> StateResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM transient_state WHERE key = ?1", [key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sqlite_store(dir: &TempDir) -> SqliteStateStore {
        let store = SqliteStateStore::builder()
            .path(dir.path().join("state.sqlite"))
            .build()
            .unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn sqlite_put_replaces_whole_value() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir);
        store.put("k", "first", Duration::hours(1)).unwrap();
        store.put("k", "second", Duration::hours(1)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("second"));
        store.forget("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn expired_entries_are_invisible() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir);
        store.put("gone", "v", Duration::seconds(-1)).unwrap();
        store.put("kept", "v", Duration::hours(1)).unwrap();
        assert_eq!(store.get("gone").unwrap(), None);
        store.put("gone-too", "v", Duration::seconds(-5)).unwrap();
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.get("kept").unwrap().as_deref(), Some("v"));

        let memory = MemoryStateStore::new();
        memory.put("gone", "v", Duration::seconds(-1)).unwrap();
        assert_eq!(memory.get("gone").unwrap(), None);
    }

    #[test]
    fn initialize_reports_unusable_directory() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let store = SqliteStateStore::new(blocker.join("state.sqlite")).unwrap();
        match store.initialize() {
            Err(StateError::CreateDir { path, .. }) => assert_eq!(path, blocker),
            other => panic!("expected directory error, got {other:?}"),
        }
    }
}
