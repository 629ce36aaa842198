use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use time::OffsetDateTime;

use crate::app::state::{Note, NoteCollection, NoteId};
use crate::config::StorageOptions;

pub(crate) mod schema;

pub const NOTES_KEY: &str = "notes";
pub const ACTIVE_NOTE_KEY: &str = "activeNoteId";
pub const SESSION_KEY: &str = "session";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local store backend failed: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("malformed value stored under `{key}`: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding value for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// String key-value persistence for the signed-out note collection.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Reads the saved collection. `Ok(None)` means nothing was ever saved.
pub fn load_notes(store: &dyn LocalStore) -> StoreResult<Option<NoteCollection>> {
    let Some(notes) = load_saved_notes(store)? else {
        return Ok(None);
    };
    let active = match store.get(ACTIVE_NOTE_KEY)? {
        Some(raw) => serde_json::from_str::<Option<NoteId>>(&raw).map_err(|source| {
            StoreError::Malformed {
                key: ACTIVE_NOTE_KEY.to_string(),
                source,
            }
        })?,
        None => None,
    };
    Ok(Some(NoteCollection::from_parts(notes, active)))
}

pub fn load_saved_notes(store: &dyn LocalStore) -> StoreResult<Option<Vec<Note>>> {
    let Some(raw) = store.get(NOTES_KEY)? else {
        return Ok(None);
    };
    serde_json::from_str::<Vec<Note>>(&raw)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            key: NOTES_KEY.to_string(),
            source,
        })
}

pub fn save_notes(store: &dyn LocalStore, notes: &NoteCollection) -> StoreResult<()> {
    let encoded = serde_json::to_string(&notes.to_vec()).map_err(|source| StoreError::Encode {
        key: NOTES_KEY.to_string(),
        source,
    })?;
    let active = serde_json::to_string(&notes.active_id()).map_err(|source| {
        StoreError::Encode {
            key: ACTIVE_NOTE_KEY.to_string(),
            source,
        }
    })?;
    store.set(NOTES_KEY, &encoded)?;
    store.set(ACTIVE_NOTE_KEY, &active)?;
    Ok(())
}

#[derive(Clone)]
pub struct SqliteLocalStore {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl SqliteLocalStore {
    pub fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&*self.db_path)?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    fn with_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

impl LocalStore for SqliteLocalStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_connection(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_connection(|conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl<T: LocalStore + ?Sized> LocalStore for Arc<T> {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).set(key, value)
    }
}

pub fn init(db_path: &Path, storage: &StorageOptions) -> Result<SqliteLocalStore> {
    let conn = open_database(db_path, storage)?;
    schema::apply_local(&conn)?;
    Ok(SqliteLocalStore {
        db_path: Arc::new(db_path.to_path_buf()),
        options: Arc::new(storage.clone()),
    })
}

pub(crate) fn open_database(db_path: &Path, storage: &StorageOptions) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)
        .with_context(|| format!("configuring database {}", db_path.display()))?;
    Ok(conn)
}

pub(crate) fn prepare_connection(
    conn: &Connection,
    storage: &StorageOptions,
) -> rusqlite::Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )?;
    Ok(())
}
