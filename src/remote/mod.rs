use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use thiserror::Error;

use crate::app::state::{Note, NoteId};
use crate::session::UserId;

mod sqlite;

pub use sqlite::SqliteDocumentStore;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("note {note_id} not found for user {user}")]
    NotFound { user: UserId, note_id: NoteId },
    #[error("document store backend failed: {0}")]
    Backend(#[from] rusqlite::Error),
}

impl RemoteError {
    /// Whether another attempt can succeed without the caller changing
    /// anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Unavailable(_) | RemoteError::Backend(_) => true,
            RemoteError::NotFound { .. } => false,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Per-user collection of note documents keyed by note id.
pub trait DocumentStore: Send + Sync {
    fn list_notes(&self, user: &UserId) -> RemoteResult<Vec<Note>>;
    /// Overwrites every given document; others are left alone.
    fn put_all(&self, user: &UserId, notes: &[Note]) -> RemoteResult<()>;
    fn put(&self, user: &UserId, note: &Note) -> RemoteResult<()>;
    /// Updates an existing document; fails with `NotFound` if it is missing.
    fn patch(&self, user: &UserId, note: &Note) -> RemoteResult<()>;
    fn remove(&self, user: &UserId, note_id: NoteId) -> RemoteResult<()>;
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// In-process document store with failure injection.
#[derive(Default)]
pub struct MemoryDocumentStore {
    users: Mutex<HashMap<UserId, BTreeMap<NoteId, Note>>>,
    failures: Mutex<u32>,
    offline: Mutex<bool>,
    list_hook: Mutex<Option<Hook>>,
    write_hook: Mutex<Option<Hook>>,
    writes: Mutex<u64>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, user: &UserId, notes: impl IntoIterator<Item = Note>) {
        let mut users = self.users.lock();
        let docs = users.entry(user.clone()).or_default();
        for note in notes {
            docs.insert(note.id, note);
        }
    }

    pub fn snapshot(&self, user: &UserId) -> Vec<Note> {
        self.users
            .lock()
            .get(user)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes the next `count` calls fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    /// Runs `hook` inside every `list_notes` call, before reading.
    pub fn set_list_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.list_hook.lock() = Some(Box::new(hook));
    }

    /// Runs `hook` at the start of every write call; may block.
    pub fn set_write_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.write_hook.lock() = Some(Box::new(hook));
    }

    pub fn write_count(&self) -> u64 {
        *self.writes.lock()
    }

    fn check_available(&self) -> RemoteResult<()> {
        if *self.offline.lock() {
            return Err(RemoteError::Unavailable("offline".into()));
        }
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(RemoteError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn begin_write(&self) -> RemoteResult<()> {
        if let Some(hook) = self.write_hook.lock().as_ref() {
            hook();
        }
        *self.writes.lock() += 1;
        self.check_available()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn list_notes(&self, user: &UserId) -> RemoteResult<Vec<Note>> {
        if let Some(hook) = self.list_hook.lock().as_ref() {
            hook();
        }
        self.check_available()?;
        Ok(self.snapshot(user))
    }

    fn put_all(&self, user: &UserId, notes: &[Note]) -> RemoteResult<()> {
        self.begin_write()?;
        self.seed(user, notes.iter().cloned());
        Ok(())
    }

    fn put(&self, user: &UserId, note: &Note) -> RemoteResult<()> {
        self.begin_write()?;
        self.seed(user, [note.clone()]);
        Ok(())
    }

    fn patch(&self, user: &UserId, note: &Note) -> RemoteResult<()> {
        self.begin_write()?;
        let mut users = self.users.lock();
        let slot = users
            .get_mut(user)
            .and_then(|docs| docs.get_mut(&note.id))
            .ok_or_else(|| RemoteError::NotFound {
                user: user.clone(),
                note_id: note.id,
            })?;
        *slot = note.clone();
        Ok(())
    }

    fn remove(&self, user: &UserId, note_id: NoteId) -> RemoteResult<()> {
        self.begin_write()?;
        if let Some(docs) = self.users.lock().get_mut(user) {
            docs.remove(&note_id);
        }
        Ok(())
    }
}
