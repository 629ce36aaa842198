use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use rusqlite::{params, Connection};
use time::OffsetDateTime;

use super::{DocumentStore, RemoteError, RemoteResult};
use crate::app::state::{Note, NoteId};
use crate::config::StorageOptions;
use crate::session::UserId;
use crate::storage::{open_database, prepare_connection, schema};

/// Document store kept in a SQLite file, standing in for the hosted one.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl SqliteDocumentStore {
    pub fn open(db_path: &Path, storage: &StorageOptions) -> Result<Self> {
        let conn = open_database(db_path, storage)?;
        schema::apply_documents(&conn)?;
        Ok(Self {
            db_path: Arc::new(db_path.to_path_buf()),
            options: Arc::new(storage.clone()),
        })
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    fn with_connection<F, T>(&self, f: F) -> RemoteResult<T>
    where
        F: FnOnce(&mut Connection) -> RemoteResult<T>,
    {
        let mut conn = Connection::open(&*self.db_path)?;
        prepare_connection(&conn, &self.options)?;
        f(&mut conn)
    }
}

fn upsert(conn: &Connection, user: &UserId, note: &Note, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO documents (user_id, note_id, title, content, written_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id, note_id) DO UPDATE SET title = excluded.title,
                                                     content = excluded.content,
                                                     written_at = excluded.written_at",
        params![user.as_str(), note.id, note.title, note.content, now],
    )
}

impl DocumentStore for SqliteDocumentStore {
    fn list_notes(&self, user: &UserId) -> RemoteResult<Vec<Note>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT note_id, title, content
                 FROM documents
                 WHERE user_id = ?1
                 ORDER BY note_id",
            )?;
            let notes = stmt
                .query_map([user.as_str()], |row| {
                    Ok(Note {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(notes)
        })
    }

    fn put_all(&self, user: &UserId, notes: &[Note]) -> RemoteResult<()> {
        self.with_connection(|conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            let tx = conn.transaction()?;
            for note in notes {
                upsert(&tx, user, note, now)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn put(&self, user: &UserId, note: &Note) -> RemoteResult<()> {
        self.with_connection(|conn| {
            upsert(conn, user, note, OffsetDateTime::now_utc().unix_timestamp())?;
            Ok(())
        })
    }

    fn patch(&self, user: &UserId, note: &Note) -> RemoteResult<()> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE documents
                 SET title = ?3, content = ?4, written_at = ?5
                 WHERE user_id = ?1 AND note_id = ?2",
                params![
                    user.as_str(),
                    note.id,
                    note.title,
                    note.content,
                    OffsetDateTime::now_utc().unix_timestamp()
                ],
            )?;
            if changed == 0 {
                return Err(RemoteError::NotFound {
                    user: user.clone(),
                    note_id: note.id,
                });
            }
            Ok(())
        })
    }

    fn remove(&self, user: &UserId, note_id: NoteId) -> RemoteResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM documents WHERE user_id = ?1 AND note_id = ?2",
                params![user.as_str(), note_id],
            )?;
            Ok(())
        })
    }
}
