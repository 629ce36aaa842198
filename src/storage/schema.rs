use anyhow::{Context, Result};
use rusqlite::Connection;

/// Key-value table backing the local note store.
pub fn apply_local(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .context("applying local store schema")?;
    Ok(())
}

/// Per-user note documents, keyed the way the cloud store keys them.
pub fn apply_documents(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            user_id TEXT NOT NULL,
            note_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            written_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, note_id)
        );

        CREATE INDEX IF NOT EXISTS documents_by_user ON documents(user_id);
        "#,
    )
    .context("applying document store schema")?;
    Ok(())
}
