//! Index schema and connection setup

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

/// Open a connection to the index file with the pragmas every handle uses
pub(super) fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

/// Read-only handle; sees only committed data
pub(super) fn open_reader(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch("PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

pub(super) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    debug!("Index schema initialized");
    Ok(())
}

/// One row per (server, path). Uniqueness is kept by reconciliation, not by
/// the lookup index. Reads only return rows with `valid = 1`.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    server_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    extension TEXT NOT NULL,
    size TEXT NOT NULL,
    modified TEXT NOT NULL,
    audio_album TEXT,
    audio_artist TEXT,
    audio_title TEXT,
    audio_year TEXT,
    audio_track TEXT,
    valid INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_documents_server_path ON documents(server_id, path);

CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    path,
    name,
    extension,
    audio_album,
    audio_artist,
    audio_title,
    content='documents',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts(rowid, path, name, extension, audio_album, audio_artist, audio_title)
    VALUES (new.id, new.path, new.name, new.extension, new.audio_album, new.audio_artist, new.audio_title);
END;

CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, path, name, extension, audio_album, audio_artist, audio_title)
    VALUES ('delete', old.id, old.path, old.name, old.extension, old.audio_album, old.audio_artist, old.audio_title);
END;

CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, path, name, extension, audio_album, audio_artist, audio_title)
    VALUES ('delete', old.id, old.path, old.name, old.extension, old.audio_album, old.audio_artist, old.audio_title);
    INSERT INTO documents_fts(rowid, path, name, extension, audio_album, audio_artist, audio_title)
    VALUES (new.id, new.path, new.name, new.extension, new.audio_album, new.audio_artist, new.audio_title);
END;
"#;
