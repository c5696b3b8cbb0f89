//! Full-text index of discovered files
//!
//! SQLite with an FTS5 table. Writes are staged in memory and applied in one
//! transaction by [`SearchIndex::commit`]; reads go through a separate
//! connection and only ever see committed state.

mod queries;
mod schema;

use std::path::{Path, PathBuf};

use ftpscout_core::IndexedFile;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cannot create index directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("commit failed after reopening the write session: {0}")]
    Commit(#[source] rusqlite::Error),
}

#[derive(Debug, Clone)]
enum StagedOp {
    Add(IndexedFile),
    Delete { server_id: i64, path: String },
    DeleteServer(i64),
}

struct WriteSession {
    conn: Connection,
    staged: Vec<StagedOp>,
}

const INSERT_SQL: &str = r#"
INSERT INTO documents (
    server_id, path, name, extension, size, modified,
    audio_album, audio_artist, audio_title, audio_year, audio_track, valid
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1)
"#;

fn apply(conn: &mut Connection, ops: &[StagedOp]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare_cached(INSERT_SQL)?;
        let mut delete =
            tx.prepare_cached("DELETE FROM documents WHERE server_id = ?1 AND path = ?2")?;
        let mut delete_server = tx.prepare_cached("DELETE FROM documents WHERE server_id = ?1")?;

        for op in ops {
            match op {
                StagedOp::Add(doc) => {
                    insert.execute(params![
                        doc.server_id,
                        doc.path,
                        doc.name,
                        doc.extension,
                        doc.size,
                        doc.modified,
                        doc.tags.album,
                        doc.tags.artist,
                        doc.tags.title,
                        doc.tags.year,
                        doc.tags.track,
                    ])?;
                }
                StagedOp::Delete { server_id, path } => {
                    delete.execute(params![server_id, path])?;
                }
                StagedOp::DeleteServer(server_id) => {
                    delete_server.execute(params![server_id])?;
                }
            }
        }
    }
    tx.commit()
}

/// Handle to the on-disk index
pub struct SearchIndex {
    path: PathBuf,
    reader: Mutex<Connection>,
    writer: Mutex<WriteSession>,
}

impl SearchIndex {
    /// Open or create the index at `path`
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = schema::open_connection(path)?;
        schema::init_schema(&conn)?;
        let reader = schema::open_reader(path)?;

        info!("Index opened at {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            reader: Mutex::new(reader),
            writer: Mutex::new(WriteSession {
                conn,
                staged: Vec::new(),
            }),
        })
    }

    /// Stage a new document
    pub fn add(&self, doc: IndexedFile) {
        self.writer.lock().staged.push(StagedOp::Add(doc));
    }

    pub fn delete_by_server_and_path(&self, server_id: i64, path: &str) {
        self.writer.lock().staged.push(StagedOp::Delete {
            server_id,
            path: path.to_string(),
        });
    }

    /// Stage removal of every document of a server
    pub fn delete_all_for_server(&self, server_id: i64) {
        self.writer
            .lock()
            .staged
            .push(StagedOp::DeleteServer(server_id));
    }

    /// Number of staged, uncommitted operations
    pub fn pending(&self) -> usize {
        self.writer.lock().staged.len()
    }

    /// Drop staged operations without applying them
    pub fn discard(&self) {
        self.writer.lock().staged.clear();
    }

    /// Apply every staged operation atomically.
    ///
    /// A failure reopens the write connection and tries once more; if that
    /// fails too the staged operations are dropped and the error returned.
    pub fn commit(&self, optimize: bool) -> Result<usize, IndexError> {
        let mut session = self.writer.lock();
        let ops = std::mem::take(&mut session.staged);
        if ops.is_empty() {
            return Ok(0);
        }

        if let Err(e) = apply(&mut session.conn, &ops) {
            warn!(error = %e, "Index commit failed, reopening write session");
            session.conn = schema::open_connection(&self.path).map_err(IndexError::Commit)?;
            apply(&mut session.conn, &ops).map_err(IndexError::Commit)?;
        }

        if optimize {
            if let Err(e) = session
                .conn
                .execute("INSERT INTO documents_fts(documents_fts) VALUES('optimize')", [])
            {
                warn!(error = %e, "Index optimize failed");
            }
        }

        Ok(ops.len())
    }

    #[cfg(test)]
    fn poison_writer(&self) {
        let readonly =
            Connection::open_with_flags(&self.path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
                .unwrap();
        self.writer.lock().conn = readonly;
    }
}
