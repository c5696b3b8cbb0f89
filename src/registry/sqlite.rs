//! SQLite-backed server registry

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ftpscout_core::ServerRecord;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use super::ServerRegistry;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS servers (
    id INTEGER PRIMARY KEY,
    address TEXT NOT NULL UNIQUE,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    last_scanned INTEGER NOT NULL DEFAULT 0,
    file_count INTEGER NOT NULL DEFAULT 0,
    total_size INTEGER NOT NULL DEFAULT 0
);
"#;

const SELECT_SQL: &str =
    "SELECT id, address, first_seen, last_seen, last_scanned, file_count, total_size FROM servers";

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ServerRecord> {
    let address: String = row.get(1)?;
    let address = address
        .parse::<Ipv4Addr>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    Ok(ServerRecord {
        id: row.get(0)?,
        address,
        first_seen: from_millis(row.get(2)?),
        last_seen: from_millis(row.get(3)?),
        last_scanned: from_millis(row.get(4)?),
        file_count: row.get::<_, i64>(5)? as u64,
        total_size: row.get::<_, i64>(6)? as u64,
    })
}

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    staged: Mutex<BTreeMap<i64, ServerRecord>>,
}

impl SqliteRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create registry directory: {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open registry: {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!("Registry opened at {:?}", path);
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize registry schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            staged: Mutex::new(BTreeMap::new()),
        })
    }
}

impl ServerRegistry for SqliteRegistry {
    fn get_or_create(&self, address: Ipv4Addr) -> Result<ServerRecord> {
        let conn = self.conn.lock();
        let now = millis(Utc::now());
        let created = conn.execute(
            "INSERT OR IGNORE INTO servers (address, first_seen, last_seen, last_scanned) VALUES (?1, ?2, ?2, 0)",
            params![address.to_string(), now],
        )?;
        if created > 0 {
            info!(%address, "New server registered");
        }

        let record = conn.query_row(
            &format!("{} WHERE address = ?1", SELECT_SQL),
            params![address.to_string()],
            row_to_record,
        )?;
        Ok(record)
    }

    fn get(&self, address: Ipv4Addr) -> Result<Option<ServerRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("{} WHERE address = ?1", SELECT_SQL),
                params![address.to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self) -> Result<Vec<ServerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_SQL))?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn update(&self, record: ServerRecord) {
        self.staged.lock().insert(record.id, record);
    }

    fn touch_last_seen(&self, address: Ipv4Addr, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO servers (address, first_seen, last_seen, last_scanned) VALUES (?1, ?2, ?2, 0)
             ON CONFLICT(address) DO UPDATE SET last_seen = excluded.last_seen",
            params![address.to_string(), millis(at)],
        )?;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE servers SET last_seen = ?2, last_scanned = ?3, file_count = ?4, total_size = ?5
                 WHERE id = ?1",
            )?;
            for record in staged.values() {
                stmt.execute(params![
                    record.id,
                    millis(record.last_seen),
                    millis(record.last_scanned),
                    record.file_count as i64,
                    record.total_size as i64,
                ])?;
            }
        }
        tx.commit().context("Failed to save registry")?;
        debug!(records = staged.len(), "Registry saved");
        Ok(())
    }

    fn rollback(&self) {
        let mut staged = self.staged.lock();
        if !staged.is_empty() {
            debug!(records = staged.len(), "Registry changes rolled back");
        }
        staged.clear();
    }

    fn delete(&self, server_id: i64) -> Result<()> {
        self.staged.lock().remove(&server_id);
        let conn = self.conn.lock();
        conn.execute("DELETE FROM servers WHERE id = ?1", params![server_id])?;
        Ok(())
    }
}
