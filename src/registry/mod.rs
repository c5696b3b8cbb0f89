//! Durable per-server bookkeeping
//!
//! The engine only talks to the [`ServerRegistry`] trait. Record mutations
//! are staged with [`ServerRegistry::update`] and become durable on
//! [`ServerRegistry::save`], so an aborted update cycle can roll them back.

mod sqlite;

use std::net::Ipv4Addr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use ftpscout_core::ServerRecord;

pub use sqlite::SqliteRegistry;

pub trait ServerRegistry: Send + Sync {
    /// Fetch the record for `address`, creating it (never scanned) if needed
    fn get_or_create(&self, address: Ipv4Addr) -> Result<ServerRecord>;

    fn get(&self, address: Ipv4Addr) -> Result<Option<ServerRecord>>;

    fn list(&self) -> Result<Vec<ServerRecord>>;

    /// Stage a modified record until the next `save`
    fn update(&self, record: ServerRecord);

    /// Record that `address` answered a probe at `at`; applied immediately
    fn touch_last_seen(&self, address: Ipv4Addr, at: DateTime<Utc>) -> Result<()>;

    /// Persist every staged record
    fn save(&self) -> Result<()>;

    /// Forget every staged record
    fn rollback(&self);

    fn delete(&self, server_id: i64) -> Result<()>;
}
