//! Breadth-first directory tree crawler
//!
//! Walks a server from `/` and returns every readable regular file with its
//! size and modified time. Directory entries come from an untrusted peer, so
//! paths are normalised before loop detection and the walk is depth-limited.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, NaiveDateTime, TimeDelta, Utc};
use ftpscout_core::FileEntry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ftp::{Connector, EntryKind, FtpError, RemoteSession};

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: Ipv4Addr,
        #[source]
        source: FtpError,
    },

    #[error("directory tree deeper than {max_depth} levels at {path}")]
    TooDeep { path: String, max_depth: usize },

    #[error("crawl cancelled")]
    Cancelled,
}

/// Resolve `name` relative to `dir`, collapsing `.` and `..`
fn child_path(dir: &str, name: &str) -> String {
    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Year-less listings can put recent files in the future; pull those back a year
fn correct_future(modified: NaiveDateTime, now: NaiveDateTime) -> NaiveDateTime {
    if modified <= now {
        return modified;
    }
    modified
        .with_year(modified.year() - 1)
        .unwrap_or_else(|| modified - TimeDelta::days(365))
}

pub struct Crawler {
    connector: Arc<dyn Connector>,
    max_depth: usize,
    cancel: CancellationToken,
}

impl Crawler {
    pub fn new(connector: Arc<dyn Connector>, max_depth: usize, cancel: CancellationToken) -> Self {
        Self {
            connector,
            max_depth,
            cancel,
        }
    }

    /// Crawl one server.
    ///
    /// Failing to connect at all is an error; failures on individual
    /// directories only lose those directories for this run.
    pub async fn crawl(&self, address: Ipv4Addr) -> Result<Vec<FileEntry>, CrawlError> {
        let started = Instant::now();
        let mut session = self.open(address).await?;

        let result = self.walk(address, &mut session).await;
        session.close().await;

        if let Ok(files) = &result {
            info!(
                %address,
                files = files.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Crawl finished"
            );
        }
        result
    }

    async fn open(&self, address: Ipv4Addr) -> Result<Box<dyn RemoteSession>, CrawlError> {
        self.connector
            .connect(address)
            .await
            .map_err(|source| CrawlError::Connect { address, source })
    }

    async fn walk(
        &self,
        address: Ipv4Addr,
        session: &mut Box<dyn RemoteSession>,
    ) -> Result<Vec<FileEntry>, CrawlError> {
        let now = Utc::now().naive_utc();
        let mut files = Vec::new();
        let mut file_paths = HashSet::new();

        let root = "/".to_string();
        let mut visited = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([(root, 0usize)]);

        while let Some((dir, depth)) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            if depth >= self.max_depth {
                return Err(CrawlError::TooDeep {
                    path: dir,
                    max_depth: self.max_depth,
                });
            }

            let entries = match session.list_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.is_permanent() => {
                    debug!(%address, dir = %dir, error = %e, "Skipping directory");
                    continue;
                }
                Err(e) => {
                    warn!(%address, dir = %dir, error = %e, "Listing failed, reconnecting");
                    *session = self.open(address).await?;
                    continue;
                }
            };

            debug!(%address, dir = %dir, entries = entries.len(), "Listed directory");

            for entry in entries.into_iter().filter(|e| e.interesting) {
                let path = child_path(&dir, &entry.name);
                match entry.kind {
                    EntryKind::Dir => {
                        if visited.insert(path.clone()) {
                            queue.push_back((path, depth + 1));
                        }
                    }
                    EntryKind::File => {
                        let (Some(size), Some(modified)) = (entry.size, entry.modified) else {
                            debug!(%address, path = %path, "No size or date, skipping");
                            continue;
                        };
                        if path != "/" && file_paths.insert(path.clone()) {
                            files.push(FileEntry::new(path, size, correct_future(modified, now)));
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(files)
    }
}
