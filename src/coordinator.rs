//! Per-server update cycle
//!
//! due check -> crawl -> reconcile against the index -> tag extraction for
//! new and changed files -> index commit -> registry save.
//!
//! The index commits before the registry saves. If the index commit fails the
//! registry is rolled back, so a failed cycle leaves the server due again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use ftpscout_core::{AudioTags, FileEntry, IndexedFile, format_mtime, parse_mtime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IndexerConfig;
use crate::crawler::{CrawlError, Crawler};
use crate::ftp::Connector;
use crate::index::SearchIndex;
use crate::metadata::MetadataExtractor;
use crate::registry::ServerRegistry;

/// Knobs for the update cycle
#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    pub min_interval: TimeDelta,
    pub max_depth: usize,
    pub audio_extensions: Vec<String>,
    pub optimize: bool,
    /// Servers silent for longer than this are forgotten
    pub purge_offline_after: Option<TimeDelta>,
}

impl From<&IndexerConfig> for UpdatePolicy {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            min_interval: TimeDelta::seconds(config.min_update_interval_secs as i64),
            max_depth: config.max_depth,
            audio_extensions: config.audio_extensions.clone(),
            optimize: config.optimize_on_commit,
            purge_offline_after: config
                .purge_offline_after_days
                .map(|days| TimeDelta::days(days as i64)),
        }
    }
}

/// What one call to [`Coordinator::update_server`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Scanned too recently
    NotDue,
    /// Could not connect or log in
    Unreachable,
    /// Tree exceeded the depth limit; nothing was changed
    TooDeep,
    /// Shutdown interrupted the crawl; nothing was changed
    Cancelled,
    /// The crawl found no files; existing documents were kept
    Empty,
    Updated {
        files: u64,
        bytes: u64,
        added: usize,
        removed: usize,
    },
}

/// Index changes needed to bring one server's documents in line with a crawl
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Paths whose documents must go, sorted
    pub to_delete: Vec<String>,
    /// Files to (re)index, sorted by path
    pub to_add: Vec<FileEntry>,
}

/// Diff a fresh crawl against the committed documents of the same server.
///
/// Gone files are deleted. A document older than the crawled file is
/// deleted and the file re-added; an equal or newer one is left alone. An
/// unparseable stored time counts as older.
pub fn plan_reconciliation(crawled: &[FileEntry], indexed: &[IndexedFile]) -> Reconciliation {
    let by_path: HashMap<&str, &FileEntry> = crawled.iter().map(|f| (f.path.as_str(), f)).collect();
    let mut pending: BTreeMap<&str, &FileEntry> = by_path.iter().map(|(p, f)| (*p, *f)).collect();
    let mut deleted = HashSet::new();
    let mut kept = HashSet::new();

    for doc in indexed {
        let path = doc.path.as_str();
        let Some(&file) = by_path.get(path) else {
            deleted.insert(path);
            continue;
        };

        let up_to_date = parse_mtime(&doc.modified).is_some_and(|stored| stored >= file.modified);
        // a second document for a path that was already kept means duplicates;
        // deleting by path removes both, so the file has to be re-added
        if up_to_date && !deleted.contains(path) && kept.insert(path) {
            pending.remove(path);
        } else {
            deleted.insert(path);
            pending.insert(path, file);
        }
    }

    let mut to_delete: Vec<String> = deleted.into_iter().map(str::to_string).collect();
    to_delete.sort();

    Reconciliation {
        to_delete,
        to_add: pending.into_values().cloned().collect(),
    }
}

fn to_document(server_id: i64, file: &FileEntry, tags: AudioTags) -> IndexedFile {
    IndexedFile {
        server_id,
        path: file.path.clone(),
        name: file.name().to_string(),
        extension: file.extension().to_string(),
        size: file.size.to_string(),
        modified: format_mtime(&file.modified),
        tags,
    }
}

pub struct Coordinator {
    registry: Arc<dyn ServerRegistry>,
    index: Arc<SearchIndex>,
    crawler: Crawler,
    extractor: MetadataExtractor,
    policy: UpdatePolicy,
}

impl Coordinator {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        index: Arc<SearchIndex>,
        connector: Arc<dyn Connector>,
        policy: UpdatePolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            crawler: Crawler::new(connector.clone(), policy.max_depth, cancel),
            extractor: MetadataExtractor::new(connector, &policy.audio_extensions),
            registry,
            index,
            policy,
        }
    }

    pub async fn update_server(&self, address: Ipv4Addr) -> Result<UpdateOutcome> {
        self.update_server_at(address, Utc::now()).await
    }

    /// Run one update cycle as if the current time were `now`
    pub async fn update_server_at(&self, address: Ipv4Addr, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        let mut record = self.registry.get_or_create(address)?;
        if !record.is_due(now, self.policy.min_interval) {
            debug!(%address, last_scanned = %record.last_scanned, "Not due");
            return Ok(UpdateOutcome::NotDue);
        }

        if self.index.pending() > 0 {
            warn!(pending = self.index.pending(), "Dropping index writes left by an aborted cycle");
            self.index.discard();
        }

        info!(%address, "Updating server");
        let files = match self.crawler.crawl(address).await {
            Ok(files) => files,
            Err(e) => {
                self.registry.rollback();
                return Ok(match e {
                    CrawlError::Connect { .. } => {
                        warn!(%address, error = %e, "Server unreachable");
                        UpdateOutcome::Unreachable
                    }
                    CrawlError::TooDeep { .. } => {
                        warn!(%address, error = %e, "Discarding crawl");
                        UpdateOutcome::TooDeep
                    }
                    CrawlError::Cancelled => {
                        info!(%address, "Update cancelled");
                        UpdateOutcome::Cancelled
                    }
                });
            }
        };

        if files.is_empty() {
            // a misbehaving server can list nothing; keep what we had
            warn!(%address, "Crawl found no files, keeping existing documents");
            self.registry.rollback();
            return Ok(UpdateOutcome::Empty);
        }

        let indexed = self
            .index
            .documents_for_server(record.id)
            .context("Failed to read indexed documents")?;
        let plan = plan_reconciliation(&files, &indexed);
        debug!(
            %address,
            indexed = indexed.len(),
            delete = plan.to_delete.len(),
            add = plan.to_add.len(),
            "Reconciled"
        );

        for path in &plan.to_delete {
            self.index.delete_by_server_and_path(record.id, path);
        }

        let mut extraction = self.extractor.begin(address);
        for file in &plan.to_add {
            let tags = extraction.tags_for(file).await;
            self.index.add(to_document(record.id, file, tags));
        }
        extraction.finish().await;

        if let Err(e) = self.index.commit(self.policy.optimize) {
            self.registry.rollback();
            return Err(e).context("Index commit failed");
        }

        record.file_count = files.len() as u64;
        record.total_size = files.iter().map(|f| f.size).sum();
        record.last_scanned = now;
        record.last_seen = now;
        self.registry.update(record.clone());
        self.registry.save()?;

        info!(
            %address,
            files = record.file_count,
            bytes = record.total_size,
            added = plan.to_add.len(),
            removed = plan.to_delete.len(),
            "Server updated"
        );

        Ok(UpdateOutcome::Updated {
            files: record.file_count,
            bytes: record.total_size,
            added: plan.to_add.len(),
            removed: plan.to_delete.len(),
        })
    }

    /// Forget a server: its documents first, then its registry record.
    /// Returns `false` if the address is unknown.
    pub fn remove_server(&self, address: Ipv4Addr) -> Result<bool> {
        let Some(record) = self.registry.get(address)? else {
            return Ok(false);
        };

        self.index.delete_all_for_server(record.id);
        self.index.commit(false).context("Index commit failed")?;
        self.registry.delete(record.id)?;
        info!(%address, "Server removed");
        Ok(true)
    }

    /// Remove every server not seen for longer than `max_offline`
    pub fn purge_offline(&self, now: DateTime<Utc>, max_offline: TimeDelta) -> Result<usize> {
        let mut purged = 0;
        for record in self.registry.list()? {
            if record.is_offline_since(now, max_offline) && self.remove_server(record.address)? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Purged offline servers");
        }
        Ok(purged)
    }

    /// Drain the work queue, one update at a time, until cancelled or the
    /// queue closes. An update already in progress runs to completion.
    ///
    /// Offline purges run every `purge_every` in the same loop, so they never
    /// interleave with an update's staged index writes.
    pub async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<Ipv4Addr>,
        cancel: CancellationToken,
        purge_every: Duration,
    ) {
        info!("Coordinator started");
        let mut purge_ticker = tokio::time::interval(purge_every);
        purge_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let work = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(address) => Work::Update(address),
                    None => break,
                },
                _ = purge_ticker.tick(), if self.policy.purge_offline_after.is_some() => Work::Purge,
            };

            match work {
                Work::Update(address) => match self.update_server(address).await {
                    Ok(outcome) => debug!(%address, ?outcome, "Update finished"),
                    Err(e) => error!(%address, error = %format!("{:#}", e), "Update failed"),
                },
                Work::Purge => {
                    if let Some(max_offline) = self.policy.purge_offline_after {
                        if let Err(e) = self.purge_offline(Utc::now(), max_offline) {
                            error!(error = %format!("{:#}", e), "Purge failed");
                        }
                    }
                }
            }
        }
        info!("Coordinator stopped");
    }
}

enum Work {
    Update(Ipv4Addr),
    Purge,
}
