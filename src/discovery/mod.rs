//! Network discovery
//!
//! Periodically scans the configured subnet, passes every candidate through
//! the filter pipeline and pushes survivors onto the bounded work queue.
//! A full queue makes discovery wait; shutdown interrupts that wait.

pub mod filters;
pub mod nmap;

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use filters::{Blacklist, DedupFilter, FilterPipeline, LivenessFilter, PatternFilter};
pub use nmap::{HostScanner, NmapScanner};

pub struct Discovery {
    scanner: Box<dyn HostScanner>,
    pipeline: FilterPipeline,
    interval: Duration,
}

impl Discovery {
    pub fn new(scanner: Box<dyn HostScanner>, pipeline: FilterPipeline, interval: Duration) -> Self {
        Self {
            scanner,
            pipeline,
            interval,
        }
    }

    /// Scan every `interval` until cancelled or the consumer goes away
    pub async fn run(self, queue: mpsc::Sender<Ipv4Addr>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Discovery started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.run_once(&queue, &cancel).await {
                break;
            }
        }

        info!("Discovery stopped");
    }

    /// One scan round. Returns `false` when discovery should stop.
    pub async fn run_once(&self, queue: &mpsc::Sender<Ipv4Addr>, cancel: &CancellationToken) -> bool {
        let scanned = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            scanned = self.scanner.scan() => scanned,
        };
        let candidates = match scanned {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Network scan failed, retrying next interval");
                return true;
            }
        };
        debug!(candidates = candidates.len(), "Network scan finished");

        let mut queued = 0;
        for address in candidates {
            if cancel.is_cancelled() {
                return false;
            }
            if !self.pipeline.admits(address).await {
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                sent = queue.send(address) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
            queued += 1;
            debug!(%address, "Server queued");
        }

        if queued > 0 {
            info!(queued, "Discovery round finished");
        }
        true
    }
}
