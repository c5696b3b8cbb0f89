//! Candidate address filters
//!
//! Each stage answers keep/drop for one address. The pipeline runs them in
//! order and stops at the first drop, so cheap stages go first and the
//! network probe runs last.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use tokio::net::TcpStream;
use tracing::{trace, warn};

use crate::dedup::{Clock, SystemClock, TimedCache};
use crate::registry::ServerRegistry;

#[async_trait]
pub trait AddressFilter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn keep(&self, address: Ipv4Addr) -> bool;
}

/// Drops explicitly excluded addresses
pub struct Blacklist {
    blocked: HashSet<Ipv4Addr>,
}

impl Blacklist {
    pub fn new(blocked: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AddressFilter for Blacklist {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    async fn keep(&self, address: Ipv4Addr) -> bool {
        !self.blocked.contains(&address)
    }
}

/// Keeps only addresses whose dotted form matches a regex
pub struct PatternFilter {
    pattern: Regex,
}

impl PatternFilter {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }
}

#[async_trait]
impl AddressFilter for PatternFilter {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn keep(&self, address: Ipv4Addr) -> bool {
        self.pattern.is_match(&address.to_string())
    }
}

/// Drops addresses already let through within the timeout
pub struct DedupFilter<C = SystemClock> {
    seen: Mutex<TimedCache<Ipv4Addr, C>>,
}

impl DedupFilter<SystemClock> {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, SystemClock)
    }
}

impl<C: Clock> DedupFilter<C> {
    pub fn with_clock(timeout: Duration, clock: C) -> Self {
        Self {
            seen: Mutex::new(TimedCache::with_clock(timeout, clock)),
        }
    }
}

#[async_trait]
impl<C: Clock + 'static> AddressFilter for DedupFilter<C> {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn keep(&self, address: Ipv4Addr) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(&address) {
            return false;
        }
        seen.add(address);
        trace!(%address, cached = seen.len(), "First sighting");
        true
    }
}

/// Keeps addresses that accept a TCP connection on the FTP port, and records
/// them as seen in the registry
pub struct LivenessFilter {
    registry: Arc<dyn ServerRegistry>,
    port: u16,
    timeout: Duration,
}

impl LivenessFilter {
    pub fn new(registry: Arc<dyn ServerRegistry>, port: u16, timeout: Duration) -> Self {
        Self {
            registry,
            port,
            timeout,
        }
    }
}

#[async_trait]
impl AddressFilter for LivenessFilter {
    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn keep(&self, address: Ipv4Addr) -> bool {
        let probe = TcpStream::connect((address, self.port));
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(_)) => {
                if let Err(e) = self.registry.touch_last_seen(address, Utc::now()) {
                    warn!(%address, error = %e, "Failed to record last seen");
                }
                true
            }
            Ok(Err(e)) => {
                trace!(%address, error = %e, "Probe refused");
                false
            }
            Err(_) => {
                trace!(%address, "Probe timed out");
                false
            }
        }
    }
}

/// Ordered, short-circuiting chain of filters
#[derive(Default)]
pub struct FilterPipeline {
    filters: Vec<Box<dyn AddressFilter>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl AddressFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub async fn admits(&self, address: Ipv4Addr) -> bool {
        for filter in &self.filters {
            if !filter.keep(address).await {
                trace!(%address, filter = filter.name(), "Dropped");
                return false;
            }
        }
        true
    }
}
