//! Time-windowed membership cache
//!
//! Used by discovery to drop addresses that were already seen recently.
//! Entries are kept in insertion order, so expiry only ever looks at the
//! oldest end of the queue.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time, in time elapsed since an arbitrary origin
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// Wall clock relative to the Unix epoch
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(secs),
        }
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_secs(self.secs.load(Ordering::SeqCst))
    }
}

/// Set of keys that forget each key `timeout` after it was inserted.
///
/// A key inserted at `t` is contained while `now - t <= timeout`.
pub struct TimedCache<K, C = SystemClock> {
    timeout: Duration,
    clock: C,
    inserted: HashMap<K, Duration>,
    // oldest at the front
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone> TimedCache<K, SystemClock> {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, SystemClock)
    }
}

impl<K: Eq + Hash + Clone, C: Clock> TimedCache<K, C> {
    pub fn with_clock(timeout: Duration, clock: C) -> Self {
        Self {
            timeout,
            clock,
            inserted: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Whether `key` was added less than `timeout` ago
    pub fn contains(&mut self, key: &K) -> bool {
        self.evict_expired();
        self.inserted.contains_key(key)
    }

    /// Insert `key` unless it is already present and unexpired.
    ///
    /// Re-adding a live key does not extend its lifetime.
    pub fn add(&mut self, key: K) {
        if self.contains(&key) {
            return;
        }
        let now = self.clock.now();
        self.inserted.insert(key.clone(), now);
        self.order.push_back(key);
    }

    /// Forget every key, live or not
    pub fn clear(&mut self) {
        self.inserted.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inserted.len()
    }

    fn evict_expired(&mut self) {
        let now = self.clock.now();
        while let Some(oldest) = self.order.front() {
            let Some(&at) = self.inserted.get(oldest) else {
                self.order.pop_front();
                continue;
            };
            if now.saturating_sub(at) <= self.timeout {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.inserted.remove(&key);
            }
        }
    }
}
