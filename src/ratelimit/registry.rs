//! Per-client limiter registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, trace};

use super::bucket::{Quota, TokenBucket};
use crate::clock::Clock;

/// Default idle age after which an entry may be evicted.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60 * 60);
/// Default period between eviction sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Lifecycle settings for registry entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Entries idle for longer than this are removed by the next sweep
    pub max_idle: Duration,
    /// How often the background sweeper runs
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A limiter plus the last time its client was seen.
#[derive(Debug)]
pub struct LimiterEntry {
    bucket: Arc<TokenBucket>,
    last_seen: Instant,
}

impl LimiterEntry {
    fn new(quota: Quota, now: Instant) -> Self {
        Self {
            bucket: Arc::new(TokenBucket::new(quota, now)),
            last_seen: now,
        }
    }

    fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Concurrent map of client identity to limiter.
///
/// Entries are created lazily on first lookup and removed only by
/// [`LimiterRegistry::sweep`]. At most one entry exists per identity.
pub struct LimiterRegistry {
    entries: DashMap<String, LimiterEntry>,
    quota: Quota,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new(quota: Quota, config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            quota,
            config,
            clock,
        }
    }

    /// Return the limiter for `identity`, creating it on first sight.
    ///
    /// Creation goes through the map's entry API, which holds the shard lock
    /// for the key, so two racing callers end up sharing one bucket.
    pub fn get_or_create(&self, identity: &str) -> Arc<TokenBucket> {
        let now = self.clock.now();

        if let Some(mut entry) = self.entries.get_mut(identity) {
            entry.touch(now);
            trace!(identity = %identity, "Limiter cache hit");
            return Arc::clone(&entry.bucket);
        }

        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!(
                    identity = %identity,
                    burst = self.quota.burst.get(),
                    replenish_interval = ?self.quota.replenish_interval,
                    "Creating new client limiter"
                );
                LimiterEntry::new(self.quota, now)
            });
        entry.touch(now);
        Arc::clone(&entry.bucket)
    }

    /// Remove every entry idle for longer than `max_idle`.
    ///
    /// Returns how many entries were evicted. Shards are locked one at a
    /// time, so request threads only wait for the shard being swept.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let max_idle = self.config.max_idle;
        let before = self.entries.len();

        self.entries.retain(|identity, entry| {
            let keep = now.saturating_duration_since(entry.last_seen) <= max_idle;
            if !keep {
                trace!(identity = %identity, "Evicting idle client limiter");
            }
            keep
        });

        let evicted = before.saturating_sub(self.entries.len());
        debug!(evicted = evicted, remaining = self.entries.len(), "Limiter sweep finished");
        evicted
    }

    /// Get the number of live entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Whether an entry exists for `identity`.
    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Last time `identity` was looked up, if it has an entry.
    pub fn last_seen(&self, identity: &str) -> Option<Instant> {
        self.entries.get(identity).map(|e| e.last_seen())
    }

    /// Get the lifecycle settings.
    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    /// Get the clock shared by every limiter in this registry.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("entries", &self.entries.len())
            .field("quota", &self.quota)
            .field("config", &self.config)
            .finish()
    }
}
