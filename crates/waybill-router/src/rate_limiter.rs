//! Per-key rate limiter registry.
//!
//! Each distinct `rateLimitKey` carried on a message gets its own token-bucket
//! limiter sized to that message's `rateLimitPerMinute`. Unlike the pool-wide
//! limiter in [`crate::pool`], a check here never blocks: a denied attempt is
//! the caller's signal to NACK and let the broker redeliver later.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use tracing::{debug, warn};

/// Idle entries older than this are evicted regardless of registry size.
const ENTRY_TTL: Duration = Duration::from_secs(60 * 60);
/// Hard cap on distinct keys tracked at once.
const MAX_ENTRIES: usize = 10_000;
/// Cadence of the background sweep that enforces TTL and the size cap.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    permits_per_minute: u32,
    last_access: Instant,
}

/// Registry of per-key token-bucket limiters with TTL + count-bound eviction.
///
/// Exposes a non-blocking `try_acquire(key, permits_per_minute)`, backed by a
/// cache that forgets keys nobody has touched in the last hour, or the
/// stalest keys once the registry grows past 10,000 entries.
pub struct RateLimiterRegistry {
    entries: DashMap<String, Entry>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Non-blocking: returns true if a permit was available for `key` under
    /// `permits_per_minute`, false if the caller should back off (NACK).
    ///
    /// A `permits_per_minute` of 0 always denies; this registry does not
    /// re-derive quota to its previous value when an override itself keeps
    /// changing between calls, so differing overrides for the same key race
    /// to whichever rebuilds the entry last.
    pub fn try_acquire(&self, key: &str, permits_per_minute: u32) -> bool {
        let now = Instant::now();

        if permits_per_minute == 0 {
            return false;
        }

        let allowed = {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                Self::build_entry(permits_per_minute)
            });

            if entry.permits_per_minute != permits_per_minute {
                *entry = Self::build_entry(permits_per_minute);
            }

            entry.last_access = now;
            entry.limiter.check().is_ok()
        };

        if self.entries.len() > MAX_ENTRIES {
            self.evict(now);
        }

        allowed
    }

    fn build_entry(permits_per_minute: u32) -> Entry {
        let quota = NonZeroU32::new(permits_per_minute)
            .map(Quota::per_minute)
            .unwrap_or_else(|| Quota::per_minute(NonZeroU32::new(1).unwrap()));
        Entry {
            limiter: Arc::new(RateLimiter::direct(quota)),
            permits_per_minute,
            last_access: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop idle entries (> 1h) and, if still over the cap, the stalest
    /// remainder. Called opportunistically from `try_acquire` and from the
    /// background sweep task.
    fn evict(&self, now: Instant) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.last_access) > ENTRY_TTL)
            .map(|e| e.key().clone())
            .collect();

        for key in &stale {
            self.entries.remove(key);
        }

        let remaining = self.entries.len();
        if remaining <= MAX_ENTRIES {
            if !stale.is_empty() {
                debug!(evicted = stale.len(), remaining, "Rate limiter registry TTL sweep");
            }
            return;
        }

        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.last_access))
            .collect();
        by_age.sort_by_key(|(_, last_access)| *last_access);

        let overflow = remaining - MAX_ENTRIES;
        for (key, _) in by_age.into_iter().take(overflow) {
            self.entries.remove(&key);
        }

        warn!(
            evicted_stale = stale.len(),
            evicted_overflow = overflow,
            remaining = self.entries.len(),
            "Rate limiter registry exceeded capacity, evicted stalest entries"
        );
    }

    /// Spawn the periodic sweep. Keeps the registry bounded even for keys
    /// that stop being touched without ever tripping the count cap.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                registry.evict(Instant::now());
            }
        });
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
