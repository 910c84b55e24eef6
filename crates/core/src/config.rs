//! Environment-driven tunables shared by the store and registry layers.

use std::str::FromStr;

/// Parse `key` from the environment, falling back to `default` when unset or malformed.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// Store events retained for watch-from-revision replay.
    pub watch_history: usize,
    /// Broadcast buffer between a store and its live watchers.
    pub watch_broadcast_cap: usize,
    /// Per-watch bounded channel between producer task and consumer.
    pub queue_cap: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self { watch_history: 4096, watch_broadcast_cap: 1024, queue_cap: 256 }
    }
}

impl Tunables {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            watch_history: env_or("KEEL_WATCH_HISTORY", d.watch_history).max(1),
            watch_broadcast_cap: env_or("KEEL_WATCH_BROADCAST_CAP", d.watch_broadcast_cap).max(1),
            queue_cap: env_or("KEEL_QUEUE_CAP", d.queue_cap).max(1),
        }
    }
}
