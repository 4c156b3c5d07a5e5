//! Unavailable-offerings cache
//!
//! Remembers `(instance type, zone, capacity type)` combinations that recently
//! turned out to be infeasible. A spot interruption is the signal here: the
//! capacity pool is being reclaimed, so provisioning should avoid it for a while.
//!
//! Entries carry a fixed TTL. Reads treat expired entries as absent (lazy expiry);
//! a background sweep started with [`UnavailableOfferings::spawn_sweeper`] drops
//! them from memory. There is no explicit eviction API.
//!
//! Reads and writes go through a `parking_lot::RwLock` held only for a single map
//! operation, so writers never hold readers for longer than one insert.

use crate::clock::SharedClock;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default time an offering stays marked unavailable (30 minutes)
pub const DEFAULT_UNAVAILABLE_OFFERINGS_TTL_SECS: u64 = 30 * 60;

/// Default interval between background sweeps (5 minutes)
pub const DEFAULT_CACHE_CLEANUP_INTERVAL_SECS: u64 = 5 * 60;

/// Identifies one purchasable offering
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferingKey {
    /// Instance type, e.g. `m5.large`
    pub instance_type: String,
    /// Availability zone, e.g. `us-west-2a`
    pub zone: String,
    /// Capacity type, e.g. `spot` or `on-demand`
    pub capacity_type: String,
}

impl OfferingKey {
    /// Create a key
    pub fn new(
        instance_type: impl Into<String>,
        zone: impl Into<String>,
        capacity_type: impl Into<String>,
    ) -> Self {
        Self {
            instance_type: instance_type.into(),
            zone: zone.into(),
            capacity_type: capacity_type.into(),
        }
    }
}

impl fmt::Display for OfferingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.capacity_type, self.instance_type, self.zone)
    }
}

/// TTL cache of offerings observed as infeasible
pub struct UnavailableOfferings {
    entries: RwLock<HashMap<OfferingKey, DateTime<Utc>>>,
    ttl: chrono::Duration,
    clock: SharedClock,
}

impl UnavailableOfferings {
    /// Create a cache whose entries live for `ttl`
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52)),
            clock,
        }
    }

    /// Mark an offering unavailable, refreshing the TTL if it is already present
    pub fn mark_unavailable(&self, instance_type: &str, zone: &str, capacity_type: &str) {
        self.mark(OfferingKey::new(instance_type, zone, capacity_type));
    }

    /// Mark an offering unavailable by key
    pub fn mark(&self, key: OfferingKey) {
        let expires_at = self.clock.now() + self.ttl;
        debug!(offering = %key, expires_at = %expires_at, "Marking offering unavailable");
        self.entries.write().insert(key, expires_at);
    }

    /// Whether an offering is currently marked unavailable
    pub fn is_unavailable(&self, instance_type: &str, zone: &str, capacity_type: &str) -> bool {
        self.contains(&OfferingKey::new(instance_type, zone, capacity_type))
    }

    /// Whether the key is present and not yet expired
    pub fn contains(&self, key: &OfferingKey) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Number of live (unexpired) entries
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.read().values().filter(|exp| **exp > now).count()
    }

    /// Whether there are no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries from memory, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired unavailable offerings");
                        }
                    }
                }
            }
            info!("Unavailable-offerings sweeper stopped");
        })
    }
}
