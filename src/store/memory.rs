//! In-process store.
//!
//! Holds buckets in a `DashMap`. The procedure runs while the key's shard is
//! write-locked, which gives the same per-key atomicity Redis gives a script.
//! State is local to the process, so this store only coordinates callers
//! that share it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::SharedStateStore;
use crate::error::StoreError;
use crate::ratelimit::{BucketArgs, BucketState, Clock, SystemClock, TokenBucketProcedure};

/// Procedure runs between sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    /// Unix second at which the entry stops existing
    expires_at: i64,
}

impl StoredBucket {
    fn live_at(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

/// A `SharedStateStore` kept in process memory.
pub struct MemoryStore {
    buckets: DashMap<String, StoredBucket>,
    clock: Arc<dyn Clock>,
    /// Procedure runs so far, drives the sweep
    runs: AtomicU64,
    sweep_interval: u64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store that expires entries by wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that expires entries by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            runs: AtomicU64::new(0),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Sweep expired entries every `interval` procedure runs (minimum 1).
    pub fn with_sweep_interval(mut self, interval: u64) -> Self {
        self.sweep_interval = interval.max(1);
        self
    }

    /// Current state of `key`, if present and not expired.
    pub fn snapshot(&self, key: &str) -> Option<BucketState> {
        let now = self.clock.now_unix();
        self.buckets
            .get(key)
            .filter(|b| b.live_at(now))
            .map(|b| b.state)
    }

    /// Seconds until `key` expires, if present and not expired.
    pub fn ttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_unix();
        self.buckets
            .get(key)
            .filter(|b| b.live_at(now))
            .map(|b| b.expires_at.saturating_sub(now))
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_unix();
        let mut purged = 0;
        self.buckets.retain(|_, b| {
            let live = b.live_at(now);
            purged += usize::from(!live);
            live
        });
        purged
    }

    /// Number of entries held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStateStore for MemoryStore {
    async fn run_atomic(
        &self,
        key: &str,
        procedure: &TokenBucketProcedure,
        args: &BucketArgs,
    ) -> Result<i64, StoreError> {
        // Sweep before taking the entry lock; retain locks every shard.
        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        if run % self.sweep_interval == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged = purged, remaining = self.buckets.len(), "Swept expired buckets");
            }
        }

        let now = self.clock.now_unix();
        let expires_at = now.saturating_add(i64::try_from(args.ttl_secs).unwrap_or(i64::MAX));

        // The entry guard holds the shard lock until it is dropped.
        let transition = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get().state).filter(|_| occupied.get().live_at(now));
                let transition = procedure.apply(current, args);
                occupied.insert(StoredBucket {
                    state: transition.state,
                    expires_at,
                });
                transition
            }
            Entry::Vacant(vacant) => {
                let transition = procedure.apply(None, args);
                vacant.insert(StoredBucket {
                    state: transition.state,
                    expires_at,
                });
                transition
            }
        };

        trace!(
            key = %key,
            tokens = transition.state.tokens,
            allowed = transition.allowed,
            "Bucket procedure applied"
        );

        Ok(transition.reply())
    }

    async fn ping(&self) -> Result<String, StoreError> {
        Ok("PONG".to_string())
    }
}
