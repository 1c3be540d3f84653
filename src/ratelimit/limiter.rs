//! Token bucket limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::clock::{Clock, SystemClock};
use super::procedure::{BucketArgs, TokenBucketProcedure};
use crate::error::{ConstructionError, LimiterError};
use crate::store::SharedStateStore;

/// A distributed token-bucket rate limiter.
///
/// The limiter keeps no bucket state of its own. Every decision is one
/// atomic procedure run against the shared store, so any number of limiter
/// instances pointed at the same store enforce the same limits.
pub struct TokenBucketLimiter<S: ?Sized> {
    /// Where bucket state lives
    store: Arc<S>,
    /// Prepared once, reused for every call
    procedure: TokenBucketProcedure,
    /// Maximum tokens per bucket
    capacity: f64,
    /// Tokens regenerated per second
    rate: f64,
    /// Inactivity after which a bucket is dropped
    idle_ttl: Duration,
    /// `idle_ttl` in whole seconds as the store wants it
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
    /// Default bound on a store round trip
    call_timeout: Option<Duration>,
}

impl<S: ?Sized> std::fmt::Debug for TokenBucketLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("capacity", &self.capacity)
            .field("rate", &self.rate)
            .field("idle_ttl", &self.idle_ttl)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl<S: SharedStateStore + ?Sized> TokenBucketLimiter<S> {
    /// Create a new limiter.
    ///
    /// `capacity` is the burst size; `window` sets the refill speed to
    /// `capacity / window` tokens per second. Idle buckets expire after
    /// `2 × window`.
    ///
    /// # Panics
    ///
    /// If `capacity` or `window` is zero.
    pub fn new(store: Arc<S>, capacity: u32, window: Duration) -> Self {
        match Self::try_new(store, capacity, window) {
            Ok(limiter) => limiter,
            Err(e) => panic!("limiter: {}", e),
        }
    }

    /// Like [`TokenBucketLimiter::new`], reporting invalid parameters as an error.
    pub fn try_new(
        store: Arc<S>,
        capacity: u32,
        window: Duration,
    ) -> Result<Self, ConstructionError> {
        if capacity == 0 {
            return Err(ConstructionError::ZeroCapacity);
        }
        if window.is_zero() {
            return Err(ConstructionError::ZeroWindow);
        }

        let capacity = f64::from(capacity);
        let rate = capacity / window.as_secs_f64();
        let idle_ttl = window.checked_mul(2).unwrap_or(Duration::MAX);
        // EXPIRE 0 deletes the key, so never go below one second.
        let ttl_secs = (idle_ttl.as_secs() + u64::from(idle_ttl.subsec_nanos() > 0)).max(1);

        debug!(
            capacity = capacity,
            rate = rate,
            idle_ttl = ?idle_ttl,
            "Creating token bucket limiter"
        );

        Ok(Self {
            store,
            procedure: TokenBucketProcedure::new(),
            capacity,
            rate,
            idle_ttl,
            ttl_secs,
            clock: Arc::new(SystemClock),
            call_timeout: None,
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every `allow`/`allow_n` store round trip by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Try to consume one token from the bucket identified by `key`.
    pub async fn allow(&self, key: &str) -> Result<bool, LimiterError> {
        self.allow_n(key, 1).await
    }

    /// Try to consume `tokens` from the bucket identified by `key`.
    ///
    /// Returns `Ok(false)` when the bucket is short. Zero tokens is always
    /// allowed and never touches the store.
    pub async fn allow_n(&self, key: &str, tokens: u32) -> Result<bool, LimiterError> {
        // A timeout too large for `Instant` means no deadline at all.
        match self.call_timeout.and_then(|t| Instant::now().checked_add(t)) {
            Some(deadline) => self.allow_n_with_deadline(key, tokens, deadline).await,
            None => self.decide(key, tokens).await,
        }
    }

    /// Like [`allow_n`](Self::allow_n), failing with `Timeout` if the store
    /// has not answered by `deadline`.
    ///
    /// On timeout the store may or may not have applied the update.
    pub async fn allow_n_with_deadline(
        &self,
        key: &str,
        tokens: u32,
        deadline: Instant,
    ) -> Result<bool, LimiterError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout_at(deadline, self.decide(key, tokens)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, budget = ?budget, "Store round trip timed out");
                Err(LimiterError::Timeout(budget))
            }
        }
    }

    /// Like [`allow_n`](Self::allow_n), failing with `Canceled` if `cancel`
    /// resolves before the store answers.
    ///
    /// On cancellation the store may or may not have applied the update.
    pub async fn allow_n_with_cancel<F>(
        &self,
        key: &str,
        tokens: u32,
        cancel: F,
    ) -> Result<bool, LimiterError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            biased;
            result = self.decide(key, tokens) => result,
            _ = cancel => {
                debug!(key = %key, "Rate limit decision canceled");
                Err(LimiterError::Canceled)
            }
        }
    }

    /// Maximum tokens per bucket.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens regenerated per second.
    pub fn refill_rate(&self) -> f64 {
        self.rate
    }

    /// Inactivity after which a bucket's state is dropped.
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    async fn decide(&self, key: &str, tokens: u32) -> Result<bool, LimiterError> {
        if tokens == 0 {
            trace!(key = %key, "Zero-token request allowed without store access");
            return Ok(true);
        }

        let args = BucketArgs {
            rate: self.rate,
            capacity: self.capacity,
            now: self.clock.now_unix(),
            requested: tokens,
            ttl_secs: self.ttl_secs,
        };

        trace!(key = %key, tokens = tokens, now = args.now, "Checking rate limit");

        let reply = self
            .store
            .run_atomic(key, &self.procedure, &args)
            .await
            .map_err(|e| {
                error!(key = %key, error = %e, "Store fault during rate limit decision");
                e
            })?;

        let allowed = reply == 1;
        if !allowed {
            debug!(key = %key, tokens = tokens, "Rate limit exceeded");
        }
        Ok(allowed)
    }
}
