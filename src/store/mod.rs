//! Shared state store adapters.
//!
//! A store only needs one capability: run the bucket procedure against a
//! single key as one indivisible operation, with expiry on that key.

mod memory;
mod redis_store;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ratelimit::{BucketArgs, TokenBucketProcedure};

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Trait for shared state store implementations.
///
/// Implementations must guarantee that no other caller can observe or apply
/// an interleaved partial state for `key` while the procedure runs.
#[async_trait]
pub trait SharedStateStore: Send + Sync {
    /// Run the bucket procedure against `key` and return its integer reply.
    async fn run_atomic(
        &self,
        key: &str,
        procedure: &TokenBucketProcedure,
        args: &BucketArgs,
    ) -> Result<i64, StoreError>;

    /// Liveness probe. Returns the store's reply.
    async fn ping(&self) -> Result<String, StoreError>;
}

