//! Token-bucket rate limiting.

mod clock;
mod key;
mod limiter;
mod procedure;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{BucketKey, DEFAULT_KEY_PREFIX};
pub use limiter::TokenBucketLimiter;
pub use procedure::{BucketArgs, BucketState, TokenBucketProcedure, Transition};
