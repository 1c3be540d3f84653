//! The atomic token-bucket update.
//!
//! The same transition is expressed twice: as a Lua script for stores with
//! server-side scripting, and as a native function for stores that can hold a
//! per-key lock across read, compute and write. Both must stay in lockstep.

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Available tokens, fractional
    pub tokens: f64,
    /// Unix seconds of the last update
    pub timestamp: i64,
}

/// Arguments for one invocation of the procedure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketArgs {
    /// Tokens added per second
    pub rate: f64,
    /// Maximum tokens in the bucket
    pub capacity: f64,
    /// Caller's current unix time in seconds
    pub now: i64,
    /// Tokens to consume
    pub requested: u32,
    /// Expiry to set on the key, in seconds
    pub ttl_secs: u64,
}

/// Script arguments, in the `ARGV` order the Lua procedure reads them.
impl redis::ToRedisArgs for BucketArgs {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        self.rate.write_redis_args(out);
        self.capacity.write_redis_args(out);
        self.now.write_redis_args(out);
        self.requested.write_redis_args(out);
        self.ttl_secs.write_redis_args(out);
    }
}

/// Outcome of applying the procedure to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub state: BucketState,
    pub allowed: bool,
}

impl Transition {
    /// The integer the store hands back: 1 allowed, 0 limited.
    pub fn reply(&self) -> i64 {
        i64::from(self.allowed)
    }
}

/// KEYS[1] bucket key
/// ARGV[1] rate, ARGV[2] capacity, ARGV[3] now, ARGV[4] requested, ARGV[5] ttl
const TOKEN_BUCKET_LUA: &str = r#"
local rate      = tonumber(ARGV[1])
local capacity  = tonumber(ARGV[2])
local now       = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local ttl       = tonumber(ARGV[5])

local data   = redis.call('HMGET', KEYS[1], 'tokens', 'timestamp')
local tokens = tonumber(data[1])
local ts     = tonumber(data[2])

if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local delta = math.max(0, now - ts)
local new_tokens = math.min(capacity, tokens + delta * rate)

local allowed = new_tokens >= requested
if allowed then
  new_tokens = new_tokens - requested
end

redis.call('HSET', KEYS[1], 'tokens', tostring(new_tokens), 'timestamp', math.max(now, ts))
redis.call('EXPIRE', KEYS[1], ttl)

if allowed then
  return 1
end
return 0
"#;

/// The token-bucket procedure, prepared once per limiter.
#[derive(Debug, Clone)]
pub struct TokenBucketProcedure {
    script: redis::Script,
}

impl TokenBucketProcedure {
    pub fn new() -> Self {
        Self {
            script: redis::Script::new(TOKEN_BUCKET_LUA),
        }
    }

    /// The script for stores that evaluate server-side.
    pub fn script(&self) -> &redis::Script {
        &self.script
    }

    /// SHA1 the store caches the script under.
    pub fn id(&self) -> &str {
        self.script.get_hash()
    }

    /// Apply the update to the current state of a key.
    ///
    /// `None` is an absent key; it becomes a full bucket stamped `now`.
    pub fn apply(&self, current: Option<BucketState>, args: &BucketArgs) -> Transition {
        let BucketState { tokens, timestamp } = current.unwrap_or(BucketState {
            tokens: args.capacity,
            timestamp: args.now,
        });

        let delta = (args.now - timestamp).max(0) as f64;
        let mut new_tokens = args.capacity.min(tokens + delta * args.rate);

        let requested = f64::from(args.requested);
        let allowed = new_tokens >= requested;
        if allowed {
            new_tokens -= requested;
        }

        Transition {
            state: BucketState {
                tokens: new_tokens,
                timestamp: args.now.max(timestamp),
            },
            allowed,
        }
    }
}

impl Default for TokenBucketProcedure {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ToRedisArgs;

    fn args(now: i64, requested: u32) -> BucketArgs {
        BucketArgs {
            rate: 2.0,
            capacity: 10.0,
            now,
            requested,
            ttl_secs: 20,
        }
    }

    #[test]
    fn test_absent_bucket_starts_full() {
        let proc = TokenBucketProcedure::new();
        let t = proc.apply(None, &args(1_000, 1));

        assert!(t.allowed);
        assert_eq!(t.state.tokens, 9.0);
        assert_eq!(t.state.timestamp, 1_000);
        assert_eq!(t.reply(), 1);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let proc = TokenBucketProcedure::new();
        let current = BucketState {
            tokens: 4.0,
            timestamp: 1_000,
        };
        let t = proc.apply(Some(current), &args(1_100, 1));

        assert!(t.allowed);
        assert_eq!(t.state.tokens, 9.0);
    }

    #[test]
    fn test_denial_keeps_tokens_and_advances_timestamp() {
        let proc = TokenBucketProcedure::new();
        let current = BucketState {
            tokens: 0.5,
            timestamp: 1_000,
        };
        let t = proc.apply(Some(current), &args(1_000, 1));

        assert!(!t.allowed);
        assert_eq!(t.reply(), 0);
        assert_eq!(t.state.tokens, 0.5);
        assert_eq!(t.state.timestamp, 1_000);

        let later = proc.apply(Some(t.state), &args(1_001, 3));
        assert!(!later.allowed);
        assert_eq!(later.state.tokens, 2.5);
        assert_eq!(later.state.timestamp, 1_001);
    }

    #[test]
    fn test_fractional_tokens_accumulate() {
        let proc = TokenBucketProcedure::new();
        let mut a = args(1_000, 1);
        a.rate = 0.5;

        let t = proc.apply(
            Some(BucketState {
                tokens: 0.0,
                timestamp: 1_000,
            }),
            &BucketArgs { now: 1_001, ..a },
        );
        assert!(!t.allowed);
        assert_eq!(t.state.tokens, 0.5);

        let t = proc.apply(Some(t.state), &BucketArgs { now: 1_002, ..a });
        assert!(t.allowed);
        assert_eq!(t.state.tokens, 0.0);
    }

    #[test]
    fn test_clock_skew_neither_refills_nor_rewinds() {
        let proc = TokenBucketProcedure::new();
        let current = BucketState {
            tokens: 3.0,
            timestamp: 2_000,
        };
        let t = proc.apply(Some(current), &args(1_990, 1));

        assert!(t.allowed);
        assert_eq!(t.state.tokens, 2.0);
        assert_eq!(t.state.timestamp, 2_000);
    }

    #[test]
    fn test_script_hash_is_stable() {
        let a = TokenBucketProcedure::new();
        let b = TokenBucketProcedure::new();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 40);
    }

    #[test]
    fn test_args_follow_script_argv_order() {
        let args = BucketArgs {
            rate: 0.5,
            capacity: 3.0,
            now: 1_700_000_000,
            requested: 2,
            ttl_secs: 7,
        };

        let mut expected = Vec::new();
        expected.extend(0.5f64.to_redis_args());
        expected.extend(3.0f64.to_redis_args());
        expected.extend(1_700_000_000i64.to_redis_args());
        expected.extend(2u32.to_redis_args());
        expected.extend(7u64.to_redis_args());

        assert_eq!(args.to_redis_args(), expected);

        // Each local in the script reads the slot the args above fill.
        for (i, name) in ["rate", "capacity", "now", "requested", "ttl"].iter().enumerate() {
            let line = TOKEN_BUCKET_LUA
                .lines()
                .find(|l| l.starts_with(&format!("local {} ", name)))
                .unwrap_or_else(|| panic!("no local for {}", name));
            assert!(
                line.contains(&format!("ARGV[{}]", i + 1)),
                "{} should read ARGV[{}]: {}",
                name,
                i + 1,
                line
            );
        }
    }

    #[test]
    fn test_script_uses_bucket_fields() {
        assert!(TOKEN_BUCKET_LUA.contains("HMGET', KEYS[1], 'tokens', 'timestamp'"));
        assert!(TOKEN_BUCKET_LUA.contains("HSET', KEYS[1], 'tokens',"));
        assert!(TOKEN_BUCKET_LUA.contains("'timestamp', math.max(now, ts)"));
        assert!(TOKEN_BUCKET_LUA.contains("EXPIRE', KEYS[1], ttl"));
    }
}
