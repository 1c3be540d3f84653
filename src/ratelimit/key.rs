//! Bucket key construction.

/// Default namespace for bucket keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// A key that identifies one bucket in the shared store.
///
/// The key is the namespace prefix followed by the caller identity,
/// e.g. `ratelimit:203.0.113.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Namespace prefix
    pub prefix: String,
    /// Client identity (address, user id, ...)
    pub identity: String,
}

impl BucketKey {
    /// Create a new bucket key. An empty prefix falls back to the default.
    pub fn new(prefix: &str, identity: &str) -> Self {
        let prefix = if prefix.is_empty() {
            DEFAULT_KEY_PREFIX
        } else {
            prefix
        };

        Self {
            prefix: prefix.to_string(),
            identity: identity.to_string(),
        }
    }

    /// The string stored in the shared store.
    pub fn to_store_key(&self) -> String {
        format!("{}{}", self.prefix, self.identity)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.prefix, self.identity)
    }
}
