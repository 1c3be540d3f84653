//! Rate limiting middleware for axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, instrument};

use crate::ratelimit::{BucketKey, TokenBucketLimiter};
use crate::store::SharedStateStore;

/// Header consulted first for the client identity.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// State shared by every request passing through [`enforce`].
pub struct RateLimitState<S: ?Sized> {
    /// The limiter instance
    limiter: Arc<TokenBucketLimiter<S>>,
    /// Bucket key namespace
    key_prefix: String,
}

impl<S: ?Sized> Clone for RateLimitState<S> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            key_prefix: self.key_prefix.clone(),
        }
    }
}

impl<S: ?Sized> RateLimitState<S> {
    /// Create the middleware state. An empty prefix means `ratelimit:`.
    pub fn new(limiter: Arc<TokenBucketLimiter<S>>, key_prefix: &str) -> Self {
        Self {
            limiter,
            key_prefix: key_prefix.to_string(),
        }
    }
}

/// Admit or reject a request based on its client's bucket.
///
/// Allowed requests go to the next handler, denied ones get
/// `429 Too Many Requests`, and limiter failures get `500`.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn enforce<S>(
    State(state): State<RateLimitState<S>>,
    request: Request,
    next: Next,
) -> Response
where
    S: SharedStateStore + ?Sized + 'static,
{
    let key = BucketKey::new(&state.key_prefix, &client_identity(&request));

    match state.limiter.allow(&key.to_store_key()).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            debug!(key = %key, "Request rate limited");
            (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response()
        }
        Err(e) => {
            error!(key = %key, error = %e, "Rate limiter failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

/// Derive the client identity for a request.
///
/// Uses the first `X-Forwarded-For` entry, then the peer address, and
/// otherwise a random identity so unknown clients never share a bucket.
pub fn client_identity<B>(request: &axum::http::Request<B>) -> String {
    let forwarded = request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(client) = forwarded {
        return client.to_string();
    }

    if let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return peer.ip().to_string();
    }

    anonymous_identity()
}

fn anonymous_identity() -> String {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("anon-{}", id)
}
