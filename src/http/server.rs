//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{enforce, RateLimitState};
use crate::error::{Result, TollgateError};
use crate::ratelimit::TokenBucketLimiter;
use crate::store::SharedStateStore;

/// HTTP server with every route behind the rate limiter.
pub struct HttpServer<S: ?Sized> {
    /// Address to bind to
    addr: SocketAddr,
    /// The limiter instance
    limiter: Arc<TokenBucketLimiter<S>>,
    /// Bucket key namespace
    key_prefix: String,
}

impl<S: SharedStateStore + ?Sized + 'static> HttpServer<S> {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiter: Arc<TokenBucketLimiter<S>>, key_prefix: &str) -> Self {
        Self {
            addr,
            limiter,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// The routes served, wrapped in the rate limiting middleware.
    pub fn router(&self) -> Router {
        let state = RateLimitState::new(self.limiter.clone(), &self.key_prefix);

        Router::new()
            .route("/ping", get(ping))
            .route("/hello", get(hello))
            .layer(axum::middleware::from_fn_with_state(state, enforce::<S>))
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TollgateError::Io(e)
            })
    }
}

async fn ping() -> &'static str {
    "pong"
}

async fn hello() -> &'static str {
    "hello world"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::store::MemoryStore;

    fn test_server(capacity: u32) -> HttpServer<MemoryStore> {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let limiter = Arc::new(TokenBucketLimiter::new(
            Arc::new(MemoryStore::new()),
            capacity,
            Duration::from_secs(60),
        ));
        HttpServer::new(addr, limiter, "ratelimit:")
    }

    fn get_from(uri: &str, client: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_share_one_bucket_per_client() {
        let router = test_server(2).router();

        let response = router.clone().oneshot(get_from("/ping", "192.0.2.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"pong");

        let response = router.clone().oneshot(get_from("/hello", "192.0.2.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router.oneshot(get_from("/ping", "192.0.2.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let server = test_server(10);
        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
