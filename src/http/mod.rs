//! HTTP boundary: rate limiting middleware and a demo server.

mod middleware;
mod server;

pub use middleware::{client_identity, enforce, RateLimitState, FORWARDED_FOR};
pub use server::HttpServer;
