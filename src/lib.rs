//! Tollgate - Distributed Token-Bucket Rate Limiting
//!
//! This crate implements admission control shared by any number of callers.
//! Bucket state lives in a shared store and every decision is one atomic
//! read-modify-write on that store, so concurrent callers never overspend a
//! bucket.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
