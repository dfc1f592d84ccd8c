//! Rendergate - A prerendering reverse proxy for JavaScript-driven sites
//!
//! This library provides a reverse proxy that:
//! - Maps each public origin to an upstream origin
//! - Serves document requests as headless-browser snapshots of the page
//! - Blocks sub-resources a render does not need (whitelist plus URL blacklist)
//! - Keeps every render in memory as identity, gzip and brotli variants
//! - Coalesces concurrent renders of the same URL into one job
//! - Optionally writes rendered pages to disk for static hosting
//! - Forwards assets and everything else straight to the upstream
//! - Warms the cache from a list of seed URLs at startup

pub mod cache;
pub mod chrome;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod host_map;
pub mod persist;
pub mod policy;
pub mod pool;
pub mod prerender;
pub mod proxy;
pub mod router;
pub mod warmer;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
