//! Sieve - Filtering HTTP Proxy
//!
//! A local forward proxy that classifies every request, blocks the ones a
//! decision service rejects and passes the rest on.
//!
//! ## Features
//!
//! - HTTP/1.0 and HTTP/1.1 forwarding with keep-alive
//! - CONNECT tunnelling for HTTPS
//! - Chaining through an upstream proxy with host exclusions
//! - Content-type and third-party classification of requests
//! - Element-hiding style injection into HTML pages

pub mod codec;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{Result, SieveError};
