//! Byte-level helpers for response bodies
//!
//! - Chunked transfer-encoding framing for streamed responses
//! - Boyer–Moore pattern search used for content inspection

pub mod chunked;
pub mod matcher;

pub use chunked::ChunkedWriter;
pub use matcher::ByteMatcher;
