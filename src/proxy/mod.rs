//! Proxy server implementation
//!
//! This module provides the filtering proxy:
//! - Client-side HTTP/1.x wire handling
//! - A handler chain run for every request
//! - Request classification and blocking
//! - CONNECT tunnels and plain HTTP forwarding, optionally through an upstream proxy
//! - Element-hiding style injection into HTML responses

pub mod chain;
pub mod classifier;
pub mod egress;
pub mod forward;
pub mod inject;
pub mod normalize;
pub mod server;
pub mod tunnel;
pub mod wire;

pub use chain::{Flow, Handler, HandlerChain};
pub use classifier::{AllowAll, DecisionService, HostBlocklist, RequestClassifier, RequestFilter};
pub use egress::{ExclusionList, Route, UpstreamPolicy};
pub use forward::{ForwardHandler, IdentityRewriter, ResponseRewriter};
pub use normalize::TransparentUrl;
pub use server::{ProxyServer, ProxyServerBuilder};
pub use tunnel::TunnelHandler;
