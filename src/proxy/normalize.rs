//! Transparent-proxy URL reconstruction
//!
//! Requests redirected to the proxy without the client knowing carry
//! origin-form targets (`/path`). Rebuild the absolute URL from `Host` so
//! later handlers always see `http://host/path`.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::InboundRequest;
use crate::proxy::chain::{Flow, Handler};
use crate::proxy::wire::ClientConn;

#[derive(Debug, Default, Clone, Copy)]
pub struct TransparentUrl;

impl TransparentUrl {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite a relative target in place
    pub fn normalize(request: &mut InboundRequest) {
        if request.is_connect() || request.url.contains("://") {
            return;
        }

        if let Some(host) = request.headers.get("Host") {
            request.url = format!("http://{}{}", host.trim(), request.url);
        }
    }
}

#[async_trait]
impl Handler for TransparentUrl {
    fn name(&self) -> &'static str {
        "transparent"
    }

    async fn respond(&self, request: &mut InboundRequest, _conn: &mut ClientConn) -> Result<Flow> {
        Self::normalize(request);
        Ok(Flow::Next)
    }
}
