//! Ordered request handlers
//!
//! Each accepted request is offered to the handlers in turn until one of them
//! answers it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::InboundRequest;
use crate::proxy::wire::ClientConn;

/// What the chain should do after a handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Offer the request to the next handler
    Next,
    /// The request has been answered
    Done { keep_alive: bool },
}

/// One step of request processing.
///
/// Handlers may rewrite the request in place before passing it on, or take
/// over the connection and answer it.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short name used in log fields
    fn name(&self) -> &'static str;

    async fn respond(&self, request: &mut InboundRequest, conn: &mut ClientConn) -> Result<Flow>;
}

/// Runs handlers in order until one answers
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offer the request to every handler in order.
    ///
    /// Returns `Flow::Next` when nobody answered.
    pub async fn respond(&self, request: &mut InboundRequest, conn: &mut ClientConn) -> Result<Flow> {
        for handler in &self.handlers {
            match handler.respond(request, conn).await? {
                Flow::Next => continue,
                done @ Flow::Done { .. } => {
                    tracing::trace!(handler = handler.name(), id = request.id, "request answered");
                    return Ok(done);
                }
            }
        }
        Ok(Flow::Next)
    }
}
