//! Proxy server implementation
//!
//! Accepts client connections and runs every request through the handler
//! chain, keeping connections open while requests ask for it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, error, info, instrument};

use crate::config::{ProxyServerConfig, UpstreamConfig};
use crate::error::{Result, SieveError};
use crate::models::{AuditRecord, RequestStats};
use crate::proxy::chain::{Flow, HandlerChain};
use crate::proxy::classifier::{AllowAll, DecisionService, RequestFilter};
use crate::proxy::egress::{ExclusionList, UpstreamPolicy};
use crate::proxy::forward::{ForwardHandler, IdentityRewriter, ResponseRewriter};
use crate::proxy::normalize::TransparentUrl;
use crate::proxy::tunnel::TunnelHandler;
use crate::proxy::wire::ClientConn;

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    service: Arc<dyn DecisionService>,
    upstream: Option<Arc<UpstreamConfig>>,
    policy: Arc<dyn UpstreamPolicy>,
    rewriter: Arc<dyn ResponseRewriter>,
    stats: Arc<RequestStats>,
    audit: Option<broadcast::Sender<AuditRecord>>,
    request_ids: Arc<AtomicU64>,
    limiter: Option<Arc<Semaphore>>,
}

impl ProxyServer {
    /// Run the proxy server on the configured address
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SieveError::InvalidConfig(format!("Cannot listen on {}: {}", addr, e)))?;

        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until shutdown is signalled
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let chain = self.chain(local_addr);
        info!("Proxy server listening on {}", local_addr);

        loop {
            // Wait for a free connection slot before accepting.
            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Proxy server shutting down");
                            break;
                        }
                        continue;
                    }
                },
                None => None,
            };

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY: {}", e);
                            }

                            let chain = chain.clone();
                            let request_ids = self.request_ids.clone();
                            let conn = ClientConn::from_tcp(stream, client_addr);

                            tokio::spawn(async move {
                                Self::handle_connection(conn, chain, request_ids).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender can never signal again.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    pub fn stats(&self) -> Arc<RequestStats> {
        self.stats.clone()
    }

    fn chain(&self, local_addr: SocketAddr) -> HandlerChain {
        let connect_timeout = Duration::from_secs(self.config.connect_timeout);
        let request_timeout = Duration::from_secs(self.config.request_timeout);

        let mut filter = RequestFilter::new(self.service.clone(), self.stats.clone())
            .with_header_logging(self.config.log_headers);
        if let Some(audit) = &self.audit {
            filter = filter.with_audit(audit.clone());
        }

        let tunnel = TunnelHandler::new(self.upstream.clone(), self.policy.clone(), connect_timeout);

        let via = format!("{} ({})", local_addr, self.config.name);
        let forward = ForwardHandler::new(self.service.clone(), via, connect_timeout, request_timeout)
            .with_upstream(self.upstream.clone(), self.policy.clone())
            .with_rewriter(self.rewriter.clone())
            .with_header_logging(self.config.log_headers);

        HandlerChain::new()
            .with(Arc::new(TransparentUrl::new()))
            .with(Arc::new(filter))
            .with(Arc::new(tunnel))
            .with(Arc::new(forward))
    }

    /// Serve requests on one client connection until it closes
    async fn handle_connection(mut conn: ClientConn, chain: HandlerChain, request_ids: Arc<AtomicU64>) {
        let peer = conn.peer();

        loop {
            let id = request_ids.fetch_add(1, Ordering::Relaxed) + 1;

            let mut request = match conn.read_request_head(id).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(SieveError::Io(e)) => {
                    debug!(peer = %peer, "Connection error: {}", e);
                    break;
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Rejecting request");
                    let status = e.status_code();
                    let response = format!(
                        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Error")
                    );
                    let _ = conn.write_all(response.as_bytes()).await;
                    break;
                }
            };

            debug!(id, peer = %peer, "{}", request);

            let keep_alive = match chain.respond(&mut request, &mut conn).await {
                Ok(Flow::Done { keep_alive }) => keep_alive,
                Ok(Flow::Next) => {
                    let _ = conn
                        .send_error(&mut request, StatusCode::NOT_FOUND, "No handler for this request")
                        .await;
                    false
                }
                Err(e) => {
                    debug!(id, error = %e, "Request failed");
                    false
                }
            };

            if !keep_alive {
                break;
            }
        }

        debug!(peer = %peer, "Client connection closed");
    }
}

/// Builder for creating a proxy server
pub struct ProxyServerBuilder {
    config: ProxyServerConfig,
    service: Option<Arc<dyn DecisionService>>,
    upstream: Option<UpstreamConfig>,
    policy: Option<Arc<dyn UpstreamPolicy>>,
    rewriter: Option<Arc<dyn ResponseRewriter>>,
    stats: Option<Arc<RequestStats>>,
    audit: Option<broadcast::Sender<AuditRecord>>,
    request_ids: Option<Arc<AtomicU64>>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyServerConfig) -> Self {
        Self {
            config,
            service: None,
            upstream: None,
            policy: None,
            rewriter: None,
            stats: None,
            audit: None,
            request_ids: None,
        }
    }

    pub fn decision_service(mut self, service: Arc<dyn DecisionService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn upstream(mut self, upstream: Option<UpstreamConfig>) -> Self {
        self.upstream = upstream;
        self
    }

    /// Replace the exclusion list derived from the upstream configuration
    pub fn upstream_policy(mut self, policy: Arc<dyn UpstreamPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn response_rewriter(mut self, rewriter: Arc<dyn ResponseRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn stats(mut self, stats: Arc<RequestStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn audit(mut self, audit: broadcast::Sender<AuditRecord>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn request_ids(mut self, ids: Arc<AtomicU64>) -> Self {
        self.request_ids = Some(ids);
        self
    }

    pub fn build(self) -> ProxyServer {
        let policy = self.policy.unwrap_or_else(|| {
            let exclusions = self
                .upstream
                .as_ref()
                .map(|u| u.exclusions.clone())
                .unwrap_or_default();
            Arc::new(ExclusionList::new(exclusions))
        });

        let limiter = (self.config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_connections)));

        ProxyServer {
            service: self.service.unwrap_or_else(|| Arc::new(AllowAll)),
            upstream: self.upstream.map(Arc::new),
            policy,
            rewriter: self.rewriter.unwrap_or_else(|| Arc::new(IdentityRewriter)),
            stats: self.stats.unwrap_or_default(),
            audit: self.audit,
            request_ids: self.request_ids.unwrap_or_default(),
            limiter,
            config: self.config,
        }
    }
}
