//! Sieve Proxy Server - Entry Point
//!
//! Starts the filtering proxy with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sieve::models::{AuditRecord, RequestStats};
use sieve::proxy::{HostBlocklist, ProxyServerBuilder};
use sieve::{Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sieve={}", config.log.level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Sieve Proxy Server");

    let blocklist = HostBlocklist::new(&config.blocklist);
    info!("Blocking {} domains", config.blocklist.len());

    if let Some(upstream) = &config.upstream {
        info!(
            "Chaining through upstream proxy {}:{} ({} exclusions)",
            upstream.host,
            upstream.port,
            upstream.exclusions.len()
        );
    }

    let stats = Arc::new(RequestStats::new());

    // Create audit broadcast channel (bounded to prevent memory leaks)
    let (audit_tx, audit_rx) = broadcast::channel::<AuditRecord>(1024);
    let audit_task = tokio::spawn(log_audit_records(audit_rx));

    let proxy_server = ProxyServerBuilder::new(config.proxy.clone())
        .decision_service(Arc::new(blocklist))
        .upstream(config.upstream.clone())
        .stats(stats.clone())
        .audit(audit_tx)
        .build();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Server started - Proxy: {}", config.proxy_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;

    // Idle client connections may still hold audit senders.
    audit_task.abort();

    info!(
        blocked = stats.blocked(),
        allowed = stats.allowed(),
        "Sieve Proxy Server stopped"
    );
    Ok(())
}

/// Write every filtering decision to the log as a JSON line
async fn log_audit_records(mut records: broadcast::Receiver<AuditRecord>) {
    loop {
        match records.recv().await {
            Ok(record) => match serde_json::to_string(&record) {
                Ok(line) => info!(target: "sieve::audit", "{}", line),
                Err(e) => debug!("Failed to encode audit record: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Audit log lagged, {} records skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
