use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;
use wildmatch::WildMatch;

use crate::config::UpstreamConfig;
use crate::error::{Result, SieveError};

/// Decides whether traffic for a destination goes through the upstream proxy
pub trait UpstreamPolicy: Send + Sync {
    fn use_upstream(&self, host: &str, port: u16) -> bool;
}

/// Host patterns that bypass the upstream proxy.
///
/// Patterns are matched case-insensitively against the destination host and
/// may contain `*` and `?` wildcards (`*.local`, `10.*`, `localhost`).
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<WildMatch>,
}

impl ExclusionList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .map(|p| WildMatch::new(&p))
                .collect(),
        }
    }

    pub fn is_excluded(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&host))
    }
}

impl UpstreamPolicy for ExclusionList {
    fn use_upstream(&self, host: &str, _port: u16) -> bool {
        !self.is_excluded(host)
    }
}

/// Where a connection for one request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct { host: String, port: u16 },
    Upstream { host: String, port: u16, authorization: Option<String> },
}

impl Route {
    pub fn select(
        upstream: Option<&UpstreamConfig>,
        policy: &dyn UpstreamPolicy,
        host: &str,
        port: u16,
    ) -> Self {
        match upstream {
            Some(up) if policy.use_upstream(host, port) => Route::Upstream {
                host: up.host.clone(),
                port: up.port,
                authorization: up.authorization.clone(),
            },
            _ => Route::Direct {
                host: host.to_string(),
                port,
            },
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Route::Upstream { .. })
    }

    /// The host and port the TCP connection is made to
    pub fn addr(&self) -> (&str, u16) {
        match self {
            Route::Direct { host, port } | Route::Upstream { host, port, .. } => (host, *port),
        }
    }

    pub fn authorization(&self) -> Option<&str> {
        match self {
            Route::Upstream { authorization, .. } => authorization.as_deref(),
            Route::Direct { .. } => None,
        }
    }

    pub async fn connect(&self, connect_timeout: Duration) -> Result<TcpStream> {
        let (host, port) = self.addr();
        connect_host_port(host, port, connect_timeout).await
    }
}

/// Resolve `host` and open a TCP connection with keep-alive enabled.
///
/// Resolution failures become `UnknownHost`, refusals `ConnectionRefused`,
/// and running out of `connect_timeout` becomes `Timeout`.
pub async fn connect_host_port(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let target = format_tcp_addr(host, port);

    let addrs: Vec<SocketAddr> = match timeout(connect_timeout, tokio::net::lookup_host(&target)).await {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(e)) => {
            debug!(host = %host, error = %e, "DNS lookup failed");
            return Err(SieveError::UnknownHost(host.to_string()));
        }
        Err(_) => return Err(SieveError::Timeout),
    };

    if addrs.is_empty() {
        return Err(SieveError::UnknownHost(host.to_string()));
    }

    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, connect_addr(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "TCP connect failed");
                last_err = Some(classify_connect_error(e, &target));
            }
            Err(_) => {
                debug!(addr = %addr, "TCP connect timed out");
                last_err = Some(SieveError::Timeout);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| SieveError::ConnectFailed(target)))
}

async fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn classify_connect_error(err: io::Error, target: &str) -> SieveError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => SieveError::ConnectionRefused(target.to_string()),
        io::ErrorKind::TimedOut => SieveError::Timeout,
        _ => SieveError::ConnectFailed(format!("{}: {}", target, err)),
    }
}

/// Split a `host[:port]` authority, accepting bracketed IPv6 literals.
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority.trim();
    let invalid = || SieveError::InvalidRequest(format!("Invalid authority '{}'", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            // A second colon means an unbracketed IPv6 literal without port.
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

pub fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
