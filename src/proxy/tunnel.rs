//! CONNECT tunnel implementation for HTTPS proxying
//!
//! Opens a raw TCP connection to the target (or to the upstream proxy) and
//! relays bytes in both directions until either side closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::config::UpstreamConfig;
use crate::error::{Result, SieveError};
use crate::models::InboundRequest;
use crate::proxy::chain::{Flow, Handler};
use crate::proxy::egress::{parse_authority, Route, UpstreamPolicy};
use crate::proxy::wire::ClientConn;

/// Size of the blocks copied by each relay half
pub const RELAY_BLOCK: usize = 4096;

const DEFAULT_TLS_PORT: u16 = 443;

/// Handles CONNECT tunnel requests
pub struct TunnelHandler {
    upstream: Option<Arc<UpstreamConfig>>,
    policy: Arc<dyn UpstreamPolicy>,
    connect_timeout: Duration,
}

impl TunnelHandler {
    pub fn new(
        upstream: Option<Arc<UpstreamConfig>>,
        policy: Arc<dyn UpstreamPolicy>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            upstream,
            policy,
            connect_timeout,
        }
    }

    /// Connect to the target or upstream and perform the mode-specific handshake
    async fn establish(
        &self,
        request: &InboundRequest,
        conn: &mut ClientConn,
    ) -> Result<TcpStream> {
        let (host, port) = parse_authority(&request.url, DEFAULT_TLS_PORT)?;
        let route = Route::select(self.upstream.as_deref(), self.policy.as_ref(), &host, port);

        let mut server = route.connect(self.connect_timeout).await?;

        if route.is_upstream() {
            // Chained: the upstream answers the CONNECT itself.
            let mut headers = request.headers.clone();
            if let Some(auth) = route.authorization() {
                headers.set("Proxy-Authorization", auth);
            }

            let mut head = format!("{} {} {}\r\n", request.method, request.url, request.protocol())
                .into_bytes();
            headers.write_to(&mut head);
            head.extend_from_slice(b"\r\n");

            server.write_all(&head).await?;
            server.flush().await?;
            debug!(host = %host, port, "CONNECT forwarded to upstream");
        } else {
            conn.write_all(format!("{} 200 Connection established\r\n\r\n", request.protocol()).as_bytes())
                .await?;
            debug!(host = %host, port, "Direct tunnel established");
        }

        Ok(server)
    }
}

#[async_trait]
impl Handler for TunnelHandler {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    #[instrument(skip(self, request, conn), fields(id = request.id, target = %request.url))]
    async fn respond(&self, request: &mut InboundRequest, conn: &mut ClientConn) -> Result<Flow> {
        if !request.is_connect() {
            return Ok(Flow::Next);
        }

        let mut server = match self.establish(request, conn).await {
            Ok(server) => server,
            Err(e) => {
                warn!(error = %e, "SSL connection failure");
                conn.send_error(request, StatusCode::INTERNAL_SERVER_ERROR, "SSL connection failure")
                    .await?;
                return Ok(Flow::Done { keep_alive: false });
            }
        };

        let leftover = conn.take_buffered();
        if !leftover.is_empty() {
            server
                .write_all(&leftover)
                .await
                .map_err(|e| SieveError::TunnelError(e.to_string()))?;
        }

        let (client_read, client_write) = conn.halves();
        let (server_read, server_write) = server.into_split();
        let (sent, received) = relay(client_read, client_write, server_read, server_write).await;

        debug!(
            bytes_sent = sent + leftover.len() as u64,
            bytes_received = received,
            "Tunnel closed"
        );

        Ok(Flow::Done { keep_alive: false })
    }
}

/// Copy bytes in both directions until one side finishes.
///
/// When either half ends it shuts down its write side and signals the other
/// half to stop reading. Returns `(client -> server, server -> client)` byte
/// counts once both halves are done.
pub async fn relay<CR, CW, SR, SW>(
    client_read: CR,
    client_write: CW,
    server_read: SR,
    server_write: SW,
) -> (u64, u64)
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    SR: AsyncRead + Unpin,
    SW: AsyncWrite + Unpin,
{
    let (done_tx, done_rx) = watch::channel(false);

    let client_to_server = pump("client->server", client_read, server_write, done_rx.clone(), &done_tx);
    let server_to_client = pump("server->client", server_read, client_write, done_rx, &done_tx);

    tokio::join!(client_to_server, server_to_client)
}

async fn pump<R, W>(
    direction: &'static str,
    mut from: R,
    mut to: W,
    mut stop: watch::Receiver<bool>,
    done: &watch::Sender<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BLOCK];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            read = from.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(direction, error = %e, "Relay read ended");
                    break;
                }
            },
            _ = stop.changed() => break,
        };

        if let Err(e) = to.write_all(&buf[..n]).await {
            debug!(direction, error = %e, "Relay write ended");
            break;
        }
        if let Err(e) = to.flush().await {
            debug!(direction, error = %e, "Relay flush ended");
            break;
        }
        total += n as u64;
    }

    let _ = to.shutdown().await;
    let _ = done.send(true);
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::egress::ExclusionList;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn client_pair() -> (ClientConn, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let (r, w) = tokio::io::split(local);
        (
            ClientConn::new(Box::new(r), Box::new(w), "127.0.0.1:50000".parse().unwrap()),
            remote,
        )
    }

    fn connect_request(url: &str) -> InboundRequest {
        let mut headers = crate::models::Headers::new();
        headers.add("Host", url);
        headers.add("User-Agent", "test/1.0");
        InboundRequest {
            id: 9,
            method: "CONNECT".into(),
            url: url.into(),
            version: http::Version::HTTP_11,
            headers,
            body: crate::models::BodyKind::None,
            peer: "127.0.0.1:50000".parse().unwrap(),
            keep_alive: true,
            connection_header: "Connection",
        }
    }

    fn direct_handler() -> TunnelHandler {
        TunnelHandler::new(None, Arc::new(ExclusionList::default()), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (server, mut server_peer) = tokio::io::duplex(1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);

        let relay_task = tokio::spawn(async move { relay(cr, cw, sr, sw).await });

        client_peer.write_all(b"hello from client").await.unwrap();
        let mut buf = vec![0u8; 100];
        let n = server_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        server_peer.write_all(b"hello from server").await.unwrap();
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from server");

        drop(client_peer);

        let (sent, received) = timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(sent, 17);
        assert_eq!(received, 17);

        // The server side sees EOF once the client went away.
        let n = server_peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_direct_tunnel_relays_and_closes_origin() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
            // Wait for the tunnel to close our socket.
            let n = stream.read(&mut buf).await.unwrap();
            n
        });

        let (mut conn, mut client) = client_pair();
        let mut req = connect_request(&origin_addr.to_string());
        let handler = direct_handler();
        let tunnel = tokio::spawn(async move {
            let flow = handler.respond(&mut req, &mut conn).await.unwrap();
            drop(conn);
            flow
        });

        let expected = b"HTTP/1.1 200 Connection established\r\n\r\n";
        let mut head = vec![0u8; expected.len()];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, expected);

        client.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        drop(client);

        let eof = timeout(Duration::from_secs(2), origin_task)
            .await
            .expect("origin socket left open")
            .unwrap();
        assert_eq!(eof, 0);

        let flow = timeout(Duration::from_secs(2), tunnel).await.unwrap().unwrap();
        assert_eq!(flow, Flow::Done { keep_alive: false });
    }

    #[tokio::test]
    async fn test_buffered_bytes_reach_server_first() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (local, mut client) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(local);
        let mut conn = ClientConn::new(Box::new(r), Box::new(w), "127.0.0.1:50000".parse().unwrap());

        let head = format!("CONNECT {} HTTP/1.1\r\nHost: x\r\n\r\nhello", origin_addr);
        client.write_all(head.as_bytes()).await.unwrap();
        let mut req = conn.read_request_head(1).await.unwrap().unwrap();

        let handler = direct_handler();
        tokio::spawn(async move {
            let _ = handler.respond(&mut req, &mut conn).await;
        });

        let received = timeout(Duration::from_secs(2), origin_task).await.unwrap().unwrap();
        assert_eq!(&received, b"hello");
    }

    #[tokio::test]
    async fn test_chained_tunnel_forwards_connect_verbatim() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0);
                head.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 Tunnel ready\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });

        let cfg = Arc::new(UpstreamConfig {
            host: "127.0.0.1".to_string(),
            port: upstream_addr.port(),
            authorization: Some("Basic dXNlcjpwYXNz".to_string()),
            exclusions: Vec::new(),
        });
        let handler = TunnelHandler::new(
            Some(cfg),
            Arc::new(ExclusionList::default()),
            Duration::from_secs(2),
        );

        let (mut conn, mut client) = client_pair();
        let mut req = connect_request("secure.example.com:443");
        tokio::spawn(async move {
            let _ = handler.respond(&mut req, &mut conn).await;
        });

        let head = timeout(Duration::from_secs(2), upstream_task).await.unwrap().unwrap();
        assert_eq!(
            head,
            "CONNECT secure.example.com:443 HTTP/1.1\r\nHost: secure.example.com:443\r\nUser-Agent: test/1.0\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );

        // The upstream's own answer reaches the client, nothing synthesized.
        let mut answer = vec![0u8; 64];
        let n = client.read(&mut answer).await.unwrap();
        assert_eq!(&answer[..n], b"HTTP/1.1 200 Tunnel ready\r\n\r\n");
    }

    #[tokio::test]
    async fn test_setup_failure_returns_500() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut conn, mut client) = client_pair();
        let mut req = connect_request(&format!("127.0.0.1:{}", port));
        let flow = direct_handler().respond(&mut req, &mut conn).await.unwrap();
        assert_eq!(flow, Flow::Done { keep_alive: false });

        drop(conn);
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("SSL connection failure"));
    }

    #[tokio::test]
    async fn test_bad_port_returns_500() {
        let (mut conn, mut client) = client_pair();
        let mut req = connect_request("example.com:70000");
        direct_handler().respond(&mut req, &mut conn).await.unwrap();

        drop(conn);
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.contains("SSL connection failure"));
    }

    #[tokio::test]
    async fn test_non_connect_passes() {
        let (mut conn, _client) = client_pair();
        let mut req = connect_request("example.com:443");
        req.method = "GET".into();
        assert_eq!(direct_handler().respond(&mut req, &mut conn).await.unwrap(), Flow::Next);
    }
}
