//! Plain HTTP forwarding
//!
//! Absolute `http:` requests are sent to the origin (or the upstream proxy)
//! with hyper's HTTP/1 client connection; the response is written back to the
//! client by hand so framing and header order stay under our control.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};
use url::{Position, Url};

use crate::codec::ChunkedWriter;
use crate::config::UpstreamConfig;
use crate::error::{Result, SieveError};
use crate::models::{protocol_str, BodyKind, Headers, InboundRequest};
use crate::proxy::chain::{Flow, Handler};
use crate::proxy::classifier::DecisionService;
use crate::proxy::egress::{ExclusionList, Route, UpstreamPolicy};
use crate::proxy::inject::{ContentDecoder, ElementHider};
use crate::proxy::wire::{dump_headers, BodyReader, ClientConn, ClientWriter};

/// Request headers that only concern the client-to-proxy hop
const REQUEST_POINT_TO_POINT: &[&str] = &[
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Upgrade",
    "Proxy-Authorization",
    "Transfer-Encoding",
];

/// Response headers that only concern the proxy-to-origin hop
const RESPONSE_POINT_TO_POINT: &[&str] = &[
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Upgrade",
    "Proxy-Authenticate",
    "Public",
    "Transfer-Encoding",
];

/// Request body pieces buffered between the client socket and hyper
const BODY_CHANNEL_DEPTH: usize = 4;

type OutboundBody = BoxBody<Bytes, io::Error>;

/// Post-processing applied to response headers before they reach the client
pub trait ResponseRewriter: Send + Sync {
    fn rewrite(&self, request: &InboundRequest, status: StatusCode, headers: &mut Headers);
}

/// Leaves headers as they are
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityRewriter;

impl ResponseRewriter for IdentityRewriter {
    fn rewrite(&self, _: &InboundRequest, _: StatusCode, _: &mut Headers) {}
}

/// Aborts the hyper connection task when the request is finished with it
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// How the response body is framed towards the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    NoBody,
    Verbatim,
    Chunked,
    CloseDelimited,
}

enum BodySink<'a> {
    Raw(&'a mut ClientWriter),
    Chunked(ChunkedWriter<&'a mut ClientWriter>),
}

impl BodySink<'_> {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            BodySink::Raw(w) => {
                w.write_all(data).await?;
                w.flush().await
            }
            BodySink::Chunked(c) => c.write_all(data).await,
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        match self {
            BodySink::Raw(w) => w.flush().await,
            BodySink::Chunked(c) => c.finish().await,
        }
    }
}

/// Forwards absolute HTTP requests and relays the responses
pub struct ForwardHandler {
    service: Arc<dyn DecisionService>,
    upstream: Option<Arc<UpstreamConfig>>,
    policy: Arc<dyn UpstreamPolicy>,
    rewriter: Arc<dyn ResponseRewriter>,
    /// `host:port (name)` part of the Via header
    via: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    log_headers: bool,
}

impl ForwardHandler {
    pub fn new(
        service: Arc<dyn DecisionService>,
        via: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            service,
            upstream: None,
            policy: Arc::new(ExclusionList::default()),
            rewriter: Arc::new(IdentityRewriter),
            via: via.into(),
            connect_timeout,
            request_timeout,
            log_headers: false,
        }
    }

    pub fn with_upstream(
        mut self,
        upstream: Option<Arc<UpstreamConfig>>,
        policy: Arc<dyn UpstreamPolicy>,
    ) -> Self {
        self.upstream = upstream;
        self.policy = policy;
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn ResponseRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_header_logging(mut self, enabled: bool) -> Self {
        self.log_headers = enabled;
        self
    }

    /// Send the request and wait for the response head.
    ///
    /// The request body is streamed from the client while hyper writes the
    /// request; the response wait is bounded by `request_timeout` once the
    /// body has been sent.
    async fn exchange(
        &self,
        request: &mut InboundRequest,
        conn: &mut ClientConn,
        route: &Route,
        target: &str,
        url: &Url,
    ) -> Result<(Response<Incoming>, ConnectionGuard)> {
        let stream = route.connect(self.connect_timeout).await?;

        let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await?;

        let guard = ConnectionGuard(tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Origin connection ended: {}", e);
            }
        }));

        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let body: OutboundBody = if request.body == BodyKind::None {
            Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
        } else {
            StreamBody::new(ReceiverStream::new(body_rx)).boxed()
        };

        let outbound = build_request(request, route, target, url, body)?;

        let kind = request.body;
        let mut pump = Box::pin(pump_request_body(conn, kind, body_tx));
        let mut pending = Box::pin(sender.send_request(outbound));
        let deadline = tokio::time::sleep(self.request_timeout);
        tokio::pin!(deadline);
        let mut body_sent = false;

        let response = loop {
            tokio::select! {
                res = &mut pending => break res.map_err(SieveError::from),
                res = &mut pump, if !body_sent => {
                    body_sent = true;
                    if let Err(e) = res {
                        debug!(error = %e, "Request body ended early");
                        request.keep_alive = false;
                    }
                    deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.request_timeout);
                }
                _ = &mut deadline, if body_sent => break Err(SieveError::Timeout),
            }
        };

        // An unfinished body is still on the client connection.
        if !body_sent {
            request.keep_alive = false;
        }
        drop(pump);

        Ok((response?, guard))
    }

    /// Write the response head and body to the client
    async fn relay_response(
        &self,
        request: &mut InboundRequest,
        conn: &mut ClientConn,
        url: &Url,
        response: Response<Incoming>,
    ) -> Result<()> {
        let (parts, mut body) = response.into_parts();
        let status = parts.status;

        let mut headers = Headers::new();
        for (name, value) in parts.headers.iter() {
            headers.add(
                title_case(name.as_str()),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }

        if self.log_headers {
            debug!(
                "\n      {} {}\n{}",
                protocol_str(parts.version),
                status,
                dump_headers(request.id, request, &headers, false)
            );
        }

        self.rewriter.rewrite(request, status, &mut headers);
        for name in RESPONSE_POINT_TO_POINT {
            headers.remove(name);
        }
        headers.add("Via", format!("{} {}", protocol_str(parts.version), self.via));

        let no_body = request.method.eq_ignore_ascii_case("HEAD")
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let mut hiding = None;
        if !no_body && status == StatusCode::OK && is_html(&headers) {
            let selectors = self.selectors_for(url).await;
            if !selectors.is_empty() {
                match ContentDecoder::for_encoding(headers.get("Content-Encoding")) {
                    Some(decoder) => {
                        headers.remove("Content-Length");
                        headers.remove("Content-Encoding");
                        hiding = Some((decoder, ElementHider::new(&selectors)));
                    }
                    None => debug!(
                        encoding = headers.get("Content-Encoding").unwrap_or(""),
                        "Unsupported encoding, page passed through"
                    ),
                }
            }
        }

        let framing = if no_body {
            Framing::NoBody
        } else if hiding.is_none() && headers.contains("Content-Length") {
            Framing::Verbatim
        } else if request.version == Version::HTTP_11 {
            Framing::Chunked
        } else {
            Framing::CloseDelimited
        };

        match framing {
            Framing::Chunked => headers.add("Transfer-Encoding", "chunked"),
            Framing::CloseDelimited => request.keep_alive = false,
            _ => {}
        }
        headers.add(
            request.connection_header,
            if request.keep_alive { "Keep-Alive" } else { "close" },
        );

        let reason = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned())
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_default();

        conn.write_head(request.version, status, &reason, &headers)
            .await?;

        if framing == Framing::NoBody {
            return Ok(());
        }

        let mut sink = if framing == Framing::Chunked {
            BodySink::Chunked(ChunkedWriter::new(conn.writer()))
        } else {
            BodySink::Raw(conn.writer())
        };

        while let Some(data) = next_data(&mut body, self.request_timeout).await? {
            match hiding.as_mut() {
                Some((decoder, hider)) => {
                    let decoded = decoder.decode(&data)?;
                    sink.write(&hider.feed(&decoded)).await?;
                }
                None => sink.write(&data).await?,
            }
        }

        if let Some((decoder, mut hider)) = hiding {
            let mut tail = hider.feed(&decoder.finish()?);
            tail.extend(hider.finish());
            sink.write(&tail).await?;
            debug!(inserted = hider.inserted(), "Element hiding applied");
        }

        sink.finish().await?;
        Ok(())
    }

    async fn selectors_for(&self, url: &Url) -> Vec<String> {
        let host = url.host_str().unwrap_or("");
        match self.service.selectors_for_domain(host).await {
            Ok(selectors) => selectors,
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to get element hiding selectors");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    fn name(&self) -> &'static str {
        "forward"
    }

    #[instrument(skip(self, request, conn), fields(id = request.id, method = %request.method, url = %request.url))]
    async fn respond(&self, request: &mut InboundRequest, conn: &mut ClientConn) -> Result<Flow> {
        if request.is_connect() {
            return Ok(Flow::Next);
        }

        let url = match Url::parse(&request.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return Ok(Flow::Next),
        };

        // "Proxy-Connection" may be used instead of "Connection" between
        // the client and this proxy.
        if let Some(value) = request.headers.get("Proxy-Connection") {
            request.keep_alive = value.trim().eq_ignore_ascii_case("keep-alive");
            request.connection_header = "Proxy-Connection";
        }

        for name in REQUEST_POINT_TO_POINT {
            request.headers.remove(name);
        }

        let host = url.host_str().unwrap_or_default();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let route = Route::select(self.upstream.as_deref(), self.policy.as_ref(), &host, port);

        if url.scheme() == "https" && !route.is_upstream() {
            let e = SieveError::NotImplemented("https without an upstream proxy".to_string());
            warn!(error = %e, "Cannot forward request");
            conn.send_error(request, e.status_code(), &e.client_message())
                .await?;
            return Ok(Flow::Done { keep_alive: false });
        }

        let target = if route.is_upstream() {
            request.url.clone()
        } else {
            url[Position::BeforePath..Position::AfterQuery].to_string()
        };

        let (response, _guard) = match self.exchange(request, conn, &route, &target, &url).await {
            Ok(exchanged) => exchanged,
            Err(e) => {
                warn!(error = %e, "Forwarding failed");
                conn.send_error(request, e.status_code(), &e.client_message())
                    .await?;
                return Ok(Flow::Done { keep_alive: false });
            }
        };

        match self.relay_response(request, conn, &url, response).await {
            Ok(()) => Ok(Flow::Done {
                keep_alive: request.keep_alive,
            }),
            Err(e) => {
                debug!(error = %e, "Response relay ended");
                Ok(Flow::Done { keep_alive: false })
            }
        }
    }
}

fn build_request(
    request: &InboundRequest,
    route: &Route,
    target: &str,
    url: &Url,
    body: OutboundBody,
) -> Result<Request<OutboundBody>> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| SieveError::InvalidRequest(format!("Invalid method: {}", request.method)))?;
    let uri: Uri = target
        .parse()
        .map_err(|e| SieveError::InvalidRequest(format!("Invalid target '{}': {}", target, e)))?;

    let mut outbound = Request::new(body);
    *outbound.method_mut() = method;
    *outbound.uri_mut() = uri;
    *outbound.version_mut() = request.version;

    let headers = outbound.headers_mut();
    for (name, value) in request.headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = %name, "Dropping invalid request header"),
        }
    }

    if !headers.contains_key(http::header::HOST) {
        let authority = &url[Position::BeforeHost..Position::AfterPort];
        if let Ok(value) = HeaderValue::from_str(authority) {
            headers.insert(http::header::HOST, value);
        }
    }

    if let Some(auth) = route.authorization() {
        if let Ok(value) = HeaderValue::from_str(auth) {
            headers.insert(http::header::PROXY_AUTHORIZATION, value);
        }
    }

    Ok(outbound)
}

/// Read the request body from the client into the channel feeding hyper
async fn pump_request_body(
    conn: &mut ClientConn,
    kind: BodyKind,
    tx: mpsc::Sender<io::Result<Frame<Bytes>>>,
) -> io::Result<u64> {
    let mut reader = BodyReader::new(kind);
    let mut total = 0u64;

    loop {
        match reader.next_chunk(conn).await {
            Ok(Some(data)) => {
                total += data.len() as u64;
                if tx.send(Ok(Frame::data(data))).await.is_err() {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "origin stopped reading the request body",
                    ));
                }
            }
            Ok(None) => return Ok(total),
            Err(e) => {
                let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
                return Err(e);
            }
        }
    }
}

/// Next non-empty data frame of the response body.
///
/// An origin that sends nothing for `idle` ends the relay with `Timeout`.
async fn next_data(body: &mut Incoming, idle: Duration) -> Result<Option<Bytes>> {
    loop {
        let frame = match tokio::time::timeout(idle, body.frame()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Ok(None),
            Err(_) => return Err(SieveError::Timeout),
        };
        if let Ok(data) = frame.into_data() {
            if !data.is_empty() {
                return Ok(Some(data));
            }
        }
    }
}

fn is_html(headers: &Headers) -> bool {
    headers
        .get("Content-Type")
        .is_some_and(|t| t.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

/// `content-type` -> `Content-Type`
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        out.push(if upper { c.to_ascii_uppercase() } else { c });
        upper = c == '-';
    }
    out
}
