//! HTTP/1.x framing on the raw client connection
//!
//! Only what a proxy front end needs: request heads are parsed with httparse,
//! bodies are streamed through on demand, and responses are written as raw
//! bytes so header order and case survive untouched.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, SieveError};
use crate::models::{protocol_str, BodyKind, Headers, InboundRequest};

/// Upper bound for a request head (request line plus headers)
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;
const READ_BLOCK: usize = 4096;

pub type ClientReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The client side of a proxied connection
pub struct ClientConn {
    reader: ClientReader,
    writer: ClientWriter,
    /// Bytes read from the client but not yet consumed
    buf: BytesMut,
    peer: SocketAddr,
}

impl ClientConn {
    pub fn new(reader: ClientReader, writer: ClientWriter, peer: SocketAddr) -> Self {
        Self {
            reader,
            writer,
            buf: BytesMut::with_capacity(READ_BLOCK),
            peer,
        }
    }

    pub fn from_tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(Box::new(reader), Box::new(writer), peer)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn writer(&mut self) -> &mut ClientWriter {
        &mut self.writer
    }

    /// Hand out both halves, e.g. for a tunnel relay
    pub fn halves(&mut self) -> (&mut ClientReader, &mut ClientWriter) {
        (&mut self.reader, &mut self.writer)
    }

    /// Take whatever the client sent past the current request head
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Read the next request head.
    ///
    /// Returns `Ok(None)` when the client closed the connection cleanly
    /// between requests.
    pub async fn read_request_head(&mut self, id: u64) -> Result<Option<InboundRequest>> {
        loop {
            if !self.buf.is_empty() {
                if let Some((request, consumed)) = self.parse_head(id)? {
                    self.buf.advance(consumed);
                    return Ok(Some(request));
                }
            }

            if self.buf.len() >= MAX_HEAD_SIZE {
                return Err(SieveError::HeaderTooLarge);
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(SieveError::InvalidRequest(
                    "connection closed inside request head".to_string(),
                ));
            }
        }
    }

    fn parse_head(&self, id: u64) -> Result<Option<(InboundRequest, usize)>> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut slots);

        let consumed = match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => return Err(SieveError::HeaderTooLarge),
            Err(e) => {
                return Err(SieveError::InvalidRequest(format!(
                    "malformed request head: {}",
                    e
                )))
            }
        };

        let method = parsed.method.unwrap_or_default().to_string();
        let url = parsed.path.unwrap_or_default().to_string();
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut headers = Headers::new();
        for h in parsed.headers.iter() {
            headers.add(h.name, String::from_utf8_lossy(h.value).into_owned());
        }

        let body = body_kind(&headers)?;
        let keep_alive = default_keep_alive(version, headers.get("Connection"));

        Ok(Some((
            InboundRequest {
                id,
                method,
                url,
                version,
                headers,
                body,
                peer: self.peer,
                keep_alive,
                connection_header: "Connection",
            },
            consumed,
        )))
    }

    /// Next piece of raw client input, at most `limit` bytes; empty on EOF
    pub async fn read_some(&mut self, limit: usize) -> io::Result<Bytes> {
        if self.buf.is_empty() {
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(Bytes::new());
            }
        }
        let take = limit.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }

    /// Read one CRLF-terminated line, without the terminator
    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            if self.buf.len() >= MAX_HEAD_SIZE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Read and discard the request body
    pub async fn drain_body(&mut self, kind: BodyKind) -> io::Result<u64> {
        let mut body = BodyReader::new(kind);
        let mut total = 0u64;
        while let Some(piece) = body.next_chunk(self).await? {
            total += piece.len() as u64;
        }
        Ok(total)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    /// Write a status line and headers, followed by the blank line
    pub async fn write_head(
        &mut self,
        version: Version,
        status: StatusCode,
        reason: &str,
        headers: &Headers,
    ) -> io::Result<()> {
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!("{} {} {}\r\n", protocol_str(version), status.as_u16(), reason).as_bytes(),
        );
        headers.write_to(&mut head);
        head.extend_from_slice(b"\r\n");
        self.write_all(&head).await
    }

    /// Send a small complete response with a text body
    pub async fn send_response(
        &mut self,
        request: &InboundRequest,
        status: StatusCode,
        reason: &str,
        content_type: &str,
        body: &str,
    ) -> io::Result<()> {
        let mut headers = Headers::new();
        headers.add("Content-Type", content_type);
        headers.add("Content-Length", body.len().to_string());
        headers.add(
            request.connection_header,
            if request.keep_alive { "Keep-Alive" } else { "close" },
        );

        self.write_head(request.version, status, reason, &headers)
            .await?;
        if !request.method.eq_ignore_ascii_case("HEAD") {
            self.write_all(body.as_bytes()).await?;
        }
        Ok(())
    }

    /// Send an error page. The connection is not reused afterwards.
    pub async fn send_error(
        &mut self,
        request: &mut InboundRequest,
        status: StatusCode,
        message: &str,
    ) -> io::Result<()> {
        request.keep_alive = false;
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = error_page(status, reason, &request.url, message);
        self.send_response(request, status, reason, "text/html", &body)
            .await
    }
}

/// Pull-based reader for a request body, undoing chunked framing
#[derive(Debug)]
pub struct BodyReader {
    kind: BodyKind,
    /// Bytes left in the body (length-delimited) or current chunk (chunked)
    remaining: u64,
    in_chunk: bool,
    done: bool,
}

impl BodyReader {
    pub fn new(kind: BodyKind) -> Self {
        Self {
            kind,
            remaining: match kind {
                BodyKind::Length(len) => len,
                _ => 0,
            },
            in_chunk: false,
            done: kind == BodyKind::None,
        }
    }

    /// Next piece of body data, or `None` once the body is complete
    pub async fn next_chunk(&mut self, conn: &mut ClientConn) -> io::Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }

        match self.kind {
            BodyKind::None => {
                self.done = true;
                return Ok(None);
            }
            BodyKind::Length(_) => {
                if self.remaining == 0 {
                    self.done = true;
                    return Ok(None);
                }
            }
            BodyKind::Chunked => {
                if self.remaining == 0 {
                    if self.in_chunk {
                        if !conn.read_line().await?.is_empty() {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "missing CRLF after chunk",
                            ));
                        }
                        self.in_chunk = false;
                    }

                    let line = conn.read_line().await?;
                    let size_field = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_field, 16).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;

                    if size == 0 {
                        // Trailers end with an empty line.
                        while !conn.read_line().await?.is_empty() {}
                        self.done = true;
                        return Ok(None);
                    }

                    self.remaining = size;
                    self.in_chunk = true;
                }
            }
        }

        let limit = self.remaining.min(READ_BLOCK as u64) as usize;
        let piece = conn.read_some(limit).await?;
        if piece.is_empty() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.remaining -= piece.len() as u64;
        Ok(Some(piece))
    }
}

/// Determine request body framing from the headers
pub fn body_kind(headers: &Headers) -> Result<BodyKind> {
    if let Some(te) = headers.get("Transfer-Encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyKind::Chunked);
        }
    }

    match headers.get("Content-Length") {
        Some(value) => {
            let len: u64 = value.trim().parse().map_err(|_| {
                SieveError::InvalidRequest(format!("invalid Content-Length: {}", value))
            })?;
            Ok(if len == 0 {
                BodyKind::None
            } else {
                BodyKind::Length(len)
            })
        }
        None => Ok(BodyKind::None),
    }
}

/// Persistence implied by the protocol version and a Connection-style header
pub fn default_keep_alive(version: Version, connection: Option<&str>) -> bool {
    match connection {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => version != Version::HTTP_10,
    }
}

fn error_page(status: StatusCode, reason: &str, url: &str, message: &str) -> String {
    format!(
        "<html>\n<head>\n<title>Error: {}</title>\n</head>\n<body>\nGot the error: <b>{}</b><br>\nwhile trying to obtain <b>{}</b><br>\n{}\n</body>\n</html>",
        status.as_u16(),
        reason,
        html_escape(url),
        html_escape(message)
    )
}

/// Render headers for debug output, one `"   7> Name: value"` line each.
///
/// `sent` marks headers travelling towards the origin; when set, the request
/// line is printed first.
pub fn dump_headers(id: u64, request: &InboundRequest, headers: &Headers, sent: bool) -> String {
    let label = format!("{:>4}", id % 10_000);
    let prompt = if sent {
        format!("{}> ", label)
    } else {
        format!("{}< ", label)
    };

    let mut out = String::new();
    if sent {
        out.push_str(&prompt);
        out.push_str(&request.to_string());
        out.push('\n');
    }
    for (name, value) in headers.iter() {
        out.push_str(&prompt);
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
