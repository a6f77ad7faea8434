//! HTTP/1.1 chunked transfer-encoding writer

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Largest chunk emitted by [`ChunkedWriter::write_all`]
pub const MAX_CHUNK_SIZE: usize = 2048;

const CRLF: &[u8] = b"\r\n";
const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frames writes as `<hex-len>\r\n<payload>\r\n` chunks.
///
/// A zero-length chunk marks the end of the body, so empty writes are
/// dropped and the terminator is only ever written once.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
    wrote_final_chunk: bool,
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            wrote_final_chunk: false,
        }
    }

    /// Write `buf` as a single chunk and flush the sink
    pub async fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let header = format!("{:x}\r\n", buf.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(buf).await?;
        self.inner.write_all(CRLF).await?;
        self.inner.flush().await
    }

    /// Write `buf` as one or more chunks of at most [`MAX_CHUNK_SIZE`] bytes
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        for chunk in buf.chunks(MAX_CHUNK_SIZE) {
            self.write_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Single-byte writes would each become a whole chunk; they are refused.
    pub async fn write_u8(&mut self, _byte: u8) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "single-byte writes are not supported by the chunked writer",
        ))
    }

    /// Write the terminating zero-length chunk unconditionally
    pub async fn write_final_chunk(&mut self) -> io::Result<()> {
        self.inner.write_all(FINAL_CHUNK).await?;
        self.inner.flush().await?;
        self.wrote_final_chunk = true;
        Ok(())
    }

    /// End the body. Safe to call more than once.
    pub async fn finish(&mut self) -> io::Result<()> {
        if !self.wrote_final_chunk {
            self.write_final_chunk().await?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.wrote_final_chunk
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
