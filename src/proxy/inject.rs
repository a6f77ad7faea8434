//! Element-hiding style injection for HTML responses
//!
//! The response body is decoded if needed and a `<style>` block hiding the
//! given selectors is inserted right before the first `<html` tag.

use std::io::{self, Write};

use flate2::write::{GzDecoder, ZlibDecoder};

use crate::codec::ByteMatcher;

const HTML_TAG: &[u8] = b"<html";

/// Incremental decoder for a response `Content-Encoding`
pub enum ContentDecoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Zlib(ZlibDecoder<Vec<u8>>),
}

impl ContentDecoder {
    /// Decoder for `encoding`, or `None` if the encoding is not supported
    pub fn for_encoding(encoding: Option<&str>) -> Option<Self> {
        let Some(encoding) = encoding.map(|e| e.trim().to_ascii_lowercase()) else {
            return Some(ContentDecoder::Identity);
        };

        match encoding.as_str() {
            "" | "identity" => Some(ContentDecoder::Identity),
            "gzip" | "x-gzip" => Some(ContentDecoder::Gzip(GzDecoder::new(Vec::new()))),
            "deflate" | "compress" | "x-compress" => {
                Some(ContentDecoder::Zlib(ZlibDecoder::new(Vec::new())))
            }
            _ => None,
        }
    }

    /// Feed encoded bytes, returning whatever decoded output is available
    pub fn decode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            ContentDecoder::Identity => Ok(data.to_vec()),
            ContentDecoder::Gzip(d) => {
                d.write_all(data)?;
                Ok(std::mem::take(d.get_mut()))
            }
            ContentDecoder::Zlib(d) => {
                d.write_all(data)?;
                Ok(std::mem::take(d.get_mut()))
            }
        }
    }

    /// Flush the decoder at end of body
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            ContentDecoder::Identity => Ok(Vec::new()),
            ContentDecoder::Gzip(d) => d.finish(),
            ContentDecoder::Zlib(d) => d.finish(),
        }
    }
}

/// The style block inserted into pages
pub fn style_block(selectors: &[String]) -> String {
    format!(
        "<style type=\"text/css\">\n{}{{ display: none !important }}</style>\n",
        selectors.join(",\r\n")
    )
}

/// Streams a decoded HTML body, inserting the style block once.
///
/// A few trailing bytes of every block are held back so a tag split across
/// two blocks is still found.
pub struct ElementHider {
    style: Vec<u8>,
    matcher: ByteMatcher,
    carry: Vec<u8>,
    inserted: bool,
}

impl ElementHider {
    pub fn new(selectors: &[String]) -> Self {
        Self {
            style: style_block(selectors).into_bytes(),
            matcher: ByteMatcher::new(HTML_TAG),
            carry: Vec::new(),
            inserted: false,
        }
    }

    pub fn inserted(&self) -> bool {
        self.inserted
    }

    /// Process the next piece of body, returning the bytes to send
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        if self.inserted {
            return data.to_vec();
        }

        let mut block = std::mem::take(&mut self.carry);
        block.extend_from_slice(data);

        if let Some(m) = self.matcher.find_first(&block) {
            let mut out = Vec::with_capacity(block.len() + self.style.len());
            out.extend_from_slice(&block[..m]);
            out.extend_from_slice(&self.style);
            out.extend_from_slice(&block[m..]);
            self.inserted = true;
            return out;
        }

        let keep = (HTML_TAG.len() - 1).min(block.len());
        self.carry = block.split_off(block.len() - keep);
        block
    }

    /// Bytes still held back at end of body
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.carry)
    }
}
