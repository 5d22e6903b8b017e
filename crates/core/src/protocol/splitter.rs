//! Incremental splitter for an RTSP/TCP byte stream.
//!
//! The stream interleaves text requests with `$`-framed binary packets
//! (RFC 2326 §10.12):
//!
//! ```text
//! +-----+---------+----------------+------------------+
//! | '$' | channel | length (16 BE) | RTP/RTCP payload |
//! +-----+---------+----------------+------------------+
//! ```
//!
//! Bytes are appended with [`feed`](RtspSplitter::feed) as they arrive and
//! complete units are pulled with [`next_packet`](RtspSplitter::next_packet).

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::media::rtp::RTP_TCP_PREFIX_SIZE;

use super::request::RtspRequest;

/// Largest header block accepted without a terminating blank line.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum SplitPacket {
    Request(RtspRequest),
    /// Interleaved packet with the `$` prefix stripped.
    Interleaved { channel: u8, data: Bytes },
}

#[derive(Debug, Default)]
pub struct RtspSplitter {
    buf: BytesMut,
}

impl RtspSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Everything not yet consumed, leaving the splitter empty.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Pull the next complete unit, `Ok(None)` when more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<SplitPacket>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf[0] == b'$' {
            if self.buf.len() < RTP_TCP_PREFIX_SIZE {
                return Ok(None);
            }
            let channel = self.buf[1];
            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < RTP_TCP_PREFIX_SIZE + len {
                return Ok(None);
            }
            self.buf.advance(RTP_TCP_PREFIX_SIZE);
            let data = self.buf.split_to(len).freeze();
            return Ok(Some(SplitPacket::Interleaved { channel, data }));
        }

        let Some(head_end) = find_blank_line(&self.buf) else {
            if self.buf.len() > MAX_HEADER_SIZE {
                return Err(RtspError::Parse {
                    kind: ParseErrorKind::HeaderTooLarge,
                });
            }
            return Ok(None);
        };

        let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();
        let mut request = RtspRequest::parse(&head)?;

        // A tunnel POST body is open-ended: all bytes seen so far belong to it.
        let body_len = if request.method == "POST" && request.is_http() {
            self.buf.len() - head_end - 4
        } else {
            request.content_length()?
        };
        if self.buf.len() < head_end + 4 + body_len {
            return Ok(None);
        }

        self.buf.advance(head_end + 4);
        let body = self.buf.split_to(body_len);
        request.body = String::from_utf8_lossy(&body).into_owned();
        tracing::debug!(method = %request.method, uri = %request.uri, body_len, "request framed");
        Ok(Some(SplitPacket::Request(request)))
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
