//! RTSP-over-HTTP tunneling (the QuickTime GET/POST scheme).
//!
//! A client opens two HTTP connections sharing an `x-sessioncookie`:
//!
//! - **GET** stays open and carries every RTSP response and RTP packet.
//! - **POST** carries base64-encoded RTSP requests for the GET leg.
//!
//! The GET leg registers its [`SessionHandle`] under the cookie; the POST
//! leg takes it out of the table and from then on forwards every decoded
//! chunk to the GET leg's queue, where it is parsed as if it had arrived on
//! the GET socket.

use std::collections::HashMap;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, RtspError};

use super::SessionHandle;

/// Cookie-keyed table of GET legs waiting for their POST.
#[derive(Default)]
pub struct TunnelTable {
    getters: Mutex<HashMap<String, SessionHandle>>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cookie: &str, getter: SessionHandle) {
        tracing::debug!(cookie, session = getter.id(), "http getter registered");
        self.getters.lock().insert(cookie.to_string(), getter);
    }

    /// Remove the getter for `cookie` if it is the one owned by `session`.
    pub fn remove(&self, cookie: &str, session: u64) {
        let mut getters = self.getters.lock();
        if getters.get(cookie).is_some_and(|g| g.id() == session) {
            getters.remove(cookie);
        }
    }

    /// Pair a POST leg with its GET leg. The entry is consumed.
    pub fn take(&self, cookie: &str) -> Result<SessionHandle> {
        self.getters
            .lock()
            .remove(cookie)
            .ok_or_else(|| RtspError::GetterNotFound(cookie.to_string()))
    }

    pub fn len(&self) -> usize {
        self.getters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Streaming base64 decoder: input may be cut anywhere, including in the
/// middle of a quantum; line breaks are ignored.
#[derive(Debug, Default)]
pub struct Base64Stream {
    carry: Vec<u8>,
}

impl Base64Stream {
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Bytes> {
        self.carry
            .extend(chunk.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let usable = self.carry.len() / 4 * 4;
        if usable == 0 {
            return Ok(Bytes::new());
        }
        let rest = self.carry.split_off(usable);
        let quanta = std::mem::replace(&mut self.carry, rest);

        // each posted message is encoded on its own, so padding ends a segment
        let mut out = Vec::with_capacity(quanta.len() / 4 * 3);
        let mut start = 0;
        for (i, quantum) in quanta.chunks(4).enumerate() {
            let end = (i + 1) * 4;
            if quantum.contains(&b'=') || end == quanta.len() {
                BASE64_STANDARD
                    .decode_vec(&quanta[start..end], &mut out)
                    .map_err(|e| RtspError::violation(format!("bad base64 in tunnel: {e}")))?;
                start = end;
            }
        }
        Ok(Bytes::from(out))
    }
}
