//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: framing the
//! byte stream, parsing requests, building responses and SDP. Method
//! semantics live in [`crate::session`].
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/app/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Requests and `$`-framed RTP share one TCP stream (RFC 2326 §10.12).
//! - Session header carries a server-assigned ID (RFC 2326 §12.37).
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | ANNOUNCE | §10.3 | Publish a stream with its SDP |
//! | SETUP | §10.4 | Negotiate transport (TCP, UDP, multicast) |
//! | PLAY | §10.5 | Start media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive / parameter query |
//! | SET_PARAMETER | §10.9 | Keepalive |
//! | RECORD | §10.11 | Start receiving published media |

pub mod request;
pub mod response;
pub mod sdp;
pub mod splitter;

pub use request::RtspRequest;
pub use response::RtspResponse;
pub use splitter::{RtspSplitter, SplitPacket};
