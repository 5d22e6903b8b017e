//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): one connection per client, a thread per
//!   connection. Carries RTSP signaling and, when negotiated, RTP/RTCP
//!   interleaved with `$` framing (RFC 2326 §10.12).
//! - **UDP** ([`udp`]): a server RTP/RTCP socket pair per negotiated
//!   track, allocated from a configured port range.
//! - **Multicast** ([`multicast`]): one shared sender per stream, joined by
//!   every player that asked for it.

pub mod multicast;
pub mod tcp;
pub mod udp;

pub use multicast::{MulticastManager, RtpMulticaster};
pub use udp::{UdpPair, UdpPortAllocator};
