//! RTSP relay core: publish/play sessions and multi-output media fan-out.
//!
//! ```text
//!  pusher ──ANNOUNCE/RECORD──▶ RtspSession ──▶ MediaSource ──ring──▶ RtspSession ──▶ player
//!                                  │                                   (TCP/UDP/multicast)
//!                                  ▼
//!                          MultiSourceMuxer ──▶ RTSP / RTMP / TS / FMP4 / HLS / MP4 / RTP senders
//! ```
//!
//! Start a [`Server`] to accept RTSP connections. Streams published over
//! RTSP are relayed to players as-is and also demuxed into frames for the
//! fan-out engine; streams produced elsewhere enter through
//! [`Server::create_muxer`] and become playable over RTSP.

pub mod error;
pub mod hooks;
pub mod media;
pub mod muxer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod source;
pub mod transport;

pub use error::{Result, RtspError};
pub use hooks::{Completion, Hooks, Password, PublishGrant};
pub use media::{Frame, Packetizer, Track};
pub use muxer::{MultiSourceMuxer, MuxerOptions};
pub use server::{Server, ServerConfig, ServerContext};
pub use source::{MediaRegistry, MediaSource, StreamIdentity};
