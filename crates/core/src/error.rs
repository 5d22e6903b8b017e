//! Error types for the RTSP relay library.

use std::fmt;

/// Errors that can occur in the RTSP relay library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse),
///   [`ProtocolViolation`](Self::ProtocolViolation): malformed or
///   unsupported requests, double SETUP.
/// - **Auth**: [`AuthRequired`](Self::AuthRequired),
///   [`AuthFailed`](Self::AuthFailed).
/// - **Stream**: [`StreamNotFound`](Self::StreamNotFound),
///   [`AlreadyPublishing`](Self::AlreadyPublishing),
///   [`NoAvailableTrack`](Self::NoAvailableTrack).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`TrackNotSetup`](Self::TrackNotSetup).
/// - **Transport**: [`Io`](Self::Io),
///   [`TransportAllocationFailed`](Self::TransportAllocationFailed),
///   [`UnsupportedTransport`](Self::UnsupportedTransport),
///   [`PortRangeExhausted`](Self::PortRangeExhausted),
///   [`GetterNotFound`](Self::GetterNotFound).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Unsupported method, malformed URL, double SETUP and similar.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The stream needs credentials and the client sent none.
    #[error("authentication required")]
    AuthRequired,

    /// Credentials were sent but rejected, or an authorization hook refused.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No live source for the requested identity.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// ANNOUNCE for an identity that already has a live source.
    #[error("already publishing: {0}")]
    AlreadyPublishing(String),

    /// The announced SDP carried no usable track.
    #[error("no available track in sdp")]
    NoAvailableTrack,

    /// Missing or mismatched `Session` header.
    #[error("session not found")]
    SessionNotFound,

    /// PLAY/RECORD before every track completed SETUP.
    #[error("track not setup: {0}")]
    TrackNotSetup(String),

    /// No free UDP pair, multicast join failure.
    #[error("transport allocation failed: {0}")]
    TransportAllocationFailed(String),

    /// The `Transport` header could not be honored.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// HTTP-tunnel POST carried a cookie no GET leg registered.
    #[error("http getter not found for x-sessioncookie: {0}")]
    GetterNotFound(String),

    /// Server-side UDP port allocation exhausted the configured range.
    #[error("port range exhausted")]
    PortRangeExhausted,

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl RtspError {
    /// RTSP status line this error is answered with, if any.
    ///
    /// Errors without a status close the connection without a response.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::Parse { .. } | Self::ProtocolViolation(_) | Self::NoAvailableTrack => {
                Some((403, "Forbidden"))
            }
            Self::AuthRequired | Self::AuthFailed(_) => Some((401, "Unauthorized")),
            Self::StreamNotFound(_) => Some((404, "Stream Not Found")),
            Self::AlreadyPublishing(_) | Self::TransportAllocationFailed(_) => {
                Some((406, "Not Acceptable"))
            }
            Self::PortRangeExhausted => Some((406, "Not Acceptable")),
            Self::SessionNotFound => Some((454, "Session Not Found")),
            Self::TrackNotSetup(_) => Some((455, "Method Not Valid in This State")),
            Self::UnsupportedTransport(_) => Some((461, "Unsupported Transport")),
            Self::Io(_) | Self::GetterNotFound(_) | Self::NotStarted | Self::AlreadyRunning => None,
        }
    }

    /// Whether the connection is closed after this error is answered.
    ///
    /// Auth errors re-prompt; the session decides when the client gave up.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AuthRequired | Self::AuthFailed(_))
    }

    /// Shorthand for [`ProtocolViolation`](Self::ProtocolViolation).
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
    /// Header block grew past the splitter's limit without a blank line.
    HeaderTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content-length"),
            Self::HeaderTooLarge => write!(f, "header too large"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
