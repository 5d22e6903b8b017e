//! RTSP session state machine (RFC 2326 §A.1), one per TCP connection.
//!
//! A connection thread owns an [`RtspSession`] and feeds it
//! [`SessionEvent`]s from a queue: bytes read from the socket, RTP batches
//! from the ring a player is attached to, datagrams from its UDP sockets and
//! continuations posted by hooks. Everything that touches session state
//! runs on that one thread, in queue order.
//!
//! ## Lifecycle
//!
//! ```text
//! player:   OPTIONS -> DESCRIBE -> SETUP (per track) -> PLAY <-> PAUSE -> TEARDOWN
//! pusher:   OPTIONS -> ANNOUNCE -> SETUP (per track) -> RECORD          -> TEARDOWN
//! tunnel:   GET (keeps the socket, carries responses and RTP)
//!           POST (base64 requests, forwarded to the GET leg)
//! ```
//!
//! While a hook answer is pending the session stops parsing input; the
//! answer is queued as a [`SessionEvent::Task`] and parsing resumes after
//! it ran, so requests are always answered in order.

pub mod auth;
mod handler;
pub mod transport;
pub mod tunnel;

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngExt;

use crate::error::{Result, RtspError};
use crate::hooks::{Completion, FlowReport};
use crate::media::TrackType;
use crate::media::depacketize::RtspDemuxer;
use crate::media::rtcp::{Sdes, parse_compound};
use crate::media::rtcp_context::{RtcpContext, unix_now_ms};
use crate::media::rtp::{RtpPacket, interleaved_prefix};
use crate::muxer::{MultiSourceMuxer, MuxerListener};
use crate::protocol::response::{RtspResponse, http_date};
use crate::protocol::sdp::SdpTrack;
use crate::protocol::splitter::{RtspSplitter, SplitPacket};
use crate::server::ServerContext;
use crate::source::{MediaInfo, MediaSource, MediaSourceEvent, RingReader, RtpBatch};
use crate::transport::multicast::RtpMulticaster;
use crate::transport::udp::UdpPair;

pub use transport::{RtpTransport, TransportHeader};
pub use tunnel::TunnelTable;

/// How often keep-alive rules are checked.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

const SESSION_ID_LEN: usize = 12;

/// Rejected credentials tolerated before the connection is closed.
const MAX_AUTH_FAILURES: u32 = 2;

const TOKEN_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Random alphanumeric token, used for session ids and Digest nonces.
pub(crate) fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| TOKEN_CHARS[rng.random_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

type Task = Box<dyn FnOnce(&mut RtspSession) + Send>;

/// Work queued for a session's connection thread.
pub enum SessionEvent {
    /// Bytes read from the connection, or forwarded by an HTTP POST leg.
    Data(Bytes),
    /// Continuation to run against the session.
    Task(Task),
    /// Packets from the ring a player is attached to.
    Rtp(RtpBatch),
    /// Datagram received on the UDP pair of track `track`.
    Udp {
        track: usize,
        rtcp: bool,
        data: Bytes,
        from: SocketAddr,
    },
    Shutdown(String),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(d) => write!(f, "Data({} bytes)", d.len()),
            Self::Task(_) => write!(f, "Task"),
            Self::Rtp(b) => write!(f, "Rtp({} packets)", b.len()),
            Self::Udp { track, rtcp, .. } => write!(f, "Udp(track {track}, rtcp {rtcp})"),
            Self::Shutdown(reason) => write!(f, "Shutdown({reason})"),
        }
    }
}

/// Sending side of a session's queue. Cheap to clone, safe to keep after
/// the session ended: posting then just returns `false`.
#[derive(Clone)]
pub struct SessionHandle {
    tx: Sender<SessionEvent>,
    id: u64,
}

impl SessionHandle {
    /// Process-unique connection number (not the RTSP session id).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn post(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn shutdown(&self, reason: impl Into<String>) -> bool {
        self.post(SessionEvent::Shutdown(reason.into()))
    }

    /// Run `task` on the session's thread.
    pub fn run(&self, task: impl FnOnce(&mut RtspSession) + Send + 'static) -> bool {
        self.post(SessionEvent::Task(Box::new(task)))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Owner side of a stream published by a session.
///
/// Registered as the listener of both the RTSP source and the fan-out
/// engine; they only hold it weakly, the session holds the `Arc`.
struct PushListener {
    session: SessionHandle,
    muxer: Arc<MultiSourceMuxer>,
}

impl MediaSourceEvent for PushListener {
    fn close(&self, source: &MediaSource, force: bool) -> bool {
        if !force && self.total_reader_count(source) > 0 {
            tracing::debug!(source = %source.identity(), "close refused, stream still has readers");
            return false;
        }
        tracing::info!(source = %source.identity(), force, "closing publisher");
        self.session.shutdown("closed by owner");
        true
    }

    fn total_reader_count(&self, source: &MediaSource) -> usize {
        source.reader_count() + self.muxer.total_reader_count()
    }
}

impl MuxerListener for PushListener {
    fn on_all_tracks_ready(&self, tracks: &[Arc<crate::media::Track>]) {
        tracing::info!(session = self.session.id(), tracks = tracks.len(), "published tracks ready");
    }
}

struct Publisher {
    source: Arc<MediaSource>,
    demuxer: RtspDemuxer,
    muxer: Arc<MultiSourceMuxer>,
    _listener: Arc<PushListener>,
}

/// Pending HTTP tunnel POST leg: where decoded bytes go.
struct TunnelPost {
    getter: SessionHandle,
    decoder: tunnel::Base64Stream,
}

pub struct RtspSession {
    ctx: Arc<ServerContext>,
    handle: SessionHandle,
    peer: SocketAddr,
    local: SocketAddr,
    writer: Box<dyn Write + Send>,
    splitter: RtspSplitter,
    /// A hook answer is pending; input stays buffered.
    awaiting: bool,
    closed: Option<String>,

    cseq: String,
    session_id: String,
    media_info: MediaInfo,
    content_base: String,
    tracks: Vec<SdpTrack>,
    rtcp: Vec<RtcpContext>,
    rtp_type: Option<RtpTransport>,
    udp: Vec<Option<UdpPair>>,
    multicaster: Option<Arc<RtpMulticaster>>,

    realm: Option<String>,
    nonce: Option<String>,
    authorization: Option<String>,
    auth_failures: u32,

    publisher: Option<Publisher>,
    play_source: Weak<MediaSource>,
    play_reader: Option<RingReader>,

    tunnel_cookie: Option<String>,
    tunnel_post: Option<TunnelPost>,

    created: Instant,
    last_active: Instant,
    last_tick: Instant,
    bytes_usage: u64,
}

impl RtspSession {
    /// New session for a connection from `peer` accepted on `local`.
    ///
    /// Returns the queue the connection thread drains, see [`run`](Self::run).
    pub fn new(
        ctx: Arc<ServerContext>,
        peer: SocketAddr,
        local: SocketAddr,
        writer: Box<dyn Write + Send>,
    ) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        let handle = SessionHandle {
            tx,
            id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
        };
        let now = Instant::now();
        let session = Self {
            ctx,
            handle,
            peer,
            local,
            writer,
            splitter: RtspSplitter::new(),
            awaiting: false,
            closed: None,
            cseq: String::new(),
            session_id: String::new(),
            media_info: MediaInfo::default(),
            content_base: String::new(),
            tracks: Vec::new(),
            rtcp: Vec::new(),
            rtp_type: None,
            udp: Vec::new(),
            multicaster: None,
            realm: None,
            nonce: None,
            authorization: None,
            auth_failures: 0,
            publisher: None,
            play_source: Weak::new(),
            play_reader: None,
            tunnel_cookie: None,
            tunnel_post: None,
            created: now,
            last_active: now,
            last_tick: now,
            bytes_usage: 0,
        };
        (session, rx)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// RTSP session id, empty until DESCRIBE or ANNOUNCE succeeded.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn rtp_transport(&self) -> Option<RtpTransport> {
        self.rtp_type
    }

    pub fn is_publisher(&self) -> bool {
        self.publisher.is_some()
    }

    /// Why the session ended, `None` while it is alive.
    pub fn close_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    pub fn bytes_usage(&self) -> u64 {
        self.bytes_usage
    }

    /// Drain `events` until the session shuts down or `running` is cleared.
    pub fn run(mut self, events: Receiver<SessionEvent>, running: &AtomicBool) {
        while self.closed.is_none() && running.load(Ordering::SeqCst) {
            match events.recv_timeout(TICK_INTERVAL) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let now = Instant::now();
            if now.duration_since(self.last_tick) >= TICK_INTERVAL {
                self.last_tick = now;
                self.check_alive(now);
            }
        }
        if self.closed.is_none() {
            self.shutdown("server shutting down");
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        if self.closed.is_some() {
            return;
        }
        match event {
            SessionEvent::Data(data) => self.on_recv(&data),
            SessionEvent::Task(task) => task(self),
            SessionEvent::Rtp(batch) => self.send_rtp_batch(&batch),
            SessionEvent::Udp {
                track,
                rtcp,
                data,
                from,
            } => self.on_udp(track, rtcp, data, from),
            SessionEvent::Shutdown(reason) => self.shutdown(reason),
        }
    }

    /// Apply the keep-alive rules at `now`.
    pub fn check_alive(&mut self, now: Instant) {
        let keep_alive = Duration::from_secs(self.ctx.config.keep_alive_secs);
        let handshake = Duration::from_secs(self.ctx.config.handshake_secs);
        let idle = now.saturating_duration_since(self.last_active);

        // a POST leg never gets a session id; it lives as long as its getter
        if self.session_id.is_empty()
            && self.tunnel_post.is_none()
            && now.saturating_duration_since(self.created) > handshake
        {
            self.shutdown("illegal connection");
        } else if self.publisher.is_some() && idle > keep_alive {
            self.shutdown("pusher session timeout");
        } else if self.publisher.is_none()
            && self.rtp_type == Some(RtpTransport::Udp)
            && idle > keep_alive * 4
        {
            self.shutdown("rtp over udp player timeout");
        }
    }

    pub fn shutdown(&mut self, reason: impl Into<String>) {
        if self.closed.is_some() {
            return;
        }
        let reason = reason.into();
        tracing::info!(peer = %self.peer, session_id = %self.session_id, %reason, "session shutdown");
        self.closed = Some(reason);
        self.awaiting = false;
    }

    fn on_recv(&mut self, data: &[u8]) {
        self.last_active = Instant::now();
        self.bytes_usage += data.len() as u64;
        if let Some(post) = &mut self.tunnel_post {
            match post.decoder.decode(data) {
                Ok(decoded) => {
                    if !decoded.is_empty() && !post.getter.post(SessionEvent::Data(decoded)) {
                        self.shutdown("http getter released");
                    }
                }
                Err(e) => self.shutdown(e.to_string()),
            }
            return;
        }
        self.splitter.feed(data);
        self.process_input();
    }

    /// Parse and handle buffered input until it runs out or a hook answer
    /// is awaited.
    fn process_input(&mut self) {
        while !self.awaiting && self.closed.is_none() && self.tunnel_post.is_none() {
            match self.splitter.next_packet() {
                Ok(Some(SplitPacket::Request(request))) => self.on_request(&request),
                Ok(Some(SplitPacket::Interleaved { channel, data })) => {
                    self.on_interleaved(channel, data)
                }
                Ok(None) => break,
                Err(e) => {
                    self.on_request_error(e);
                    break;
                }
            }
        }
    }

    /// Completion that resumes this session with the hook's answer.
    ///
    /// Input parsing is suspended until `then` ran on the session thread.
    fn resume<T, F>(&mut self, fallback: T, then: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RtspSession, T) -> Result<()> + Send + 'static,
    {
        self.awaiting = true;
        let handle = self.handle.clone();
        Completion::new(fallback, move |value| {
            handle.run(move |session| {
                session.awaiting = false;
                if let Err(e) = then(session, value) {
                    session.on_request_error(e);
                }
                session.process_input();
            });
        })
    }

    fn on_request_error(&mut self, err: RtspError) {
        tracing::warn!(peer = %self.peer, cseq = %self.cseq, error = %err, "request failed");
        let Some((code, text)) = err.status() else {
            self.shutdown(err.to_string());
            return;
        };
        let mut response = RtspResponse::new(code, text);
        match &err {
            RtspError::AlreadyPublishing(_) => response = response.with_text("Already publishing."),
            RtspError::NoAvailableTrack => response = response.with_text("No available track in sdp."),
            _ => {}
        }
        if err.is_fatal() {
            response = response.add_header("Connection", "Close");
        }
        self.send_response(response);
        if err.is_fatal() {
            self.shutdown(err.to_string());
        }
    }

    /// Answer with `text` as body and close the connection.
    fn reject(&mut self, code: u16, status: &str, text: &str) {
        tracing::warn!(peer = %self.peer, code, reason = text, "request rejected");
        self.send_response(
            RtspResponse::new(code, status)
                .add_header("Connection", "Close")
                .with_text(text),
        );
        self.shutdown(text.to_string());
    }

    fn send_response(&mut self, mut response: RtspResponse) {
        if !self.cseq.is_empty() {
            response.headers.insert(0, ("CSeq".to_string(), self.cseq.clone()));
        }
        if !self.session_id.is_empty() && !response.has_header("Session") {
            let value = format!("{};timeout={}", self.session_id, self.ctx.config.keep_alive_secs);
            response = response.add_header("Session", &value);
        }
        let server = self.ctx.config.server_name.clone();
        response = response.add_header("Server", &server).add_header("Date", &http_date());
        tracing::debug!(peer = %self.peer, status = response.status_code, "response");
        let text = response.serialize();
        self.send_bytes(text.as_bytes());
    }

    fn send_bytes(&mut self, data: &[u8]) {
        if self.closed.is_some() {
            return;
        }
        self.bytes_usage += data.len() as u64;
        if let Err(e) = self.writer.write_all(data) {
            self.shutdown(format!("write error: {e}"));
        }
    }

    fn track_by_interleaved(&self, channel: u8) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.interleaved == channel)
            .or_else(|| (self.tracks.len() == 1).then_some(0))
    }

    fn track_by_type(&self, track_type: TrackType) -> Option<usize> {
        self.tracks.iter().position(|t| t.track_type == track_type)
    }

    fn on_interleaved(&mut self, channel: u8, data: Bytes) {
        if channel % 2 == 0 {
            match self.track_by_interleaved(channel) {
                Some(idx) if self.publisher.is_some() => self.on_rtp_in(idx, data),
                _ => tracing::trace!(channel, "interleaved rtp ignored"),
            }
        } else if let Some(idx) = self.track_by_interleaved(channel - 1) {
            self.on_rtcp_in(idx, &data);
        }
    }

    fn on_udp(&mut self, track: usize, rtcp: bool, data: Bytes, from: SocketAddr) {
        let peer_ip = self.peer.ip();
        let Some(pair) = self.udp.get_mut(track).and_then(Option::as_mut) else {
            return;
        };
        if !pair.accept_from(rtcp, from, peer_ip) {
            return;
        }
        self.last_active = Instant::now();
        self.bytes_usage += data.len() as u64;
        if rtcp {
            self.on_rtcp_in(track, &data);
        } else if self.publisher.is_some() {
            self.on_rtp_in(track, data);
        }
    }

    /// RTP from a pusher: statistics, relay to players, demux for the
    /// fan-out engine.
    fn on_rtp_in(&mut self, idx: usize, data: Bytes) {
        let (track_type, sample_rate) = (self.tracks[idx].track_type, self.tracks[idx].sample_rate);
        let Some(mut packet) = RtpPacket::parse(data, track_type, sample_rate) else {
            tracing::trace!(track = idx, "invalid rtp packet dropped");
            return;
        };
        let now = unix_now_ms();
        let rtcp = &mut self.rtcp[idx];
        if let Some(ntp) = rtcp.ntp_stamp_for(packet.timestamp()) {
            packet.ntp_stamp = ntp;
        }
        rtcp.on_rtp(&packet, now);
        if rtcp.report_due(now, false) {
            let ssrc = packet.ssrc();
            let mut report = BytesMut::new();
            report.put_slice(&rtcp.create_rr(ssrc.wrapping_add(1), ssrc, now).encode());
            report.put_slice(&Sdes::cname(ssrc.wrapping_add(1), &self.ctx.config.server_name).encode());
            self.send_rtcp(idx, &report);
        }

        let Some(publisher) = &mut self.publisher else {
            return;
        };
        let key = match track_type {
            TrackType::Video => packet.is_h264_key(),
            TrackType::Audio => !publisher.source.has_track(TrackType::Video),
            TrackType::Unknown => false,
        };
        let frames = publisher.demuxer.input_rtp(&packet);
        publisher.source.write_rtp(packet, key);
        for frame in &frames {
            publisher.muxer.input_frame(frame);
        }
    }

    fn on_rtcp_in(&mut self, idx: usize, data: &[u8]) {
        let now = unix_now_ms();
        for packet in parse_compound(data) {
            tracing::trace!(track = idx, ?packet, "rtcp received");
            if let Some(ctx) = self.rtcp.get_mut(idx) {
                ctx.on_rtcp(&packet, now);
            }
        }
    }

    /// RTP for a player, with a Sender Report whenever one is due.
    fn send_rtp_batch(&mut self, batch: &RtpBatch) {
        let now = unix_now_ms();
        let mut out = BytesMut::new();
        for packet in batch.iter() {
            let Some(idx) = self.track_by_type(packet.track_type) else {
                continue;
            };
            let rtcp = &mut self.rtcp[idx];
            rtcp.on_rtp(packet, now);
            if rtcp.report_due(now, true) {
                let mut report = BytesMut::new();
                report.put_slice(&rtcp.create_sr(packet.ssrc(), now).encode());
                report.put_slice(&Sdes::cname(packet.ssrc(), &self.ctx.config.server_name).encode());
                match self.rtp_type {
                    Some(RtpTransport::Tcp) => {
                        let channel = self.tracks[idx].interleaved + 1;
                        out.put_slice(&interleaved_prefix(report.len(), channel));
                        out.put_slice(&report);
                    }
                    _ => self.send_rtcp(idx, &report),
                }
            }
            match self.rtp_type {
                Some(RtpTransport::Tcp) => {
                    out.put_slice(&interleaved_prefix(packet.len(), self.tracks[idx].interleaved));
                    out.put_slice(packet.as_bytes());
                }
                Some(RtpTransport::Udp) => {
                    if let Some(Some(pair)) = self.udp.get(idx) {
                        match pair.send_rtp(packet.as_bytes()) {
                            Ok(n) => self.bytes_usage += n as u64,
                            Err(e) => tracing::trace!(error = %e, "udp rtp send failed"),
                        }
                    }
                }
                _ => {}
            }
        }
        if !out.is_empty() {
            self.send_bytes(&out);
        }
    }

    fn send_rtcp(&mut self, idx: usize, data: &[u8]) {
        match self.rtp_type {
            Some(RtpTransport::Tcp) => {
                let mut out = BytesMut::with_capacity(data.len() + 4);
                out.put_slice(&interleaved_prefix(data.len(), self.tracks[idx].interleaved + 1));
                out.put_slice(data);
                self.send_bytes(&out);
            }
            Some(RtpTransport::Udp) => {
                if let Some(Some(pair)) = self.udp.get(idx)
                    && let Err(e) = pair.send_rtcp(data)
                {
                    tracing::trace!(error = %e, "udp rtcp send failed");
                }
            }
            _ => {}
        }
    }
}

impl Drop for RtspSession {
    fn drop(&mut self) {
        if let Some(cookie) = &self.tunnel_cookie {
            self.ctx.tunnels.remove(cookie, self.handle.id());
        }
        if let Some(caster) = &self.multicaster {
            caster.remove_detach(self.handle.id());
        }
        self.play_reader.take();

        let duration = self.created.elapsed();
        tracing::info!(
            peer = %self.peer,
            session_id = %self.session_id,
            reason = self.closed.as_deref().unwrap_or("dropped"),
            bytes = self.bytes_usage,
            secs = duration.as_secs(),
            "session closed"
        );
        let threshold = self.ctx.config.flow_threshold_kb * 1024;
        if self.bytes_usage >= threshold
            && let Some(hook) = &self.ctx.hooks.on_flow_report
        {
            hook(&FlowReport {
                info: self.media_info.clone(),
                total_bytes: self.bytes_usage,
                duration,
                is_player: self.publisher.is_none(),
                peer: self.peer.to_string(),
            });
        }
    }
}
