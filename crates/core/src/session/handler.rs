use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::hooks::{Password, PublishGrant};
use crate::media::depacketize::RtspDemuxer;
use crate::media::rtcp_context::RtcpContext;
use crate::muxer::{MultiSourceMuxer, MuxerListener, MuxerOptions};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{SdpTrack, parse_sdp};
use crate::source::identity::RTSP_SCHEMA;
use crate::source::{MediaInfo, MediaSource, MediaSourceEvent};
use crate::transport::udp::UdpPair;

use super::auth::{self, Authorization};
use super::transport::{TransportHeader, multicast_reply, tcp_reply, udp_reply};
use super::tunnel::Base64Stream;
use super::{
    MAX_AUTH_FAILURES, PushListener, Publisher, RtpTransport, RtspSession, SESSION_ID_LEN,
    SessionEvent, TunnelPost, random_token,
};

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, ANNOUNCE, RECORD, SET_PARAMETER, GET_PARAMETER";

/// Only DESCRIBE is challenged, so Digest responses are computed over it.
const AUTH_METHOD: &str = "DESCRIBE";

impl RtspSession {
    pub(super) fn on_request(&mut self, request: &RtspRequest) {
        tracing::debug!(
            peer = %self.peer,
            method = %request.method,
            uri = %request.uri,
            version = %request.version,
            "request"
        );
        self.cseq = request.cseq().unwrap_or_default().to_string();
        if self.content_base.is_empty() && request.method != "GET" {
            self.content_base = request.url().to_string();
            self.media_info = MediaInfo::parse(request.full_url(), self.ctx.config.enable_vhost);
            self.media_info.schema = RTSP_SCHEMA.to_string();
        }
        if let Err(e) = self.dispatch(request) {
            self.on_request_error(e);
        }
    }

    fn dispatch(&mut self, request: &RtspRequest) -> Result<()> {
        match request.method.as_str() {
            "OPTIONS" => self.handle_options(),
            "DESCRIBE" => self.handle_describe(request),
            "ANNOUNCE" => self.handle_announce(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "PAUSE" => self.handle_pause(request),
            "RECORD" => self.handle_record(request),
            "TEARDOWN" => self.handle_teardown(),
            "GET" => self.handle_get(request),
            "POST" => self.handle_post(request),
            "SET_PARAMETER" | "GET_PARAMETER" => {
                self.send_response(RtspResponse::ok());
                Ok(())
            }
            other => Err(RtspError::violation(format!("unsupported method: {other}"))),
        }
    }

    fn handle_options(&mut self) -> Result<()> {
        self.send_response(RtspResponse::ok().add_header("Public", PUBLIC_METHODS));
        Ok(())
    }

    fn check_session(&self, request: &RtspRequest) -> Result<()> {
        if self.session_id.is_empty() || request.session() != Some(self.session_id.as_str()) {
            return Err(RtspError::SessionNotFound);
        }
        Ok(())
    }

    fn stream_name(&self) -> String {
        self.media_info.identity(RTSP_SCHEMA).to_string()
    }

    // ANNOUNCE / RECORD

    fn handle_announce(&mut self, request: &RtspRequest) -> Result<()> {
        self.media_info.strip_sdp_suffix();
        if let Some(stripped) = self.content_base.strip_suffix(".sdp") {
            self.content_base = stripped.to_string();
        }
        if !self.media_info.is_addressable() {
            return Err(RtspError::violation(format!(
                "illegal stream id: {}",
                self.media_info.full_url
            )));
        }
        let identity = self.media_info.identity(RTSP_SCHEMA);
        if self.ctx.registry.find(&identity).is_some() {
            return Err(RtspError::AlreadyPublishing(identity.to_string()));
        }
        let tracks = parse_sdp(&request.body);
        if tracks.is_empty() {
            return Err(RtspError::NoAvailableTrack);
        }

        let sdp = request.body.clone();
        let Some(hook) = self.ctx.hooks.on_publish.clone() else {
            let grant = PublishGrant {
                enable_hls: self.ctx.config.publish_to_hls,
                enable_mp4: self.ctx.config.publish_to_mp4,
            };
            return self.on_publish_allowed(sdp, tracks, grant);
        };
        let done = self.resume(
            Err("publish hook gave no answer".to_string()),
            move |session, answer: std::result::Result<PublishGrant, String>| match answer {
                Ok(grant) => session.on_publish_allowed(sdp, tracks, grant),
                Err(reason) => {
                    session.reject(401, "Unauthorized", &reason);
                    Ok(())
                }
            },
        );
        hook(&self.media_info, done);
        Ok(())
    }

    fn on_publish_allowed(
        &mut self,
        sdp: String,
        tracks: Vec<SdpTrack>,
        grant: PublishGrant,
    ) -> Result<()> {
        let identity = self.media_info.identity(RTSP_SCHEMA);
        let source = MediaSource::new(identity.clone(), sdp);
        self.ctx.registry.register(&source)?;

        let cfg = &self.ctx.config;
        let options = MuxerOptions {
            enable_rtsp: false,
            enable_hls: grant.enable_hls,
            enable_mp4: grant.enable_mp4,
            modify_stamp: cfg.modify_stamp,
            max_wait_track_ready: Duration::from_millis(cfg.max_wait_track_ready_ms),
            stream_none_reader_delay: Duration::from_millis(cfg.stream_none_reader_delay_ms),
            sdp_origin: cfg.sdp_origin(),
            ..MuxerOptions::default()
        };
        let muxer = MultiSourceMuxer::new(
            identity.with_schema(""),
            options,
            &self.ctx.registry,
            self.ctx.sink_factory.clone(),
        );
        let demuxer = RtspDemuxer::from_sdp(&tracks);
        for track in demuxer.tracks() {
            muxer.add_track(track);
        }
        muxer.add_track_completed();

        let listener = Arc::new(PushListener {
            session: self.handle.clone(),
            muxer: muxer.clone(),
        });
        let as_source: std::sync::Weak<dyn MediaSourceEvent> = Arc::downgrade(&listener) as _;
        let as_muxer: std::sync::Weak<dyn MuxerListener> = Arc::downgrade(&listener) as _;
        source.set_listener(as_source);
        muxer.set_listener(as_muxer);

        tracing::info!(peer = %self.peer, source = %identity, tracks = tracks.len(), ?grant, "publish accepted");
        self.rtcp = tracks.iter().map(|_| RtcpContext::for_receive()).collect();
        self.tracks = tracks;
        self.session_id = random_token(SESSION_ID_LEN);
        self.publisher = Some(Publisher {
            source,
            demuxer,
            muxer,
            _listener: listener,
        });
        self.send_response(RtspResponse::ok());
        Ok(())
    }

    fn handle_record(&mut self, request: &RtspRequest) -> Result<()> {
        if self.tracks.is_empty() {
            return Err(RtspError::SessionNotFound);
        }
        self.check_session(request)?;
        if self.publisher.is_none() {
            return Err(RtspError::violation("RECORD without ANNOUNCE"));
        }
        if let Some(track) = self.tracks.iter().find(|t| !t.inited) {
            return Err(RtspError::TrackNotSetup(track.control.clone()));
        }
        let rtp_info = self
            .tracks
            .iter()
            .map(|t| format!("url={}", t.control_url(&self.content_base)))
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(peer = %self.peer, source = %self.stream_name(), "record started");
        self.send_response(RtspResponse::ok().add_header("RTP-Info", &rtp_info));
        Ok(())
    }

    // DESCRIBE and authentication

    fn handle_describe(&mut self, request: &RtspRequest) -> Result<()> {
        if !self.media_info.is_addressable() {
            return Err(RtspError::violation(format!(
                "illegal stream id: {}",
                self.media_info.full_url
            )));
        }
        self.authorization = request.get_header("Authorization").map(str::to_string);
        if let Some(realm) = self.realm.clone() {
            return self.on_realm(realm);
        }
        let Some(hook) = self.ctx.hooks.on_get_realm.clone() else {
            return self.on_realm(String::new());
        };
        let done = self.resume(String::new(), |session, realm: String| session.on_realm(realm));
        hook(&self.media_info, done);
        Ok(())
    }

    /// An empty realm means the stream is open; only the play hook decides.
    fn on_realm(&mut self, realm: String) -> Result<()> {
        if realm.is_empty() {
            return self.emit_on_play();
        }
        self.realm = Some(realm.clone());
        self.auth_user(&realm)
    }

    fn emit_on_play(&mut self) -> Result<()> {
        let Some(hook) = self.ctx.hooks.on_play.clone() else {
            return self.on_auth_success();
        };
        let done = self.resume(
            Err("play hook gave no answer".to_string()),
            |session, answer: std::result::Result<(), String>| match answer {
                Ok(()) => session.on_auth_success(),
                Err(reason) => {
                    session.reject(401, "Unauthorized", &reason);
                    Ok(())
                }
            },
        );
        hook(&self.media_info, done);
        Ok(())
    }

    fn auth_user(&mut self, realm: &str) -> Result<()> {
        let Some(header) = self.authorization.clone() else {
            tracing::debug!(peer = %self.peer, realm, "credentials required");
            self.send_challenge(realm, false);
            return Ok(());
        };
        let credentials = match Authorization::parse(&header) {
            Ok(c) => c,
            Err(e) => return self.on_auth_failed(realm, e),
        };
        let Some(hook) = self.ctx.hooks.on_rtsp_auth.clone() else {
            tracing::warn!(realm, "realm is set but no password hook is registered, access granted");
            return self.on_auth_success();
        };

        let owned_realm = realm.to_string();
        match credentials {
            Authorization::Basic { user, password } => {
                let lookup_user = user.clone();
                let done = self.resume(None, move |session, found: Option<Password>| match found {
                    Some(p) if auth::verify_basic(&user, &owned_realm, &password, &p) => {
                        session.on_auth_success()
                    }
                    _ => session.on_auth_failed(
                        &owned_realm,
                        RtspError::AuthFailed(format!("wrong password for user {user}")),
                    ),
                });
                hook(&self.media_info, realm, &lookup_user, true, done);
            }
            Authorization::Digest(digest) => {
                let nonce = self.nonce.clone().unwrap_or_default();
                if let Err(e) = digest.precheck(realm, &nonce) {
                    return self.on_auth_failed(realm, e);
                }
                let lookup_user = digest.username.clone();
                let done = self.resume(None, move |session, found: Option<Password>| match found {
                    Some(p) if digest.verify(AUTH_METHOD, &p) => session.on_auth_success(),
                    _ => session.on_auth_failed(
                        &owned_realm,
                        RtspError::AuthFailed(format!(
                            "digest mismatch for user {}",
                            digest.username
                        )),
                    ),
                });
                hook(&self.media_info, realm, &lookup_user, false, done);
            }
        }
        Ok(())
    }

    /// 401 with a fresh challenge; Digest unless Basic is configured.
    fn send_challenge(&mut self, realm: &str, close: bool) {
        let value = if self.ctx.config.auth_basic {
            auth::challenge(realm, None)
        } else {
            let nonce = auth::new_nonce();
            let value = auth::challenge(realm, Some(&nonce));
            self.nonce = Some(nonce);
            value
        };
        let mut response = RtspResponse::new(401, "Unauthorized").add_header("WWW-Authenticate", &value);
        if close {
            response = response.add_header("Connection", "Close");
        }
        self.send_response(response);
    }

    fn on_auth_failed(&mut self, realm: &str, err: RtspError) -> Result<()> {
        self.auth_failures += 1;
        tracing::warn!(peer = %self.peer, error = %err, attempts = self.auth_failures, "authentication failed");
        let give_up = self.auth_failures >= MAX_AUTH_FAILURES;
        self.send_challenge(realm, give_up);
        if give_up {
            self.shutdown(err.to_string());
        }
        Ok(())
    }

    fn on_auth_success(&mut self) -> Result<()> {
        let identity = self.media_info.identity(RTSP_SCHEMA);
        let registry = self.ctx.registry.clone();
        if registry.find(&identity).is_none()
            && let Some(hook) = &self.ctx.hooks.on_stream_not_found
        {
            hook(&self.media_info);
        }
        let timeout = Duration::from_millis(self.ctx.config.find_async_timeout_ms);
        let done = self.resume(None, |session, found: Option<Arc<MediaSource>>| {
            session.on_source_found(found)
        });
        registry.find_async(&identity, timeout, done);
        Ok(())
    }

    fn on_source_found(&mut self, found: Option<Arc<MediaSource>>) -> Result<()> {
        let Some(source) = found else {
            return Err(RtspError::StreamNotFound(self.stream_name()));
        };
        let mut tracks = parse_sdp(source.sdp());
        if tracks.is_empty() {
            return Err(RtspError::StreamNotFound(self.stream_name()));
        }
        let live = source.tracks();
        for track in &mut tracks {
            if let Some(l) = live.iter().find(|l| l.track_type == track.track_type) {
                track.ssrc = l.ssrc;
                track.seq = l.seq;
                track.timestamp = l.timestamp;
            }
        }
        self.rtcp = tracks.iter().map(|_| RtcpContext::for_send()).collect();
        self.tracks = tracks;
        self.session_id = random_token(SESSION_ID_LEN);
        self.play_source = Arc::downgrade(&source);

        let content_base = format!("{}/", self.content_base);
        self.send_response(
            RtspResponse::ok()
                .add_header("Content-Base", &content_base)
                .add_header("x-Accept-Retransmit", "our-retransmit")
                .add_header("x-Accept-Dynamic-Rate", "1")
                .add_header("Content-Type", "application/sdp")
                .with_body(source.sdp().to_string()),
        );
        Ok(())
    }

    // SETUP

    fn track_for_url(&self, url: &str) -> Result<usize> {
        let url = url.trim_end_matches('/');
        self.tracks
            .iter()
            .position(|t| t.control_url(&self.content_base) == url)
            .or_else(|| (self.tracks.len() == 1).then_some(0))
            .ok_or_else(|| RtspError::violation(format!("can not find track for {url}")))
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> Result<()> {
        let idx = self.track_for_url(request.url())?;
        if self.tracks[idx].inited {
            return Err(RtspError::violation("can not setup one track twice"));
        }
        let transport = TransportHeader::parse(request.header_or_empty("Transport"));
        let kind = self.rtp_type.unwrap_or(transport.kind);
        let ssrc = self.tracks[idx].ssrc;

        let response = match kind {
            RtpTransport::Tcp => {
                let interleaved = if self.publisher.is_some() {
                    transport
                        .interleaved
                        .ok_or_else(|| RtspError::violation("interleaved missing in SETUP"))?
                        .0
                } else {
                    (idx * 2) as u8
                };
                self.tracks[idx].interleaved = interleaved;
                RtspResponse::ok()
                    .add_header("Transport", &tcp_reply(interleaved, ssrc))
                    .add_header("x-Transport-Options", "late-tolerance=1.400000")
                    .add_header("x-Dynamic-Rate", "1")
            }
            RtpTransport::Udp => {
                let client_port = transport.client_port.ok_or_else(|| {
                    RtspError::UnsupportedTransport("client_port missing".to_string())
                })?;
                let (rtp, rtcp) = self.ctx.udp.bind_pair(self.local.ip())?;
                let pair = UdpPair::new(rtp, rtcp, self.peer.ip(), client_port);
                let handle = self.handle.clone();
                pair.listen(&format!("rtsp-udp-{}", handle.id()), move |rtcp, data, from| {
                    handle.post(SessionEvent::Udp {
                        track: idx,
                        rtcp,
                        data,
                        from,
                    })
                })?;
                let server_port = pair.local_ports();
                if self.udp.len() < self.tracks.len() {
                    self.udp.resize_with(self.tracks.len(), || None);
                }
                self.udp[idx] = Some(pair);
                RtspResponse::ok().add_header("Transport", &udp_reply(client_port, server_port, ssrc))
            }
            RtpTransport::Multicast => {
                if self.publisher.is_some() {
                    return Err(RtspError::UnsupportedTransport(
                        "multicast publishing".to_string(),
                    ));
                }
                let caster = match &self.multicaster {
                    Some(caster) => caster.clone(),
                    None => {
                        let source = self
                            .play_source
                            .upgrade()
                            .ok_or_else(|| RtspError::StreamNotFound(self.stream_name()))?;
                        let caster = self.ctx.multicast.get(self.local.ip(), &source)?;
                        let handle = self.handle.clone();
                        caster.set_detach(handle.id(), move || {
                            handle.shutdown("multicast group released");
                        });
                        self.multicaster = Some(caster.clone());
                        caster
                    }
                };
                let ports = caster.ports(self.tracks[idx].track_type).ok_or_else(|| {
                    RtspError::TransportAllocationFailed("track not in multicast group".to_string())
                })?;
                let value = multicast_reply(
                    caster.group(),
                    self.local.ip(),
                    ports,
                    self.ctx.multicast.ttl(),
                    ssrc,
                );
                RtspResponse::ok().add_header("Transport", &value)
            }
        };
        self.rtp_type = Some(kind);
        self.tracks[idx].inited = true;
        tracing::debug!(peer = %self.peer, track = idx, ?kind, "track setup");
        self.send_response(response);
        Ok(())
    }

    // PLAY / PAUSE / TEARDOWN

    fn handle_play(&mut self, request: &RtspRequest) -> Result<()> {
        if self.tracks.is_empty() {
            return Err(RtspError::SessionNotFound);
        }
        self.check_session(request)?;
        let source = self
            .play_source
            .upgrade()
            .ok_or_else(|| RtspError::StreamNotFound(self.stream_name()))?;
        if let Some(track) = self.tracks.iter().find(|t| !t.inited) {
            return Err(RtspError::TrackNotSetup(track.control.clone()));
        }

        let mut response = RtspResponse::ok();
        if let Some(scale) = request.get_header("Scale") {
            if let Ok(speed) = scale.trim().parse::<f32>() {
                source.speed(speed);
            }
            response = response.add_header("Scale", scale);
        }
        let mut use_gop = true;
        match request.get_header("Range") {
            Some(range) => {
                if let Some(start) = npt_start(range) {
                    use_gop = !source.seek((start * 1000.0) as u64);
                }
                response = response.add_header("Range", range);
            }
            None => {
                let range = format!("npt={:.2}", source.alive_secs() as f64);
                response = response.add_header("Range", &range);
            }
        }

        let live = source.tracks();
        let rtp_info = self
            .tracks
            .iter()
            .map(|t| {
                let (seq, stamp) = live
                    .iter()
                    .find(|l| l.track_type == t.track_type)
                    .map_or((t.seq, t.timestamp), |l| (l.seq, l.timestamp));
                format!(
                    "url={};seq={};rtptime={}",
                    t.control_url(&self.content_base),
                    seq,
                    stamp
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        response = response.add_header("RTP-Info", &rtp_info);
        self.send_response(response);

        source.pause(false);
        if self.play_reader.is_none() && self.rtp_type != Some(RtpTransport::Multicast) {
            let on_read = self.handle.clone();
            let on_detach = self.handle.clone();
            self.play_reader = Some(source.ring().attach(
                use_gop,
                move |batch| {
                    on_read.post(SessionEvent::Rtp(batch.clone()));
                },
                move || {
                    on_detach.shutdown("media source released");
                },
            ));
            tracing::info!(peer = %self.peer, source = %source.identity(), use_gop, "play started");
        }
        Ok(())
    }

    fn handle_pause(&mut self, request: &RtspRequest) -> Result<()> {
        self.check_session(request)?;
        self.send_response(RtspResponse::ok());
        if let Some(source) = self.play_source.upgrade() {
            source.pause(true);
        }
        Ok(())
    }

    fn handle_teardown(&mut self) -> Result<()> {
        self.send_response(RtspResponse::ok());
        self.shutdown("teardown");
        Ok(())
    }

    // HTTP tunnel

    fn handle_get(&mut self, request: &RtspRequest) -> Result<()> {
        let cookie = request.header_or_empty("x-sessioncookie");
        if cookie.is_empty() {
            return Err(RtspError::violation("http GET without x-sessioncookie"));
        }
        self.ctx.tunnels.register(cookie, self.handle.clone());
        self.tunnel_cookie = Some(cookie.to_string());
        self.send_response(tunnel_response());
        Ok(())
    }

    fn handle_post(&mut self, request: &RtspRequest) -> Result<()> {
        let cookie = request.header_or_empty("x-sessioncookie");
        let getter = self.ctx.tunnels.take(cookie)?;
        tracing::debug!(peer = %self.peer, cookie, getter = getter.id(), "http poster attached");
        self.send_response(tunnel_response());

        let mut decoder = Base64Stream::default();
        let decoded = decoder.decode(request.body.as_bytes())?;
        if !decoded.is_empty() && !getter.post(SessionEvent::Data(decoded)) {
            self.shutdown("http getter released");
            return Ok(());
        }
        self.tunnel_post = Some(TunnelPost { getter, decoder });
        let rest = self.splitter.take_remaining();
        if !rest.is_empty() {
            self.on_recv(&rest);
        }
        Ok(())
    }
}

fn tunnel_response() -> RtspResponse {
    RtspResponse::ok()
        .with_protocol("HTTP/1.0")
        .add_header("Cache-Control", "no-store")
        .add_header("Pragma", "no-store")
        .add_header("Content-Type", "application/x-rtsp-tunnelled")
}

/// Start of an `npt=` range in seconds; `now` and an empty start mean 0.
fn npt_start(range: &str) -> Option<f64> {
    let value = range.trim().strip_prefix("npt=")?;
    let start = value.split('-').next().unwrap_or("").trim();
    if start.is_empty() || start == "now" {
        return Some(0.0);
    }
    start.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::net::UdpSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::Receiver;
    use std::time::Instant;

    use base64::prelude::{BASE64_STANDARD, Engine as _};
    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::hooks::{Completion, FlowReport, Hooks};
    use crate::media::TrackType;
    use crate::media::rtcp::PT_SR;
    use crate::media::rtp::{RtpHeader, RtpPacket, interleaved_prefix};
    use crate::server::{ServerConfig, ServerContext};
    use crate::source::identity::DEFAULT_VHOST;
    use crate::source::{MediaRegistry, StreamIdentity};

    const URL: &str = "rtsp://127.0.0.1/live/cam";

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=cam\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1\r\n\
        a=control:trackID=0\r\n\
        m=audio 0 RTP/AVP 8\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=control:trackID=1\r\n";

    const AUDIO_SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=mic\r\n\
        t=0 0\r\n\
        m=audio 0 RTP/AVP 8\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=control:trackID=0\r\n";

    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Wire {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    /// A session driven by hand: input goes in as events, output is read
    /// back from the in-memory wire.
    struct Client {
        session: RtspSession,
        events: Receiver<SessionEvent>,
        wire: Wire,
    }

    impl Client {
        fn new(ctx: &Arc<ServerContext>) -> Self {
            let wire = Wire::default();
            let (session, events) = RtspSession::new(
                ctx.clone(),
                "127.0.0.1:50000".parse().unwrap(),
                "127.0.0.1:554".parse().unwrap(),
                Box::new(wire.clone()),
            );
            Self {
                session,
                events,
                wire,
            }
        }

        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.session.handle_event(event);
            }
        }

        fn feed(&mut self, data: &[u8]) {
            self.session
                .handle_event(SessionEvent::Data(Bytes::copy_from_slice(data)));
            self.pump();
        }

        fn send(&mut self, text: &str) -> String {
            self.feed(text.as_bytes());
            self.output()
        }

        fn output(&mut self) -> String {
            String::from_utf8_lossy(&self.wire.take()).into_owned()
        }

        fn closed(&self) -> Option<&str> {
            self.session.close_reason()
        }
    }

    fn request(method: &str, url: &str, cseq: u32, headers: &str, body: &str) -> String {
        let mut req = format!("{method} {url} RTSP/1.0\r\nCSeq: {cseq}\r\n{headers}");
        if !body.is_empty() {
            req.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        req.push_str("\r\n");
        req.push_str(body);
        req
    }

    fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
        response.lines().find_map(|line| {
            line.split_once(':')
                .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
        })
    }

    fn session_of(response: &str) -> String {
        header(response, "Session")
            .and_then(|s| s.split(';').next())
            .unwrap_or_default()
            .to_string()
    }

    /// `$`-framed packets as (channel, payload).
    fn frames(raw: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i + 4 <= raw.len() && raw[i] == b'$' {
            let len = u16::from_be_bytes([raw[i + 2], raw[i + 3]]) as usize;
            out.push((raw[i + 1], raw[i + 4..i + 4 + len].to_vec()));
            i += 4 + len;
        }
        out
    }

    fn context(config: ServerConfig, hooks: Hooks) -> Arc<ServerContext> {
        ServerContext::new(config, hooks, MediaRegistry::new(), None)
    }

    fn open_context() -> Arc<ServerContext> {
        context(ServerConfig::default(), Hooks::default())
    }

    fn live_source(ctx: &ServerContext, stream: &str, sdp: &str) -> Arc<MediaSource> {
        let source = MediaSource::new(
            StreamIdentity::new(RTSP_SCHEMA, DEFAULT_VHOST, "live", stream),
            sdp.to_string(),
        );
        ctx.registry.register(&source).unwrap();
        source
    }

    fn announce(client: &mut Client) -> String {
        let resp = client.send(&request(
            "ANNOUNCE",
            URL,
            1,
            "Content-Type: application/sdp\r\n",
            SDP,
        ));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        session_of(&resp)
    }

    fn setup_tcp_push(client: &mut Client, sid: &str, track: usize, cseq: u32) -> String {
        let headers = format!(
            "Transport: RTP/AVP/TCP;unicast;interleaved={}-{}\r\nSession: {sid}\r\n",
            track * 2,
            track * 2 + 1
        );
        client.send(&request("SETUP", &format!("{URL}/trackID={track}"), cseq, &headers, ""))
    }

    fn publish(ctx: &Arc<ServerContext>) -> (Client, String) {
        let mut pusher = Client::new(ctx);
        let sid = announce(&mut pusher);
        for track in 0..2 {
            let resp = setup_tcp_push(&mut pusher, &sid, track, 2 + track as u32);
            assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
            assert!(resp.contains(&format!("interleaved={}-{}", track * 2, track * 2 + 1)));
        }
        let resp = pusher.send(&request("RECORD", URL, 4, &format!("Session: {sid}\r\n"), ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        assert_eq!(
            header(&resp, "RTP-Info"),
            Some("url=rtsp://127.0.0.1/live/cam/trackID=0,url=rtsp://127.0.0.1/live/cam/trackID=1")
        );
        (pusher, sid)
    }

    fn describe(client: &mut Client) -> String {
        let resp = client.send(&request("DESCRIBE", URL, 1, "Accept: application/sdp\r\n", ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        assert_eq!(header(&resp, "Content-Base"), Some("rtsp://127.0.0.1/live/cam/"));
        assert!(resp.contains("m=audio"));
        session_of(&resp)
    }

    /// DESCRIBE then SETUP both tracks over TCP.
    fn setup_player(ctx: &Arc<ServerContext>) -> (Client, String) {
        let mut player = Client::new(ctx);
        let sid = describe(&mut player);
        for track in 0..2 {
            let resp = player.send(&request(
                "SETUP",
                &format!("{URL}/trackID={track}"),
                2 + track as u32,
                &format!("Transport: RTP/AVP/TCP;unicast\r\nSession: {sid}\r\n"),
                "",
            ));
            assert!(resp.contains(&format!("interleaved={}-{}", track * 2, track * 2 + 1)), "{resp}");
        }
        (player, sid)
    }

    fn play_tcp(ctx: &Arc<ServerContext>) -> Client {
        let (mut player, sid) = setup_player(ctx);
        let resp = player.send(&request("PLAY", URL, 4, &format!("Session: {sid}\r\n"), ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        assert!(
            header(&resp, "RTP-Info").is_some_and(|v| v.starts_with("url=rtsp://127.0.0.1/live/cam/trackID=0;seq=")),
            "{resp}"
        );
        player
    }

    fn pcma_packet(header: &mut RtpHeader, ts: u32) -> Vec<u8> {
        let mut rtp = header.write(true, ts).to_vec();
        rtp.extend_from_slice(&[0xd5; 160]);
        rtp
    }

    #[test]
    fn options_lists_public_methods() {
        let ctx = open_context();
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("OPTIONS", URL, 1, "", ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 1\r\n"), "{resp}");
        assert_eq!(header(&resp, "Public"), Some(PUBLIC_METHODS));
        assert_eq!(header(&resp, "Server"), Some("rtsp-relay"));
        assert!(header(&resp, "Session").is_none());
        assert!(client.closed().is_none());
    }

    #[test]
    fn keepalive_parameters_are_acknowledged() {
        let ctx = open_context();
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("GET_PARAMETER", URL, 7, "", ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 7\r\n"), "{resp}");
    }

    #[test]
    fn unknown_method_is_forbidden_and_closes() {
        let ctx = open_context();
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("REDIRECT", URL, 1, "", ""));
        assert!(resp.starts_with("RTSP/1.0 403 Forbidden"), "{resp}");
        assert_eq!(header(&resp, "Connection"), Some("Close"));
        assert!(client.closed().is_some());
    }

    #[test]
    fn publish_then_play_over_tcp() {
        let ctx = open_context();
        let (mut pusher, _) = publish(&ctx);
        assert!(pusher.session.is_publisher());
        let mut player = play_tcp(&ctx);
        assert_eq!(player.session.rtp_transport(), Some(RtpTransport::Tcp));

        let mut rtp_header = RtpHeader::new(8, 0x1234);
        let rtp = pcma_packet(&mut rtp_header, 160);
        let mut framed = interleaved_prefix(rtp.len(), 2).to_vec();
        framed.extend_from_slice(&rtp);
        pusher.feed(&framed);

        player.pump();
        let out = frames(&player.wire.take());
        assert!(out.iter().any(|(ch, data)| *ch == 3 && data[1] == PT_SR), "{out:?}");
        assert!(out.iter().any(|(ch, data)| *ch == 2 && *data == rtp));

        let source = ctx
            .registry
            .find(&StreamIdentity::new(RTSP_SCHEMA, DEFAULT_VHOST, "live", "cam"))
            .unwrap();
        let live = source.tracks();
        let audio = live.iter().find(|t| t.track_type == TrackType::Audio).unwrap();
        assert_eq!(audio.ssrc, 0x1234);
        assert_eq!(audio.timestamp, 160);
    }

    #[test]
    fn teardown_answers_then_closes() {
        let ctx = open_context();
        let (mut pusher, sid) = publish(&ctx);
        let resp = pusher.send(&request("TEARDOWN", URL, 5, &format!("Session: {sid}\r\n"), ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        assert_eq!(pusher.closed(), Some("teardown"));
    }

    #[test]
    fn second_announce_is_rejected() {
        let ctx = open_context();
        let (_pusher, _) = publish(&ctx);
        let mut other = Client::new(&ctx);
        let resp = other.send(&request("ANNOUNCE", URL, 1, "Content-Type: application/sdp\r\n", SDP));
        assert!(resp.starts_with("RTSP/1.0 406 Not Acceptable"), "{resp}");
        assert!(resp.ends_with("Already publishing."));
        assert!(other.closed().is_some());
    }

    #[test]
    fn announce_without_tracks_is_rejected() {
        let ctx = open_context();
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("ANNOUNCE", URL, 1, "", "v=0\r\ns=empty\r\n"));
        assert!(resp.starts_with("RTSP/1.0 403 Forbidden"), "{resp}");
        assert!(resp.ends_with("No available track in sdp."));
    }

    #[test]
    fn describe_needs_app_and_stream() {
        let played = Arc::new(AtomicUsize::new(0));
        let counter = played.clone();
        let ctx = context(
            ServerConfig::default(),
            Hooks {
                on_play: Some(Arc::new(move |_: &MediaInfo, done: Completion<std::result::Result<(), String>>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    done.complete(Ok(()));
                })),
                ..Hooks::default()
            },
        );
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("DESCRIBE", "rtsp://127.0.0.1/cam", 1, "", ""));
        assert!(resp.starts_with("RTSP/1.0 403 Forbidden"), "{resp}");
        assert_eq!(header(&resp, "Connection"), Some("Close"));
        assert!(client.closed().is_some());
        assert_eq!(played.load(Ordering::SeqCst), 0, "hooks must not run");
    }

    #[test]
    fn announce_strips_sdp_suffix() {
        let ctx = open_context();
        let mut client = Client::new(&ctx);
        let resp = client.send(&request(
            "ANNOUNCE",
            "rtsp://127.0.0.1/live/cam.sdp",
            1,
            "",
            SDP,
        ));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        let identity = StreamIdentity::new(RTSP_SCHEMA, DEFAULT_VHOST, "live", "cam");
        assert!(ctx.registry.find(&identity).is_some());
    }

    #[test]
    fn record_with_wrong_session_is_rejected() {
        let ctx = open_context();
        let mut pusher = Client::new(&ctx);
        announce(&mut pusher);
        let resp = pusher.send(&request("RECORD", URL, 2, "Session: nope\r\n", ""));
        assert!(resp.starts_with("RTSP/1.0 454 Session Not Found"), "{resp}");
        assert_eq!(header(&resp, "Connection"), Some("Close"));
        assert!(pusher.closed().is_some());
    }

    #[test]
    fn record_before_every_track_is_set_up() {
        let ctx = open_context();
        let mut pusher = Client::new(&ctx);
        let sid = announce(&mut pusher);
        setup_tcp_push(&mut pusher, &sid, 0, 2);
        let resp = pusher.send(&request("RECORD", URL, 3, &format!("Session: {sid}\r\n"), ""));
        assert!(resp.starts_with("RTSP/1.0 455"), "{resp}");
    }

    #[test]
    fn setup_twice_is_forbidden() {
        let ctx = open_context();
        let mut pusher = Client::new(&ctx);
        let sid = announce(&mut pusher);
        let first = setup_tcp_push(&mut pusher, &sid, 0, 2);
        assert!(first.starts_with("RTSP/1.0 200 OK"), "{first}");
        let second = setup_tcp_push(&mut pusher, &sid, 0, 3);
        assert!(second.starts_with("RTSP/1.0 403 Forbidden"), "{second}");
        assert!(pusher.closed().is_some());
    }

    #[test]
    fn play_before_describe_has_no_session() {
        let ctx = open_context();
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("PLAY", URL, 1, "Session: abc\r\n", ""));
        assert!(resp.starts_with("RTSP/1.0 454"), "{resp}");
    }

    #[derive(Default)]
    struct PauseCounter {
        pauses: AtomicUsize,
    }

    impl MediaSourceEvent for PauseCounter {
        fn pause(&self, _source: &MediaSource, _pause: bool) -> bool {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn paused_source(ctx: &ServerContext) -> (Arc<MediaSource>, Arc<PauseCounter>) {
        let source = live_source(ctx, "cam", SDP);
        let owner = Arc::new(PauseCounter::default());
        let weak: std::sync::Weak<PauseCounter> = Arc::downgrade(&owner);
        source.set_listener(weak);
        (source, owner)
    }

    #[test]
    fn play_with_wrong_session_does_not_start() {
        let ctx = open_context();
        let (source, _owner) = paused_source(&ctx);
        let (mut player, sid) = setup_player(&ctx);
        assert_ne!(sid, "wrong");

        let resp = player.send(&request("PLAY", URL, 4, "Session: wrong\r\n", ""));
        assert!(resp.starts_with("RTSP/1.0 454"), "{resp}");
        assert!(player.session.play_reader.is_none());
        assert_eq!(source.reader_count(), 0);
    }

    #[test]
    fn pause_with_wrong_session_is_refused() {
        let ctx = open_context();
        let (_source, owner) = paused_source(&ctx);
        let (mut player, _sid) = setup_player(&ctx);
        let resp = player.send(&request("PAUSE", URL, 4, "Session: wrong\r\n", ""));
        assert!(resp.starts_with("RTSP/1.0 454"), "{resp}");
        assert!(player.session.play_reader.is_none());
        assert_eq!(owner.pauses.load(Ordering::SeqCst), 0);

        // the right id still reaches the owner
        let mut other = Client::new(&ctx);
        let other_sid = describe(&mut other);
        let resp = other.send(&request("PAUSE", URL, 2, &format!("Session: {other_sid}\r\n"), ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        assert_eq!(owner.pauses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn describe_of_missing_stream_times_out_with_404() {
        let config = ServerConfig {
            find_async_timeout_ms: 0,
            ..ServerConfig::default()
        };
        let ctx = context(config, Hooks::default());
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("DESCRIBE", "rtsp://127.0.0.1/live/none", 1, "", ""));
        assert!(resp.is_empty(), "{resp}");

        ctx.registry.expire_waiters(Instant::now() + Duration::from_secs(1));
        client.pump();
        let resp = client.output();
        assert!(resp.starts_with("RTSP/1.0 404 Stream Not Found"), "{resp}");
        assert_eq!(header(&resp, "Connection"), Some("Close"));
        assert!(client.closed().is_some());
    }

    #[test]
    fn requests_wait_for_pending_hook() {
        let pending: Arc<Mutex<Option<Completion<String>>>> = Arc::default();
        let slot = pending.clone();
        let hooks = Hooks {
            on_get_realm: Some(Arc::new(move |_: &MediaInfo, done: Completion<String>| {
                *slot.lock() = Some(done);
            })),
            ..Hooks::default()
        };
        let ctx = context(ServerConfig::default(), hooks);
        let _source = live_source(&ctx, "cam", SDP);
        let mut client = Client::new(&ctx);

        let both = request("DESCRIBE", URL, 1, "", "") + &request("OPTIONS", URL, 2, "", "");
        assert!(client.send(&both).is_empty());

        let done = pending.lock().take().unwrap();
        done.complete(String::new());
        client.pump();
        let out = client.output();
        let describe = out.find("CSeq: 1").unwrap();
        let options = out.find("CSeq: 2").unwrap();
        assert!(describe < options, "{out}");
        assert_eq!(out.matches("RTSP/1.0 200 OK").count(), 2);
    }

    fn auth_hooks() -> Hooks {
        Hooks {
            on_get_realm: Some(Arc::new(|_: &MediaInfo, done: Completion<String>| {
                done.complete("relay".to_string())
            })),
            on_rtsp_auth: Some(Arc::new(
                |_: &MediaInfo, _realm: &str, user: &str, _plain: bool, done: Completion<Option<Password>>| {
                    done.complete((user == "admin").then(|| Password::Plain("secret".to_string())))
                },
            )),
            ..Hooks::default()
        }
    }

    fn nonce_of(response: &str) -> String {
        response
            .split("nonce=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap_or_default()
            .to_string()
    }

    fn digest_header(nonce: &str, password: &str) -> String {
        let ha1 = auth::md5_hex(&format!("admin:relay:{password}"));
        let response = auth::digest_response(&ha1, nonce, "DESCRIBE", URL);
        format!(
            "Authorization: Digest username=\"admin\", realm=\"relay\", nonce=\"{nonce}\", uri=\"{URL}\", response=\"{response}\"\r\n"
        )
    }

    #[test]
    fn digest_challenge_then_success() {
        let ctx = context(ServerConfig::default(), auth_hooks());
        let _source = live_source(&ctx, "cam", SDP);
        let mut client = Client::new(&ctx);

        let resp = client.send(&request("DESCRIBE", URL, 1, "", ""));
        assert!(resp.starts_with("RTSP/1.0 401 Unauthorized"), "{resp}");
        assert!(header(&resp, "WWW-Authenticate").is_some_and(|v| v.starts_with("Digest realm=\"relay\"")));
        let nonce = nonce_of(&resp);
        assert_eq!(nonce.len(), auth::NONCE_LEN);
        assert!(client.closed().is_none());

        let resp = client.send(&request("DESCRIBE", URL, 2, &digest_header(&nonce, "secret"), ""));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        assert!(!client.session.session_id().is_empty());
    }

    #[test]
    fn second_wrong_password_closes() {
        let ctx = context(ServerConfig::default(), auth_hooks());
        let _source = live_source(&ctx, "cam", SDP);
        let mut client = Client::new(&ctx);

        let nonce = nonce_of(&client.send(&request("DESCRIBE", URL, 1, "", "")));
        let resp = client.send(&request("DESCRIBE", URL, 2, &digest_header(&nonce, "guess"), ""));
        assert!(resp.starts_with("RTSP/1.0 401 Unauthorized"), "{resp}");
        assert!(header(&resp, "Connection").is_none());
        assert!(client.closed().is_none());

        let resp = client.send(&request("DESCRIBE", URL, 3, &digest_header(&nonce, "guess"), ""));
        assert!(resp.starts_with("RTSP/1.0 401 Unauthorized"), "{resp}");
        assert_eq!(header(&resp, "Connection"), Some("Close"));
        assert!(client.closed().is_some());
    }

    #[test]
    fn basic_auth_when_configured() {
        let config = ServerConfig {
            auth_basic: true,
            ..ServerConfig::default()
        };
        let ctx = context(config, auth_hooks());
        let _source = live_source(&ctx, "cam", SDP);
        let mut client = Client::new(&ctx);

        let resp = client.send(&request("DESCRIBE", URL, 1, "", ""));
        assert_eq!(header(&resp, "WWW-Authenticate"), Some("Basic realm=\"relay\""));

        let credentials = BASE64_STANDARD.encode("admin:secret");
        let resp = client.send(&request(
            "DESCRIBE",
            URL,
            2,
            &format!("Authorization: Basic {credentials}\r\n"),
            "",
        ));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
    }

    #[test]
    fn play_hook_rejection_closes_with_reason() {
        let hooks = Hooks {
            on_play: Some(Arc::new(|_: &MediaInfo, done: Completion<std::result::Result<(), String>>| {
                done.complete(Err("token expired".to_string()))
            })),
            ..Hooks::default()
        };
        let ctx = context(ServerConfig::default(), hooks);
        let _source = live_source(&ctx, "cam", SDP);
        let mut client = Client::new(&ctx);
        let resp = client.send(&request("DESCRIBE", URL, 1, "", ""));
        assert!(resp.starts_with("RTSP/1.0 401 Unauthorized"), "{resp}");
        assert!(resp.ends_with("token expired"));
        assert_eq!(client.closed(), Some("token expired"));
    }

    #[test]
    fn publish_hook_grant_is_applied() {
        let hooks = Hooks {
            on_publish: Some(Arc::new(
                |info: &MediaInfo, done: Completion<std::result::Result<PublishGrant, String>>| {
                    if info.stream == "cam" {
                        done.complete(Ok(PublishGrant::default()));
                    } else {
                        done.complete(Err("not allowed".to_string()));
                    }
                },
            )),
            ..Hooks::default()
        };
        let ctx = context(ServerConfig::default(), hooks);
        let mut allowed = Client::new(&ctx);
        announce(&mut allowed);

        let mut denied = Client::new(&ctx);
        let resp = denied.send(&request("ANNOUNCE", "rtsp://127.0.0.1/live/other", 1, "", SDP));
        assert!(resp.starts_with("RTSP/1.0 401 Unauthorized"), "{resp}");
        assert!(denied.closed().is_some());
    }

    #[test]
    fn owner_close_respects_readers() {
        let ctx = open_context();
        let (mut pusher, _) = publish(&ctx);
        let player = play_tcp(&ctx);
        let source = ctx
            .registry
            .find(&StreamIdentity::new(RTSP_SCHEMA, DEFAULT_VHOST, "live", "cam"))
            .unwrap();
        assert_eq!(source.total_reader_count(), 1);
        assert!(!source.close(false));
        assert!(source.close(true));
        pusher.pump();
        assert_eq!(pusher.closed(), Some("closed by owner"));
        drop(player);
    }

    #[test]
    fn player_is_told_when_source_goes_away() {
        let ctx = open_context();
        let (pusher, _) = publish(&ctx);
        let mut player = play_tcp(&ctx);
        drop(pusher);
        player.pump();
        assert_eq!(player.closed(), Some("media source released"));
    }

    #[test]
    fn http_tunnel_forwards_posted_requests() {
        let ctx = open_context();
        let mut getter = Client::new(&ctx);
        let resp = getter.send(
            "GET /live/cam HTTP/1.0\r\nx-sessioncookie: c00kie\r\nAccept: application/x-rtsp-tunnelled\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.0 200 OK"), "{resp}");
        assert_eq!(header(&resp, "Content-Type"), Some("application/x-rtsp-tunnelled"));
        assert_eq!(ctx.tunnels.len(), 1);

        let first = BASE64_STANDARD.encode(request("OPTIONS", URL, 1, "", ""));
        let mut poster = Client::new(&ctx);
        let resp = poster.send(&format!(
            "POST /live/cam HTTP/1.0\r\nx-sessioncookie: c00kie\r\nContent-Type: application/x-rtsp-tunnelled\r\nContent-Length: 32767\r\n\r\n{first}"
        ));
        assert!(resp.starts_with("HTTP/1.0 200 OK"), "{resp}");
        assert!(ctx.tunnels.is_empty());

        getter.pump();
        let resp = getter.output();
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 1\r\n"), "{resp}");

        // a base64 quantum cut in half across two reads
        let second = BASE64_STANDARD.encode(request("OPTIONS", URL, 2, "", ""));
        let (a, b) = second.split_at(5);
        poster.feed(a.as_bytes());
        poster.feed(b.as_bytes());
        assert!(poster.output().is_empty());
        getter.pump();
        assert!(getter.output().contains("CSeq: 2"));

        // the POST leg is exempt from the handshake rule
        poster.session.check_alive(Instant::now() + Duration::from_secs(60));
        assert!(poster.closed().is_none());

        drop(getter);
        poster.feed(first.as_bytes());
        assert_eq!(poster.closed(), Some("http getter released"));
    }

    #[test]
    fn http_post_without_getter_closes_silently() {
        let ctx = open_context();
        let mut poster = Client::new(&ctx);
        let resp = poster.send("POST /live/cam HTTP/1.0\r\nx-sessioncookie: missing\r\n\r\n");
        assert!(resp.is_empty(), "{resp}");
        assert!(poster.closed().is_some());
    }

    #[test]
    fn keep_alive_rules() {
        let ctx = open_context();
        let later = || Instant::now() + Duration::from_secs(16);

        let mut idle = Client::new(&ctx);
        idle.session.check_alive(later());
        assert_eq!(idle.closed(), Some("illegal connection"));

        let (mut pusher, _) = publish(&ctx);
        pusher.session.check_alive(later());
        assert_eq!(pusher.closed(), Some("pusher session timeout"));

        let ctx = open_context();
        let _source = live_source(&ctx, "cam", SDP);
        let mut player = play_tcp(&ctx);
        player.session.check_alive(Instant::now() + Duration::from_secs(120));
        assert!(player.closed().is_none());
    }

    #[test]
    fn udp_player_receives_rtp() {
        let config = ServerConfig {
            udp_port_range: 43200..=43300,
            ..ServerConfig::default()
        };
        let ctx = context(config, Hooks::default());
        let source = live_source(&ctx, "mic", AUDIO_SDP);
        let url = "rtsp://127.0.0.1/live/mic";

        let client_rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_rtp
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = client_rtp.local_addr().unwrap().port();

        let mut player = Client::new(&ctx);
        let sid = session_of(&player.send(&request("DESCRIBE", url, 1, "", "")));
        let resp = player.send(&request(
            "SETUP",
            &format!("{url}/trackID=0"),
            2,
            &format!("Transport: RTP/AVP;unicast;client_port={}-{}\r\n", port, port + 1),
            "",
        ));
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
        let transport = header(&resp, "Transport").unwrap();
        assert!(transport.starts_with(&format!("RTP/AVP/UDP;unicast;client_port={}-{};server_port=432", port, port + 1)), "{transport}");

        let resp = player.send(&request(
            "PLAY",
            url,
            3,
            &format!("Session: {sid}\r\nRange: npt=0.000-\r\n"),
            "",
        ));
        assert_eq!(header(&resp, "Range"), Some("npt=0.000-"));
        assert_eq!(player.session.rtp_transport(), Some(RtpTransport::Udp));

        let mut h = RtpHeader::new(8, 0x55);
        let rtp = pcma_packet(&mut h, 0);
        let packet = RtpPacket::parse(Bytes::from(rtp.clone()), TrackType::Audio, 8000).unwrap();
        source.write_rtp(packet, true);
        player.pump();

        let mut buf = [0u8; 2048];
        let (n, _) = client_rtp.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], rtp.as_slice());
    }

    #[test]
    fn udp_setup_needs_client_port() {
        let ctx = open_context();
        let _source = live_source(&ctx, "cam", SDP);
        let mut player = Client::new(&ctx);
        describe(&mut player);
        let resp = player.send(&request(
            "SETUP",
            &format!("{URL}/trackID=0"),
            2,
            "Transport: RTP/AVP;unicast\r\n",
            "",
        ));
        assert!(resp.starts_with("RTSP/1.0 461 Unsupported Transport"), "{resp}");
        assert_eq!(player.session.rtp_transport(), None, "failed SETUP must not fix the transport");
        assert!(!player.session.tracks[0].inited);
    }

    #[test]
    fn multicast_players_share_one_group() {
        let config = ServerConfig {
            udp_port_range: 43000..=43100,
            ..ServerConfig::default()
        };
        let ctx = context(config, Hooks::default());
        let source = live_source(&ctx, "cam", SDP);

        let mut transports = Vec::new();
        let mut players = Vec::new();
        for _ in 0..2 {
            let mut player = Client::new(&ctx);
            let sid = describe(&mut player);
            let mut lines = Vec::new();
            for track in 0..2 {
                let resp = player.send(&request(
                    "SETUP",
                    &format!("{URL}/trackID={track}"),
                    2 + track,
                    "Transport: RTP/AVP;multicast\r\n",
                    "",
                ));
                assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
                let transport = header(&resp, "Transport").unwrap();
                lines.push(transport.split(";ssrc=").next().unwrap().to_string());
            }
            let resp = player.send(&request("PLAY", URL, 4, &format!("Session: {sid}\r\n"), ""));
            assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
            transports.push(lines);
            players.push(player);
        }
        assert_eq!(transports[0], transports[1]);
        assert!(transports[0][0].contains("destination=239.0.0.0;source=127.0.0.1;port="));
        assert!(transports[0][0].contains(";ttl=64"));
        assert_eq!(ctx.multicast.group_count(), 1);
        assert_eq!(source.reader_count(), 1);

        drop(source);
        for player in &mut players {
            player.pump();
            assert_eq!(player.closed(), Some("multicast group released"));
        }
    }

    #[test]
    fn multicast_publish_is_unsupported() {
        let ctx = open_context();
        let mut pusher = Client::new(&ctx);
        let sid = announce(&mut pusher);
        let resp = pusher.send(&request(
            "SETUP",
            &format!("{URL}/trackID=0"),
            2,
            &format!("Transport: RTP/AVP;multicast\r\nSession: {sid}\r\n"),
            "",
        ));
        assert!(resp.starts_with("RTSP/1.0 461"), "{resp}");
    }

    #[test]
    fn flow_report_on_close() {
        let reports: Arc<Mutex<Vec<FlowReport>>> = Arc::default();
        let sink = reports.clone();
        let hooks = Hooks {
            on_flow_report: Some(Arc::new(move |report: &FlowReport| {
                sink.lock().push(report.clone());
            })),
            ..Hooks::default()
        };
        let config = ServerConfig {
            flow_threshold_kb: 0,
            ..ServerConfig::default()
        };
        let ctx = context(config, hooks);
        let mut client = Client::new(&ctx);
        client.send(&request("OPTIONS", URL, 1, "", ""));
        drop(client);

        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_player);
        assert!(reports[0].total_bytes > 0);
        assert_eq!(reports[0].peer, "127.0.0.1:50000");
    }

    #[test]
    fn npt_range_start() {
        assert_eq!(npt_start("npt=now-"), Some(0.0));
        assert_eq!(npt_start("npt=-20"), Some(0.0));
        assert_eq!(npt_start("npt=12.5-30"), Some(12.5));
        assert_eq!(npt_start("clock=19961108T142300Z-"), None);
    }
}
