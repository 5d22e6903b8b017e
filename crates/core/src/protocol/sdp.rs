//! SDP (Session Description Protocol, RFC 4566) parsing and generation.
//!
//! Parsing covers what SETUP needs from an announced description: media
//! type, payload type, clock rate and control URL per track. Generation
//! produces the description the relay serves for streams it packetizes
//! itself:
//!
//! ```text
//! v=0
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>
//! s=<session-name>
//! c=IN IP4 <addr>
//! t=0 0
//! a=tool:rtsp-relay
//! a=range:npt=now-
//! a=control:*
//! m=video 0 RTP/AVP 96
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1
//! a=control:trackID=0
//! ```

use crate::media::track::{CodecId, TrackType};

/// Per-session, per-track negotiated state.
///
/// Built from the SDP at DESCRIBE/ANNOUNCE, then completed by SETUP.
#[derive(Debug, Clone)]
pub struct SdpTrack {
    pub track_type: TrackType,
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap` (e.g. `H264`).
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// `a=control` value, relative or absolute.
    pub control: String,
    /// `a=fmtp` parameters without the payload type prefix.
    pub fmtp: String,
    /// RTP channel for TCP interleaving (RTCP is `interleaved + 1`).
    pub interleaved: u8,
    pub ssrc: u32,
    /// Sequence and timestamp baseline reported in `RTP-Info`.
    pub seq: u16,
    pub timestamp: u32,
    /// SETUP completed for this track.
    pub inited: bool,
}

impl SdpTrack {
    fn new(track_type: TrackType, payload_type: u8) -> Self {
        Self {
            track_type,
            payload_type,
            encoding: String::new(),
            sample_rate: 0,
            channels: 1,
            control: String::new(),
            fmtp: String::new(),
            interleaved: 0,
            ssrc: 0,
            seq: 0,
            timestamp: 0,
            inited: false,
        }
    }

    pub fn codec(&self) -> CodecId {
        CodecId::from_encoding_name(&self.encoding)
    }

    /// Absolute control URL for this track under `content_base`.
    pub fn control_url(&self, content_base: &str) -> String {
        if self.control.contains("://") {
            return self.control.clone();
        }
        format!("{}/{}", content_base.trim_end_matches('/'), self.control)
    }

    fn finish(&mut self, index: usize) {
        if self.encoding.is_empty() {
            // static payload types (RFC 3551 table 4)
            let (name, rate) = match self.payload_type {
                0 => ("PCMU", 8000),
                8 => ("PCMA", 8000),
                _ => ("", 0),
            };
            self.encoding = name.to_string();
            self.sample_rate = rate;
        }
        if self.sample_rate == 0 {
            self.sample_rate = match self.track_type {
                TrackType::Audio => 8000,
                _ => 90000,
            };
        }
        if self.control.is_empty() {
            self.control = format!("trackID={index}");
        }
    }
}

/// Parse an SDP body into its usable tracks.
///
/// At most one video and one audio track are kept, in SDP order; other
/// media (application, text) are ignored.
pub fn parse_sdp(sdp: &str) -> Vec<SdpTrack> {
    fn push(track: Option<SdpTrack>, tracks: &mut Vec<SdpTrack>) {
        if let Some(mut t) = track
            && t.track_type != TrackType::Unknown
            && !tracks.iter().any(|x| x.track_type == t.track_type)
        {
            t.finish(tracks.len());
            tracks.push(t);
        }
    }

    let mut tracks: Vec<SdpTrack> = Vec::new();
    let mut current: Option<SdpTrack> = None;

    for line in sdp.lines() {
        let line = line.trim();
        if let Some(media) = line.strip_prefix("m=") {
            push(current.take(), &mut tracks);
            let mut fields = media.split_whitespace();
            let kind = TrackType::from_sdp_name(fields.next().unwrap_or(""));
            let pt = fields.nth(2).and_then(|p| p.parse().ok()).unwrap_or(0);
            current = Some(SdpTrack::new(kind, pt));
            continue;
        }
        let Some(track) = current.as_mut() else {
            continue;
        };
        if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            // <pt> <encoding>/<clock>[/<channels>]
            let mut it = rtpmap.splitn(2, ' ');
            let pt = it.next().and_then(|p| p.trim().parse::<u8>().ok());
            if pt != Some(track.payload_type) {
                continue;
            }
            let mut enc = it.next().unwrap_or("").split('/');
            track.encoding = enc.next().unwrap_or("").to_string();
            track.sample_rate = enc.next().and_then(|r| r.parse().ok()).unwrap_or(0);
            track.channels = enc.next().and_then(|c| c.parse().ok()).unwrap_or(1);
        } else if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
            if let Some((_, params)) = fmtp.split_once(' ') {
                track.fmtp = params.trim().to_string();
            }
        } else if let Some(control) = line.strip_prefix("a=control:") {
            track.control = control.trim().to_string();
        }
    }
    push(current.take(), &mut tracks);
    tracks
}

/// Origin and session-level fields of a generated description.
#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub ip: String,
    pub session_name: String,
}

impl Default for SdpOrigin {
    fn default() -> Self {
        Self {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            ip: "0.0.0.0".to_string(),
            session_name: "Streamed by rtsp-relay".to_string(),
        }
    }
}

/// One `m=` section of a generated description.
#[derive(Debug, Clone)]
pub struct MediaSection {
    pub track_type: TrackType,
    pub payload_type: u8,
    pub attributes: Vec<String>,
}

pub fn generate_sdp(origin: &SdpOrigin, media: &[MediaSection]) -> String {
    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!(
            "o={} {} {} IN IP4 {}",
            origin.username, origin.session_id, origin.session_version, origin.ip
        ),
        format!("s={}", origin.session_name),
        format!("c=IN IP4 {}", origin.ip),
        "t=0 0".to_string(),
        "a=tool:rtsp-relay".to_string(),
        "a=range:npt=now-".to_string(),
        "a=control:*".to_string(),
    ];
    for m in media {
        sdp.push(format!(
            "m={} 0 RTP/AVP {}",
            m.track_type.sdp_name(),
            m.payload_type
        ));
        sdp.extend(m.attributes.iter().cloned());
    }

    tracing::debug!(tracks = media.len(), "SDP generated");
    format!("{}\r\n", sdp.join("\r\n"))
}
