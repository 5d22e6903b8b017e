//! RTP back to frames, for streams published over RTSP.
//!
//! A publisher's RTP is relayed to RTSP players untouched; the demuxer
//! here additionally rebuilds access units so the same stream can feed the
//! fan-out engine (recorders, other protocols, RTP re-senders).
//!
//! - H.264 (RFC 6184): single NAL, STAP-A and FU-A, reassembled into
//!   Annex B access units, flushed on the marker bit or a timestamp change.
//! - AAC (RFC 3640 AAC-hbr): AU headers stripped, one frame per AU, ADTS
//!   header restored from the SDP `config=`.
//! - G.711 / Opus: one frame per packet.

use std::sync::Arc;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{BufMut, BytesMut};

use crate::protocol::sdp::SdpTrack;

use super::rtp::RtpPacket;
use super::{CodecId, Frame, Track, TrackType};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Demuxer for every track of one announced SDP.
pub struct RtspDemuxer {
    tracks: Vec<(TrackType, Arc<Track>, Box<dyn Depacketizer>)>,
}

trait Depacketizer: Send {
    fn input(&mut self, packet: &RtpPacket, out: &mut Vec<Frame>);
}

impl RtspDemuxer {
    pub fn from_sdp(sdp_tracks: &[SdpTrack]) -> Self {
        let mut tracks: Vec<(TrackType, Arc<Track>, Box<dyn Depacketizer>)> = Vec::new();
        for sdp in sdp_tracks {
            let codec = sdp.codec();
            match codec {
                CodecId::H264 => {
                    let track = Arc::new(Track::video(codec, 0, 0, 0.0));
                    let depack = H264Depacketizer::new(track.clone(), &sdp.fmtp);
                    tracks.push((TrackType::Video, track, Box::new(depack)));
                }
                CodecId::Aac | CodecId::G711A | CodecId::G711U | CodecId::Opus => {
                    let track =
                        Arc::new(Track::audio(codec, sdp.sample_rate, sdp.channels, 16).ready());
                    let depack = AudioDepacketizer::new(codec, &sdp.fmtp);
                    tracks.push((TrackType::Audio, track, Box::new(depack)));
                }
                other => {
                    tracing::warn!(codec = other.name(), encoding = %sdp.encoding, "no depacketizer for codec");
                }
            }
        }
        Self { tracks }
    }

    pub fn tracks(&self) -> Vec<Arc<Track>> {
        self.tracks.iter().map(|(_, t, _)| t.clone()).collect()
    }

    /// Feed one packet, returning the frames it completed.
    pub fn input_rtp(&mut self, packet: &RtpPacket) -> Vec<Frame> {
        let mut out = Vec::new();
        if let Some((_, _, depack)) = self
            .tracks
            .iter_mut()
            .find(|(kind, _, _)| *kind == packet.track_type)
        {
            depack.input(packet, &mut out);
        }
        out
    }
}

struct H264Depacketizer {
    track: Arc<Track>,
    au: BytesMut,
    fu_active: bool,
    stamp: Option<u32>,
    dts: u64,
    key: bool,
    has_slice: bool,
    sps: bool,
    pps: bool,
}

impl H264Depacketizer {
    fn new(track: Arc<Track>, fmtp: &str) -> Self {
        let mut depack = Self {
            track,
            au: BytesMut::new(),
            fu_active: false,
            stamp: None,
            dts: 0,
            key: false,
            has_slice: false,
            sps: false,
            pps: false,
        };
        // sprop-parameter-sets=<b64 sps>,<b64 pps>
        let sprop = fmtp
            .split(';')
            .filter_map(|kv| kv.trim().split_once('='))
            .find(|(k, _)| k.eq_ignore_ascii_case("sprop-parameter-sets"))
            .map(|(_, v)| v);
        if let Some(sprop) = sprop {
            for set in sprop.split(',') {
                if let Ok(nal) = BASE64_STANDARD.decode(set.trim()) {
                    depack.note_nal(&nal);
                }
            }
        }
        depack
    }

    fn note_nal(&mut self, nal: &[u8]) {
        match nal.first().map(|b| b & 0x1f) {
            Some(5) => {
                self.key = true;
                self.has_slice = true;
            }
            Some(1..=4) => self.has_slice = true,
            Some(7) => self.sps = true,
            Some(8) => self.pps = true,
            _ => {}
        }
        if self.sps && self.pps && !self.track.is_ready() {
            tracing::debug!("H.264 parameter sets complete, track ready");
            self.track.set_ready();
        }
    }

    fn push_nal(&mut self, nal: &[u8]) {
        if nal.is_empty() {
            return;
        }
        self.note_nal(nal);
        self.au.put_slice(&START_CODE);
        self.au.put_slice(nal);
    }

    fn flush(&mut self, out: &mut Vec<Frame>) {
        if !self.au.is_empty() {
            let mut frame = Frame::new(CodecId::H264, self.dts, self.dts, self.au.split().freeze());
            if self.key {
                frame = frame.key();
            }
            if !self.has_slice {
                frame = frame.config();
            }
            out.push(frame);
        }
        self.key = false;
        self.has_slice = false;
        self.fu_active = false;
    }
}

impl Depacketizer for H264Depacketizer {
    fn input(&mut self, packet: &RtpPacket, out: &mut Vec<Frame>) {
        let ts = packet.timestamp();
        if self.stamp.is_some_and(|s| s != ts) {
            self.flush(out);
        }
        self.stamp = Some(ts);
        self.dts = packet.stamp_ms();

        let payload = packet.payload();
        let Some(&indicator) = payload.first() else {
            return;
        };
        match indicator & 0x1f {
            1..=23 => self.push_nal(payload),
            24 => {
                let mut rest = &payload[1..];
                while rest.len() > 2 {
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    if rest.len() < 2 + size {
                        break;
                    }
                    self.push_nal(&rest[2..2 + size]);
                    rest = &rest[2 + size..];
                }
            }
            28 if payload.len() > 2 => {
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                if start {
                    let nal_header = (indicator & 0xe0) | (fu_header & 0x1f);
                    self.note_nal(&[nal_header]);
                    self.au.put_slice(&START_CODE);
                    self.au.put_u8(nal_header);
                    self.fu_active = true;
                } else if !self.fu_active {
                    tracing::trace!(seq = packet.seq(), "FU-A fragment without start, dropped");
                    return;
                }
                self.au.put_slice(&payload[2..]);
                if end {
                    self.fu_active = false;
                }
            }
            other => tracing::trace!(nal_type = other, "unsupported H.264 packetization"),
        }

        if packet.marker() {
            self.flush(out);
            self.stamp = None;
        }
    }
}

struct AudioDepacketizer {
    codec: CodecId,
    /// AudioSpecificConfig from `config=`, used to rebuild ADTS headers.
    asc: Option<[u8; 2]>,
}

impl AudioDepacketizer {
    fn new(codec: CodecId, fmtp: &str) -> Self {
        let asc = fmtp
            .split(';')
            .filter_map(|kv| kv.trim().split_once('='))
            .find(|(k, _)| k.eq_ignore_ascii_case("config"))
            .and_then(|(_, v)| {
                let hi = u8::from_str_radix(v.get(0..2)?, 16).ok()?;
                let lo = u8::from_str_radix(v.get(2..4)?, 16).ok()?;
                Some([hi, lo])
            });
        Self { codec, asc }
    }

    fn adts_header(&self, payload_len: usize) -> Option<[u8; 7]> {
        let asc = self.asc?;
        let object_type = asc[0] >> 3;
        let freq_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
        let channels = (asc[1] >> 3) & 0x0f;
        let len = payload_len + 7;
        Some([
            0xff,
            0xf1,
            ((object_type.saturating_sub(1) & 0x03) << 6) | (freq_index << 2) | (channels >> 2),
            ((channels & 0x03) << 6) | ((len >> 11) as u8 & 0x03),
            (len >> 3) as u8,
            (((len & 0x07) as u8) << 5) | 0x1f,
            0xfc,
        ])
    }
}

impl Depacketizer for AudioDepacketizer {
    fn input(&mut self, packet: &RtpPacket, out: &mut Vec<Frame>) {
        let payload = packet.payload();
        let dts = packet.stamp_ms();
        if self.codec != CodecId::Aac {
            if !payload.is_empty() {
                out.push(Frame::new(self.codec, dts, dts, payload.to_vec()));
            }
            return;
        }

        if payload.len() < 2 {
            return;
        }
        let headers_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let headers_len = headers_bits.div_ceil(8);
        if payload.len() < 2 + headers_len {
            return;
        }
        let headers = &payload[2..2 + headers_len];
        let mut data = &payload[2 + headers_len..];
        for h in headers.chunks_exact(2) {
            let size = (u16::from_be_bytes([h[0], h[1]]) >> 3) as usize;
            if data.len() < size {
                break;
            }
            let mut au = BytesMut::with_capacity(size + 7);
            if let Some(adts) = self.adts_header(size) {
                au.put_slice(&adts);
            }
            au.put_slice(&data[..size]);
            out.push(Frame::new(CodecId::Aac, dts, dts, au.freeze()));
            data = &data[size..];
        }
    }
}
