//! Media model and RTP packetization.
//!
//! [`Track`] and [`Frame`] are what the fan-out engine moves around;
//! [`rtp::RtpPacket`] is what the broadcast ring and the sessions move
//! around. A [`Packetizer`] turns one into the other.
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | AAC, G.711, Opus | [`audio`] | RFC 3640, RFC 3551, RFC 7587 |

pub mod audio;
pub mod depacketize;
pub mod frame;
pub mod h264;
pub mod rtcp;
pub mod rtcp_context;
pub mod rtp;
pub mod stamp;
pub mod track;

pub use frame::Frame;
pub use track::{CodecId, Track, TrackInfo, TrackType};

use rand::RngExt;
use rtp::RtpPacket;

/// Codec-specific RTP packetizer.
///
/// The RTP fixed header is handled by [`rtp::RtpHeader`]; packetizers
/// compose it and derive the RTP timestamp from the frame's dts.
pub trait Packetizer: Send {
    /// Split one frame into RTP packets; the last packet carries the marker.
    fn packetize(&mut self, frame: &Frame) -> Vec<RtpPacket>;

    /// Encoding name for `a=rtpmap` (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    fn clock_rate(&self) -> u32;

    fn payload_type(&self) -> u8;

    fn ssrc(&self) -> u32;

    /// Media-level SDP attribute lines, `a=` prefix included, ending with
    /// `a=control:trackID=<track_index>`.
    fn sdp_attributes(&self, track_index: usize) -> Vec<String>;

    /// Sequence number the next packet will carry.
    fn next_sequence(&self) -> u16;

    /// RTP timestamp of the last packetized frame.
    fn last_rtp_timestamp(&self) -> u32;
}

/// Build the packetizer for a track, if this crate can packetize its codec.
pub fn packetizer_for(track: &Track, pt: u8) -> Option<Box<dyn Packetizer>> {
    packetizer_with_ssrc(track, pt, rand::rng().random())
}

/// [`packetizer_for`] with a caller-chosen SSRC.
pub fn packetizer_with_ssrc(track: &Track, pt: u8, ssrc: u32) -> Option<Box<dyn Packetizer>> {
    match track.codec() {
        CodecId::H264 => Some(Box::new(h264::H264Packetizer::new(pt, ssrc))),
        CodecId::Aac | CodecId::G711A | CodecId::G711U | CodecId::Opus => {
            let (channels, rate) = match track.info() {
                TrackInfo::Audio {
                    channels,
                    sample_rate,
                    ..
                } => (*channels, *sample_rate),
                _ => (1, track.clock_rate()),
            };
            Some(Box::new(audio::AudioPacketizer::new(
                track.codec(),
                pt,
                ssrc,
                rate,
                channels,
            )))
        }
        _ => None,
    }
}

/// Payload type a track is announced with: static for G.711, else dynamic.
pub fn payload_type_for(track: &Track) -> u8 {
    match track.codec() {
        CodecId::G711U => 0,
        CodecId::G711A => 8,
        _ => 96 + track.track_type().index() as u8,
    }
}

/// Convert a millisecond stamp into RTP clock ticks.
pub(crate) fn ms_to_rtp(ms: u64, clock_rate: u32) -> u32 {
    (ms * clock_rate as u64 / 1000) as u32
}
