//! Audio RTP packetizers: AAC (RFC 3640 AAC-hbr), G.711 and Opus.
//!
//! Every audio frame becomes exactly one RTP packet with the marker set.
//! AAC frames may arrive with an ADTS header; it is stripped and its fields
//! are used to build the `config=` AudioSpecificConfig for the SDP.

use super::frame::Frame;
use super::rtp::{RtpHeader, RtpPacket};
use super::track::{CodecId, TrackType};
use super::{Packetizer, ms_to_rtp};

#[derive(Debug)]
pub struct AudioPacketizer {
    codec: CodecId,
    header: RtpHeader,
    clock_rate: u32,
    channels: u8,
    /// AudioSpecificConfig recovered from ADTS.
    aac_config: Option<[u8; 2]>,
    last_timestamp: u32,
}

impl AudioPacketizer {
    pub fn new(codec: CodecId, pt: u8, ssrc: u32, clock_rate: u32, channels: u8) -> Self {
        Self::from_header(codec, RtpHeader::new(pt, ssrc), clock_rate, channels)
    }

    fn from_header(codec: CodecId, header: RtpHeader, clock_rate: u32, channels: u8) -> Self {
        let clock_rate = match codec {
            CodecId::Opus => 48_000,
            CodecId::G711A | CodecId::G711U if clock_rate == 0 => 8000,
            _ => clock_rate.max(1),
        };
        Self {
            codec,
            header,
            clock_rate,
            channels: channels.max(1),
            aac_config: None,
            last_timestamp: 0,
        }
    }

    /// Strip an ADTS header, remembering the config it describes.
    fn strip_adts<'a>(&mut self, data: &'a [u8]) -> &'a [u8] {
        if data.len() < 7 || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return data;
        }
        let header_len = if data[1] & 0x01 == 0 { 9 } else { 7 };
        if data.len() < header_len {
            return data;
        }
        if self.aac_config.is_none() {
            let object_type = (data[2] >> 6) + 1;
            let freq_index = (data[2] >> 2) & 0x0F;
            let channel_config = ((data[2] & 0x01) << 2) | (data[3] >> 6);
            let asc: u16 = ((object_type as u16) << 11)
                | ((freq_index as u16) << 7)
                | ((channel_config as u16) << 3);
            self.aac_config = Some(asc.to_be_bytes());
            tracing::debug!(object_type, freq_index, channel_config, "AAC config captured from ADTS");
        }
        &data[header_len..]
    }
}

impl Packetizer for AudioPacketizer {
    fn packetize(&mut self, frame: &Frame) -> Vec<RtpPacket> {
        let timestamp = ms_to_rtp(frame.dts, self.clock_rate);
        self.last_timestamp = timestamp;

        let payload = match self.codec {
            CodecId::Aac => {
                let raw = self.strip_adts(&frame.data);
                // AU-headers-length (16 bits) then one 13/3 AU header
                let size = (raw.len() as u16) << 3;
                let mut buf = Vec::with_capacity(4 + raw.len());
                buf.extend_from_slice(&16u16.to_be_bytes());
                buf.extend_from_slice(&size.to_be_bytes());
                buf.extend_from_slice(raw);
                buf
            }
            _ => frame.data.to_vec(),
        };
        if payload.is_empty() {
            return Vec::new();
        }

        let hdr = self.header.write(true, timestamp);
        vec![RtpPacket::from_parts(hdr, &payload, TrackType::Audio, self.clock_rate)]
    }

    fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn sdp_attributes(&self, track_index: usize) -> Vec<String> {
        let pt = self.header.pt;
        let mut attrs = vec![format!(
            "a=rtpmap:{} {}/{}/{}",
            pt,
            self.codec_name(),
            self.clock_rate,
            self.channels
        )];
        if self.codec == CodecId::Aac {
            let mut fmtp = format!(
                "a=fmtp:{pt} streamtype=5;profile-level-id=1;mode=AAC-hbr;\
                 sizelength=13;indexlength=3;indexdeltalength=3"
            );
            if let Some(config) = self.aac_config {
                fmtp.push_str(&format!(";config={:02X}{:02X}", config[0], config[1]));
            }
            attrs.push(fmtp);
        }
        attrs.push(format!("a=control:trackID={track_index}"));
        attrs
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn last_rtp_timestamp(&self) -> u32 {
        self.last_timestamp
    }
}
