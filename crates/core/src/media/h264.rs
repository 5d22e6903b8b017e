use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::frame::Frame;
use super::rtp::{RtpHeader, RtpPacket};
use super::track::TrackType;
use super::{Packetizer, ms_to_rtp};

const DEFAULT_MTU: usize = 1400;
const CLOCK_RATE: u32 = 90_000;

/// H.264 RTP packetizer (RFC 6184).
///
/// Frames arrive as Annex B access units. Each NAL unit goes out either as
/// a Single NAL Unit packet (§5.6) or, when larger than the MTU, as a run of
/// FU-A fragments (§5.8):
///
/// ```text
/// FU indicator:  [F|NRI|Type=28]
/// FU header:     [S|E|R|NAL_Type]
/// ```
///
/// The RTP timestamp is the frame's pts on the 90 kHz clock. The marker
/// bit closes the access unit. SPS/PPS seen in the stream are kept for
/// `sprop-parameter-sets` in the SDP.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    last_timestamp: u32,
}

impl H264Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            mtu: DEFAULT_MTU,
            sps: None,
            pps: None,
            last_timestamp: 0,
        }
    }

    /// profile_idc, constraint flags, level_idc from SPS bytes 1..4.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref().filter(|s| s.len() >= 4)?;
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool, timestamp: u32) -> Vec<RtpPacket> {
        let mut packets = Vec::new();
        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal, timestamp);
            packets.push(RtpPacket::from_parts(hdr, nal_unit, TrackType::Video, CLOCK_RATE));
            return packets;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        let fu_indicator = (nal_header & 0x60) | 28;
        let payload = &nal_unit[1..];
        let max_fragment = self.mtu - 2;

        let mut fragment = Vec::with_capacity(self.mtu);
        let mut chunks = payload.chunks(max_fragment).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last { 0x40 } else { 0x00 };

            fragment.clear();
            fragment.push(fu_indicator);
            fragment.push(start_bit | end_bit | nal_type);
            fragment.extend_from_slice(chunk);

            let hdr = self.header.write(is_last_nal && last, timestamp);
            packets.push(RtpPacket::from_parts(hdr, &fragment, TrackType::Video, CLOCK_RATE));
            first = false;
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );
        packets
    }

    /// Split an Annex B bitstream on `00 00 01` / `00 00 00 01` start codes.
    ///
    /// Data without any start code is treated as a single bare NAL unit.
    pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
        let mut starts: Vec<(usize, usize)> = Vec::new();
        let mut i = 0usize;
        while i + 2 < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                starts.push((i + 4, 4));
                i += 4;
            } else if data[i..i + 3] == [0, 0, 1] {
                starts.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }
        if starts.is_empty() {
            return if data.is_empty() { Vec::new() } else { vec![data] };
        }

        let mut nal_units = Vec::with_capacity(starts.len());
        for (idx, &(start, _)) in starts.iter().enumerate() {
            let end = match starts.get(idx + 1) {
                Some(&(next_start, sc_len)) => next_start - sc_len,
                None => data.len(),
            };
            if start < end {
                nal_units.push(&data[start..end]);
            }
        }
        nal_units
    }

    fn capture_parameter_sets(&mut self, nal_units: &[&[u8]]) {
        for nal in nal_units {
            match nal.first().map(|b| b & 0x1f) {
                Some(7) if self.sps.as_deref() != Some(*nal) => {
                    self.sps = Some(nal.to_vec());
                    tracing::debug!(bytes = nal.len(), "H.264 SPS captured");
                }
                Some(8) if self.pps.as_deref() != Some(*nal) => {
                    self.pps = Some(nal.to_vec());
                    tracing::debug!(bytes = nal.len(), "H.264 PPS captured");
                }
                _ => {}
            }
        }
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, frame: &Frame) -> Vec<RtpPacket> {
        let nal_units = Self::extract_nal_units(&frame.data);
        self.capture_parameter_sets(&nal_units);

        let timestamp = ms_to_rtp(frame.pts.max(frame.dts), CLOCK_RATE);
        self.last_timestamp = timestamp;

        let mut packets = Vec::new();
        let count = nal_units.len();
        for (i, nal) in nal_units.into_iter().enumerate() {
            packets.extend(self.packetize_nal(nal, i + 1 == count, timestamp));
        }

        tracing::trace!(
            nal_count = count,
            rtp_packets = packets.len(),
            frame_bytes = frame.data.len(),
            seq = self.header.sequence(),
            ts = timestamp,
            "frame packetized"
        );
        packets
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// `a=rtpmap` must precede the `a=fmtp` that references its payload type.
    fn sdp_attributes(&self, track_index: usize) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.header.pt);
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={pl}"));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={sprop}"));
        }

        vec![
            format!("a=rtpmap:{} H264/{}", self.header.pt, CLOCK_RATE),
            fmtp,
            format!("a=control:trackID={track_index}"),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn last_rtp_timestamp(&self) -> u32 {
        self.last_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RTP_HEADER_SIZE;
    use crate::media::track::CodecId;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(96, 0xAABBCCDD)
    }

    fn frame(dts: u64, data: &[u8]) -> Frame {
        Frame::new(CodecId::H264, dts, dts, data.to_vec())
    }

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..]]);
    }

    #[test]
    fn bare_nal_without_start_code() {
        assert_eq!(H264Packetizer::extract_nal_units(&[0x41, 0x01]).len(), 1);
        assert!(H264Packetizer::extract_nal_units(&[]).is_empty());
    }

    #[test]
    fn small_nal_single_packet() {
        let mut p = make_packetizer();
        let packets = p.packetize(&frame(0, &[0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0xCC]));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), RTP_HEADER_SIZE + 4);
        assert!(packets[0].marker());
        assert!(packets[0].is_h264_key());
    }

    #[test]
    fn large_nal_fragmented() {
        let mut p = make_packetizer();
        let mut data = vec![0, 0, 0, 1, 0x65];
        data.extend(vec![0xAA; DEFAULT_MTU + 500]);
        let packets = p.packetize(&frame(0, &data));
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0].payload()[0] & 0x1f, 28);
        assert_eq!(packets[0].payload()[1] & 0x80, 0x80);
        assert!(!packets[0].marker());
        assert!(packets[0].is_h264_key());

        let last = &packets[1];
        assert_eq!(last.payload()[1] & 0x40, 0x40);
        assert!(last.marker());
        assert_eq!(last.seq(), packets[0].seq().wrapping_add(1));
    }

    #[test]
    fn timestamp_follows_frame_clock() {
        let mut p = make_packetizer();
        p.packetize(&frame(0, &[0, 0, 1, 0x41, 1]));
        let packets = p.packetize(&frame(40, &[0, 0, 1, 0x41, 2]));
        assert_eq!(packets[0].timestamp(), 3600);
        assert_eq!(p.last_rtp_timestamp(), 3600);
        assert_eq!(p.next_sequence(), 2);
    }

    #[test]
    fn sdp_attributes_carry_parameter_sets_and_control() {
        let mut p = make_packetizer();
        let attrs = p.sdp_attributes(0);
        assert_eq!(attrs[0], "a=rtpmap:96 H264/90000");
        assert_eq!(attrs[1], "a=fmtp:96 packetization-mode=1");
        assert_eq!(attrs[2], "a=control:trackID=0");

        let au = [
            &[0u8, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e][..],
            &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80][..],
            &[0, 0, 0, 1, 0x65, 0x88, 0x00][..],
        ]
        .concat();
        p.packetize(&frame(0, &au));
        let attrs = p.sdp_attributes(1);
        assert!(attrs[1].contains("profile-level-id=42001e"), "{}", attrs[1]);
        assert!(attrs[1].contains("sprop-parameter-sets=Z0IAHg==,aM44gA=="), "{}", attrs[1]);
        assert_eq!(attrs[2], "a=control:trackID=1");
    }
}
