use bytes::{BufMut, Bytes, BytesMut};

use super::track::TrackType;

/// Size of the fixed RTP header (RFC 3550 §5.1).
pub const RTP_HEADER_SIZE: usize = 12;

/// Size of the `$`-framing prefix for RTP over RTSP/TCP (RFC 2326 §10.12).
pub const RTP_TCP_PREFIX_SIZE: usize = 4;

/// Builds the 4-byte interleaved prefix: `$`, channel, big-endian length.
pub fn interleaved_prefix(len: usize, channel: u8) -> [u8; RTP_TCP_PREFIX_SIZE] {
    let len = len as u16;
    [b'$', channel, (len >> 8) as u8, len as u8]
}

/// RTP fixed header writer (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Shared by the packetizers. Holds the running sequence number; the
/// timestamp is supplied per packet from the frame clock.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
        }
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Serialize a 12-byte header and advance the sequence number.
    pub fn write(&mut self, marker: bool, timestamp: u32) -> [u8; RTP_HEADER_SIZE] {
        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// An immutable RTP packet as stored in the broadcast ring.
///
/// `data` holds the raw packet (header + payload, no TCP prefix). Header
/// fields are decoded once at construction. Rewriting fields goes through
/// the `with_*` constructors, which copy.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    data: Bytes,
    pub track_type: TrackType,
    pub sample_rate: u32,
    /// Wall-clock NTP time in ms this packet corresponds to, 0 if unknown.
    pub ntp_stamp: u64,
}

impl RtpPacket {
    /// Validate and wrap a raw RTP packet.
    ///
    /// Returns `None` for short packets or a version other than 2.
    pub fn parse(data: Bytes, track_type: TrackType, sample_rate: u32) -> Option<Self> {
        if data.len() < RTP_HEADER_SIZE || data[0] >> 6 != 2 {
            return None;
        }
        let csrc = (data[0] & 0x0f) as usize;
        if data.len() < RTP_HEADER_SIZE + csrc * 4 {
            return None;
        }
        Some(Self {
            data,
            track_type,
            sample_rate,
            ntp_stamp: 0,
        })
    }

    /// Assemble a packet from a freshly written header and payload.
    pub fn from_parts(
        header: [u8; RTP_HEADER_SIZE],
        payload: &[u8],
        track_type: TrackType,
        sample_rate: u32,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        buf.put_slice(&header);
        buf.put_slice(payload);
        Self {
            data: buf.freeze(),
            track_type,
            sample_rate,
            ntp_stamp: 0,
        }
    }

    pub fn marker(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0x7f
    }

    pub fn seq(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// Timestamp converted to milliseconds using the track clock.
    pub fn stamp_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.timestamp() as u64 * 1000 / self.sample_rate as u64
    }

    /// Payload after the fixed header and CSRC list.
    pub fn payload(&self) -> &[u8] {
        let csrc = (self.data[0] & 0x0f) as usize;
        &self.data[RTP_HEADER_SIZE + csrc * 4..]
    }

    /// Raw packet bytes (no interleaved prefix).
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy with a different timestamp.
    pub fn with_timestamp(&self, timestamp: u32) -> Self {
        let mut buf = BytesMut::from(&self.data[..]);
        buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
        Self {
            data: buf.freeze(),
            ..self.clone()
        }
    }

    /// Copy with a different SSRC.
    pub fn with_ssrc(&self, ssrc: u32) -> Self {
        let mut buf = BytesMut::from(&self.data[..]);
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        Self {
            data: buf.freeze(),
            ..self.clone()
        }
    }

    /// Whether this packet starts an H.264 IDR or carries SPS.
    ///
    /// Looks at single NAL units, STAP-A aggregates and FU-A start fragments.
    pub fn is_h264_key(&self) -> bool {
        let payload = self.payload();
        let Some(&first) = payload.first() else {
            return false;
        };
        match first & 0x1f {
            5 | 7 => true,
            24 => payload.get(3).is_some_and(|b| matches!(b & 0x1f, 5 | 7)),
            28 => payload
                .get(1)
                .is_some_and(|fu| fu & 0x80 != 0 && matches!(fu & 0x1f, 5 | 7)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD)
    }

    #[test]
    fn version_is_2() {
        let mut h = make_header();
        let buf = h.write(false, 0);
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        assert_eq!(h.write(false, 0)[1] & 0x80, 0);
        assert_eq!(h.write(true, 0)[1] & 0x80, 0x80);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = make_header();
        h.sequence = u16::MAX;
        let buf = h.write(false, 0);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn packet_fields_round_trip_header() {
        let mut h = make_header();
        let hdr = h.write(true, 90_000);
        let pkt = RtpPacket::from_parts(hdr, &[0x65, 1, 2], TrackType::Video, 90_000);
        assert_eq!(pkt.seq(), 0);
        assert_eq!(pkt.timestamp(), 90_000);
        assert_eq!(pkt.ssrc(), 0xAABBCCDD);
        assert_eq!(pkt.payload_type(), 96);
        assert!(pkt.marker());
        assert_eq!(pkt.payload(), &[0x65, 1, 2]);
        assert_eq!(pkt.stamp_ms(), 1000);
        assert!(pkt.is_h264_key());
    }

    #[test]
    fn rewrite_copies() {
        let mut h = make_header();
        let pkt = RtpPacket::from_parts(h.write(false, 10), &[1], TrackType::Audio, 8000);
        let moved = pkt.with_timestamp(20);
        assert_eq!(pkt.timestamp(), 10);
        assert_eq!(moved.timestamp(), 20);
        assert_eq!(moved.payload(), pkt.payload());
    }

    #[test]
    fn rejects_short_or_wrong_version() {
        assert!(RtpPacket::parse(Bytes::from_static(&[0x80, 0, 0]), TrackType::Video, 90000).is_none());
        let mut raw = [0u8; 12];
        raw[0] = 0x40;
        assert!(RtpPacket::parse(Bytes::copy_from_slice(&raw), TrackType::Video, 90000).is_none());
    }

    #[test]
    fn interleaved_prefix_layout() {
        assert_eq!(interleaved_prefix(0x0102, 3), [b'$', 3, 1, 2]);
    }
}
