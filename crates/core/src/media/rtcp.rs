//! RTCP packet codec (RFC 3550 §6).
//!
//! Covers what the session layer emits and consumes: Sender Reports,
//! Receiver Reports and SDES CNAME chunks. BYE and unknown packet types are
//! recognised so compound packets can be walked, but not interpreted.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|    RC   |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;

const SDES_CNAME: u8 = 1;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Convert Unix milliseconds to a 64-bit NTP timestamp `(msw, lsw)`.
pub fn unix_ms_to_ntp(unix_ms: u64) -> (u32, u32) {
    let secs = unix_ms / 1000 + NTP_UNIX_OFFSET_SECS;
    let frac = ((unix_ms % 1000) << 32) / 1000;
    (secs as u32, frac as u32)
}

/// Convert a 64-bit NTP timestamp to Unix milliseconds.
pub fn ntp_to_unix_ms(msw: u32, lsw: u32) -> u64 {
    let secs = (msw as u64).saturating_sub(NTP_UNIX_OFFSET_SECS);
    secs * 1000 + ((lsw as u64 * 1000 + (1 << 31)) >> 32)
}

/// One reception report block (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit signed cumulative loss.
    pub cumulative_lost: i32,
    pub highest_seq: u32,
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp.
    pub last_sr: u32,
    /// Delay since that SR in 1/65536 s.
    pub delay_since_last_sr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_msw: u32,
    pub ntp_lsw: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    /// NTP time of this report in Unix milliseconds.
    pub fn ntp_unix_ms(&self) -> u64 {
        ntp_to_unix_ms(self.ntp_msw, self.ntp_lsw)
    }

    /// Middle 32 bits of the NTP timestamp, echoed as LSR by receivers.
    pub fn compact_ntp(&self) -> u32 {
        (self.ntp_msw << 16) | (self.ntp_lsw >> 16)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(28 + 24 * self.reports.len());
        put_header(&mut buf, self.reports.len() as u8, PT_SR, 6 + 6 * self.reports.len());
        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_msw);
        buf.put_u32(self.ntp_lsw);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        for block in &self.reports {
            put_block(&mut buf, block);
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 24 * self.reports.len());
        put_header(&mut buf, self.reports.len() as u8, PT_RR, 1 + 6 * self.reports.len());
        buf.put_u32(self.ssrc);
        for block in &self.reports {
            put_block(&mut buf, block);
        }
        buf.freeze()
    }
}

/// SDES packet with a single CNAME chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdes {
    pub ssrc: u32,
    pub cname: String,
}

impl Sdes {
    pub fn cname(ssrc: u32, cname: &str) -> Self {
        Self {
            ssrc,
            cname: cname.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let text = &self.cname.as_bytes()[..self.cname.len().min(255)];
        // ssrc + type + len + text + terminating null, padded to 32 bits
        let chunk_len = 4 + 2 + text.len() + 1;
        let padded = chunk_len.div_ceil(4) * 4;
        let mut buf = BytesMut::with_capacity(4 + padded);
        put_header(&mut buf, 1, PT_SDES, padded / 4);
        buf.put_u32(self.ssrc);
        buf.put_u8(SDES_CNAME);
        buf.put_u8(text.len() as u8);
        buf.put_slice(text);
        buf.put_bytes(0, padded - chunk_len + 1);
        buf.freeze()
    }
}

/// A decoded RTCP packet from a compound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Sdes(Vec<Sdes>),
    Bye(Vec<u32>),
    Other { packet_type: u8 },
}

/// Split a compound RTCP datagram into its packets.
///
/// Parsing stops at the first malformed packet; everything decoded so far
/// is returned.
pub fn parse_compound(mut data: &[u8]) -> Vec<RtcpPacket> {
    let mut out = Vec::new();
    while data.len() >= 4 {
        if data[0] >> 6 != 2 {
            tracing::trace!("rtcp version mismatch, dropping rest of compound");
            break;
        }
        let count = (data[0] & 0x1f) as usize;
        let packet_type = data[1];
        let len = (u16::from_be_bytes([data[2], data[3]]) as usize + 1) * 4;
        if len > data.len() {
            tracing::trace!(len, available = data.len(), "truncated rtcp packet");
            break;
        }
        let body = &data[4..len];
        let parsed = match packet_type {
            PT_SR => parse_sr(body, count).map(RtcpPacket::SenderReport),
            PT_RR => parse_rr(body, count).map(RtcpPacket::ReceiverReport),
            PT_SDES => Some(RtcpPacket::Sdes(parse_sdes(body, count))),
            PT_BYE => Some(RtcpPacket::Bye(
                body.chunks_exact(4)
                    .take(count)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )),
            other => Some(RtcpPacket::Other { packet_type: other }),
        };
        match parsed {
            Some(p) => out.push(p),
            None => break,
        }
        data = &data[len..];
    }
    out
}

fn put_header(buf: &mut BytesMut, count: u8, packet_type: u8, length_words: usize) {
    buf.put_u8((2 << 6) | (count & 0x1f));
    buf.put_u8(packet_type);
    buf.put_u16(length_words as u16);
}

fn put_block(buf: &mut BytesMut, block: &ReportBlock) {
    buf.put_u32(block.ssrc);
    let lost = (block.cumulative_lost.clamp(-0x80_0000, 0x7f_ffff) as u32) & 0x00ff_ffff;
    buf.put_u32(((block.fraction_lost as u32) << 24) | lost);
    buf.put_u32(block.highest_seq);
    buf.put_u32(block.jitter);
    buf.put_u32(block.last_sr);
    buf.put_u32(block.delay_since_last_sr);
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn parse_blocks(body: &[u8], count: usize) -> Option<Vec<ReportBlock>> {
    if body.len() < count * 24 {
        return None;
    }
    Some(
        (0..count)
            .map(|i| {
                let b = &body[i * 24..];
                let word = be32(b, 4);
                // sign-extend the 24-bit loss counter
                let cumulative_lost = ((word << 8) as i32) >> 8;
                ReportBlock {
                    ssrc: be32(b, 0),
                    fraction_lost: (word >> 24) as u8,
                    cumulative_lost,
                    highest_seq: be32(b, 8),
                    jitter: be32(b, 12),
                    last_sr: be32(b, 16),
                    delay_since_last_sr: be32(b, 20),
                }
            })
            .collect(),
    )
}

fn parse_sr(body: &[u8], count: usize) -> Option<SenderReport> {
    if body.len() < 24 {
        return None;
    }
    Some(SenderReport {
        ssrc: be32(body, 0),
        ntp_msw: be32(body, 4),
        ntp_lsw: be32(body, 8),
        rtp_timestamp: be32(body, 12),
        packet_count: be32(body, 16),
        octet_count: be32(body, 20),
        reports: parse_blocks(&body[24..], count)?,
    })
}

fn parse_rr(body: &[u8], count: usize) -> Option<ReceiverReport> {
    if body.len() < 4 {
        return None;
    }
    Some(ReceiverReport {
        ssrc: be32(body, 0),
        reports: parse_blocks(&body[4..], count)?,
    })
}

fn parse_sdes(mut body: &[u8], count: usize) -> Vec<Sdes> {
    let mut chunks = Vec::new();
    for _ in 0..count {
        if body.len() < 4 {
            break;
        }
        let ssrc = be32(body, 0);
        let mut pos = 4;
        let mut cname = String::new();
        while pos < body.len() && body[pos] != 0 {
            let Some(&len) = body.get(pos + 1) else {
                break;
            };
            let end = (pos + 2 + len as usize).min(body.len());
            if body[pos] == SDES_CNAME {
                cname = String::from_utf8_lossy(&body[pos + 2..end]).into_owned();
            }
            pos = end;
        }
        // skip the null terminator and padding to the next word
        let consumed = (pos + 1).div_ceil(4) * 4;
        chunks.push(Sdes { ssrc, cname });
        body = &body[consumed.min(body.len())..];
    }
    chunks
}
