//! Per-track RTCP bookkeeping.
//!
//! A [`RtcpContext`] in send mode counts what we emit and produces Sender
//! Reports; in receive mode it follows RFC 3550 Appendix A.1/A.8 (sequence
//! cycles, loss, interarrival jitter) and produces Receiver Reports. Both
//! modes track the NTP correlation carried by the peer's Sender Reports.
//!
//! Pure computation: callers pass in arrival and wall-clock times.

use super::rtcp::{ReceiverReport, ReportBlock, RtcpPacket, SenderReport, unix_ms_to_ntp};
use super::rtp::RtpPacket;

/// Minimum spacing between two reports for the same track.
pub const REPORT_INTERVAL_MS: u64 = 5000;

/// Wall clock in Unix milliseconds.
pub fn unix_now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpMode {
    /// We send RTP on this track (player side).
    Send,
    /// We receive RTP on this track (publisher side).
    Receive,
}

#[derive(Debug)]
pub struct RtcpContext {
    mode: RtcpMode,

    packets: u64,
    bytes: u64,
    last_rtp_timestamp: u32,
    last_ntp_ms: u64,

    // receive-side sequence state
    started: bool,
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    expected_prior: u64,
    received_prior: u64,
    last_transit: Option<i64>,
    jitter: f64,

    // correlation from the peer's last SR
    last_sr_compact: u32,
    last_sr_arrival_ms: u64,
    sr_ntp_ms: u64,
    sr_rtp_timestamp: u32,
    sample_rate: u32,

    last_report_ms: Option<u64>,
}

impl RtcpContext {
    pub fn new(mode: RtcpMode) -> Self {
        Self {
            mode,
            packets: 0,
            bytes: 0,
            last_rtp_timestamp: 0,
            last_ntp_ms: 0,
            started: false,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            expected_prior: 0,
            received_prior: 0,
            last_transit: None,
            jitter: 0.0,
            last_sr_compact: 0,
            last_sr_arrival_ms: 0,
            sr_ntp_ms: 0,
            sr_rtp_timestamp: 0,
            sample_rate: 0,
            last_report_ms: None,
        }
    }

    pub fn for_send() -> Self {
        Self::new(RtcpMode::Send)
    }

    pub fn for_receive() -> Self {
        Self::new(RtcpMode::Receive)
    }

    pub fn mode(&self) -> RtcpMode {
        self.mode
    }

    /// Account for one RTP packet sent or received at `arrival_ms`.
    pub fn on_rtp(&mut self, packet: &RtpPacket, arrival_ms: u64) {
        self.packets += 1;
        self.bytes += packet.payload().len() as u64;
        if packet.sample_rate != 0 {
            self.sample_rate = packet.sample_rate;
        }

        match self.mode {
            RtcpMode::Send => {
                self.last_rtp_timestamp = packet.timestamp();
                self.last_ntp_ms = if packet.ntp_stamp != 0 {
                    packet.ntp_stamp
                } else {
                    arrival_ms
                };
            }
            RtcpMode::Receive => self.update_receive(packet, arrival_ms),
        }
    }

    fn update_receive(&mut self, packet: &RtpPacket, arrival_ms: u64) {
        let seq = packet.seq();
        if !self.started {
            self.started = true;
            self.base_seq = seq;
            self.max_seq = seq;
            self.last_rtp_timestamp = packet.timestamp();
        } else {
            let delta = seq.wrapping_sub(self.max_seq);
            if delta != 0 && delta < 0x8000 {
                if seq < self.max_seq {
                    self.cycles += 1 << 16;
                }
                self.max_seq = seq;
                self.last_rtp_timestamp = packet.timestamp();
            } else {
                tracing::trace!(seq, max_seq = self.max_seq, "out-of-order or duplicate rtp");
            }
        }

        if self.sample_rate != 0 {
            let arrival = (arrival_ms as i64) * self.sample_rate as i64 / 1000;
            let transit = arrival - packet.timestamp() as i64;
            if let Some(last) = self.last_transit {
                let d = (transit - last).abs() as f64;
                self.jitter += (d - self.jitter) / 16.0;
            }
            self.last_transit = Some(transit);
        }
    }

    /// Consume an RTCP packet from the peer.
    pub fn on_rtcp(&mut self, packet: &RtcpPacket, arrival_ms: u64) {
        if let RtcpPacket::SenderReport(sr) = packet {
            self.last_sr_compact = sr.compact_ntp();
            self.last_sr_arrival_ms = arrival_ms;
            self.sr_ntp_ms = sr.ntp_unix_ms();
            self.sr_rtp_timestamp = sr.rtp_timestamp;
        }
    }

    /// Wall-clock time for an RTP timestamp, once a Sender Report has been seen.
    pub fn ntp_stamp_for(&self, rtp_timestamp: u32) -> Option<u64> {
        if self.sr_ntp_ms == 0 || self.sample_rate == 0 {
            return None;
        }
        let diff = rtp_timestamp.wrapping_sub(self.sr_rtp_timestamp) as i32 as i64;
        let diff_ms = diff * 1000 / self.sample_rate as i64;
        Some((self.sr_ntp_ms as i64 + diff_ms).max(0) as u64)
    }

    /// Extended highest sequence number received.
    pub fn extended_max_seq(&self) -> u32 {
        self.cycles + self.max_seq as u32
    }

    pub fn expected_packets(&self) -> u64 {
        if !self.started {
            return 0;
        }
        (self.extended_max_seq() as u64 + 1).saturating_sub(self.base_seq as u64)
    }

    /// Cumulative loss; negative when duplicates outnumber gaps.
    pub fn lost_packets(&self) -> i64 {
        self.expected_packets() as i64 - self.packets as i64
    }

    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether a report is due at `now_ms`; marks it sent when true.
    ///
    /// With `first_immediate` the first call is always due; otherwise the
    /// first report waits a full interval.
    pub fn report_due(&mut self, now_ms: u64, first_immediate: bool) -> bool {
        let due = match self.last_report_ms {
            None if first_immediate => true,
            None => {
                self.last_report_ms = Some(now_ms);
                false
            }
            Some(last) => now_ms.saturating_sub(last) >= REPORT_INTERVAL_MS,
        };
        if due {
            self.last_report_ms = Some(now_ms);
        }
        due
    }

    /// Sender Report describing what we sent.
    pub fn create_sr(&self, ssrc: u32, now_ms: u64) -> SenderReport {
        let ntp_ms = if self.last_ntp_ms != 0 {
            self.last_ntp_ms
        } else {
            now_ms
        };
        let (ntp_msw, ntp_lsw) = unix_ms_to_ntp(ntp_ms);
        SenderReport {
            ssrc,
            ntp_msw,
            ntp_lsw,
            rtp_timestamp: self.last_rtp_timestamp,
            packet_count: self.packets as u32,
            octet_count: self.bytes as u32,
            reports: Vec::new(),
        }
    }

    /// Receiver Report about `source_ssrc`, sent as `ssrc`.
    ///
    /// Advances the interval counters used for `fraction_lost`.
    pub fn create_rr(&mut self, ssrc: u32, source_ssrc: u32, now_ms: u64) -> ReceiverReport {
        let expected = self.expected_packets();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.packets.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.packets;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        let delay_since_last_sr = if self.last_sr_arrival_ms == 0 {
            0
        } else {
            (now_ms.saturating_sub(self.last_sr_arrival_ms) * 65536 / 1000) as u32
        };

        ReceiverReport {
            ssrc,
            reports: vec![ReportBlock {
                ssrc: source_ssrc,
                fraction_lost,
                cumulative_lost: self.lost_packets().clamp(-0x80_0000, 0x7f_ffff) as i32,
                highest_seq: self.extended_max_seq(),
                jitter: self.jitter(),
                last_sr: self.last_sr_compact,
                delay_since_last_sr,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpHeader;
    use crate::media::track::TrackType;

    fn packet(seq: u16, ts: u32) -> RtpPacket {
        let mut h = RtpHeader::new(96, 42);
        let mut hdr = h.write(false, ts);
        hdr[2..4].copy_from_slice(&seq.to_be_bytes());
        RtpPacket::from_parts(hdr, &[0u8; 100], TrackType::Video, 90_000)
    }

    #[test]
    fn counts_loss_across_a_gap() {
        let mut ctx = RtcpContext::for_receive();
        for seq in [10u16, 11, 12, 15] {
            ctx.on_rtp(&packet(seq, seq as u32 * 3000), 0);
        }
        assert_eq!(ctx.expected_packets(), 6);
        assert_eq!(ctx.lost_packets(), 2);
        let rr = ctx.create_rr(1, 42, 0);
        assert_eq!(rr.reports[0].highest_seq, 15);
        assert_eq!(rr.reports[0].cumulative_lost, 2);
        assert_eq!(rr.reports[0].fraction_lost, 85);
    }

    #[test]
    fn sequence_wrap_adds_a_cycle() {
        let mut ctx = RtcpContext::for_receive();
        ctx.on_rtp(&packet(65_534, 0), 0);
        ctx.on_rtp(&packet(65_535, 0), 0);
        ctx.on_rtp(&packet(0, 0), 0);
        ctx.on_rtp(&packet(1, 0), 0);
        assert_eq!(ctx.extended_max_seq(), 65_537);
        assert_eq!(ctx.lost_packets(), 0);
    }

    #[test]
    fn late_packet_does_not_roll_back_baseline() {
        let mut ctx = RtcpContext::for_receive();
        ctx.on_rtp(&packet(100, 9000), 0);
        ctx.on_rtp(&packet(102, 9600), 0);
        ctx.on_rtp(&packet(101, 9300), 0);
        assert_eq!(ctx.extended_max_seq(), 102);
        assert_eq!(ctx.packets(), 3);
        assert_eq!(ctx.lost_packets(), 0);
        assert_eq!(ctx.last_rtp_timestamp, 9600);
    }

    #[test]
    fn jitter_is_zero_for_a_steady_clock() {
        let mut ctx = RtcpContext::for_receive();
        for i in 0..10u16 {
            ctx.on_rtp(&packet(i, i as u32 * 3600), i as u64 * 40);
        }
        assert_eq!(ctx.jitter(), 0);
    }

    #[test]
    fn sender_report_reflects_sent_traffic() {
        let mut ctx = RtcpContext::for_send();
        ctx.on_rtp(&packet(1, 1234), 1_700_000_000_000);
        ctx.on_rtp(&packet(2, 5678), 1_700_000_000_040);
        let sr = ctx.create_sr(42, 0);
        assert_eq!(sr.packet_count, 2);
        assert_eq!(sr.octet_count, 200);
        assert_eq!(sr.rtp_timestamp, 5678);
        assert_eq!(sr.ntp_unix_ms(), 1_700_000_000_040);
    }

    #[test]
    fn sender_report_gives_ntp_correlation() {
        let mut ctx = RtcpContext::for_receive();
        ctx.on_rtp(&packet(1, 90_000), 0);
        let (msw, lsw) = unix_ms_to_ntp(5_000_000);
        let sr = SenderReport {
            ssrc: 42,
            ntp_msw: msw,
            ntp_lsw: lsw,
            rtp_timestamp: 90_000,
            packet_count: 1,
            octet_count: 100,
            reports: vec![],
        };
        assert_eq!(ctx.ntp_stamp_for(90_000), None);
        ctx.on_rtcp(&RtcpPacket::SenderReport(sr.clone()), 10_000);
        assert_eq!(ctx.ntp_stamp_for(180_000), Some(5_001_000));

        let rr = ctx.create_rr(43, 42, 11_000);
        assert_eq!(rr.reports[0].last_sr, sr.compact_ntp());
        assert_eq!(rr.reports[0].delay_since_last_sr, 65_536);
    }

    #[test]
    fn report_cadence() {
        let mut player = RtcpContext::for_send();
        assert!(player.report_due(0, true));
        assert!(!player.report_due(4_999, true));
        assert!(player.report_due(5_000, true));

        let mut pusher = RtcpContext::for_receive();
        assert!(!pusher.report_due(0, false));
        assert!(pusher.report_due(5_000, false));
    }
}
