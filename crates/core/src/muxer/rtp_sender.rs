use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::media::{Frame, Packetizer, Track, TrackType, packetizer_with_ssrc, payload_type_for};

use super::MediaSink;

/// RTP re-sender: packetizes the stream and pushes it over UDP to a fixed
/// destination under a caller-chosen SSRC.
pub struct RtpSender {
    ssrc: u32,
    dst: SocketAddr,
    socket: UdpSocket,
    packetizers: Mutex<Vec<(TrackType, Box<dyn Packetizer>)>>,
}

impl RtpSender {
    /// Bind the local socket; `src_port` 0 picks an ephemeral port.
    pub fn bind(ssrc: u32, dst: SocketAddr, src_port: u16) -> Result<Self> {
        let local: SocketAddr = if dst.is_ipv4() {
            ([0, 0, 0, 0], src_port).into()
        } else {
            ([0u16; 8], src_port).into()
        };
        let socket = UdpSocket::bind(local)?;
        Ok(Self {
            ssrc,
            dst,
            socket,
            packetizers: Mutex::new(Vec::new()),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

impl MediaSink for RtpSender {
    fn name(&self) -> &str {
        "rtp_sender"
    }

    fn add_track(&self, track: &Arc<Track>) -> bool {
        match packetizer_with_ssrc(track, payload_type_for(track), self.ssrc) {
            Some(p) => {
                self.packetizers.lock().push((track.track_type(), p));
                true
            }
            None => false,
        }
    }

    fn input_frame(&self, frame: &Frame) -> bool {
        let packets = {
            let mut packetizers = self.packetizers.lock();
            let kind = frame.track_type();
            match packetizers.iter_mut().find(|(t, _)| *t == kind) {
                Some((_, p)) => p.packetize(frame),
                None => return false,
            }
        };
        for packet in &packets {
            if let Err(e) = self.socket.send_to(packet.as_bytes(), self.dst) {
                tracing::warn!(ssrc = self.ssrc, dst = %self.dst, error = %e, "rtp send failed");
                return false;
            }
        }
        true
    }

    fn reset_tracks(&self) {
        self.packetizers.lock().clear();
    }

    /// A re-sender counts as one reader.
    fn reader_count(&self) -> usize {
        1
    }
}
