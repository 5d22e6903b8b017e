use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, RtspError};

/// How often receiver threads wake up to check whether they were stopped.
const RECV_POLL: Duration = Duration::from_millis(200);

const MAX_DATAGRAM: usize = 2048;

/// Allocates server RTP/RTCP socket pairs from a configured port range.
///
/// RTP always gets the even port and RTCP the following odd one
/// (RFC 3550 §11). The cursor keeps moving so a port just released by one
/// session is not immediately handed to the next.
pub struct UdpPortAllocator {
    first: u16,
    last: u16,
    next: Mutex<u16>,
}

impl UdpPortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let first = range.start().saturating_add(range.start() % 2);
        Self {
            first,
            last: *range.end(),
            next: Mutex::new(first),
        }
    }

    fn candidates(&self) -> usize {
        if self.last <= self.first {
            return 0;
        }
        ((self.last - 1 - self.first) / 2 + 1) as usize
    }

    fn advance(&self) -> u16 {
        let mut next = self.next.lock();
        let port = *next;
        *next = if port as u32 + 2 >= self.last as u32 {
            self.first
        } else {
            port + 2
        };
        port
    }

    /// Bind an (RTP, RTCP) pair on `ip`, trying each even port once.
    pub fn bind_pair(&self, ip: IpAddr) -> Result<(UdpSocket, UdpSocket)> {
        for _ in 0..self.candidates() {
            let port = self.advance();
            let Ok(rtp) = UdpSocket::bind((ip, port)) else {
                continue;
            };
            let Ok(rtcp) = UdpSocket::bind((ip, port + 1)) else {
                continue;
            };
            tracing::trace!(%ip, rtp_port = port, rtcp_port = port + 1, "allocated udp pair");
            return Ok((rtp, rtcp));
        }
        tracing::warn!(%ip, first = self.first, last = self.last, "udp port range exhausted");
        Err(RtspError::PortRangeExhausted)
    }
}

/// Read datagrams on a background thread until `stop` is set or
/// `on_datagram` returns `false`.
pub fn spawn_receiver<F>(name: &str, socket: UdpSocket, stop: Arc<AtomicBool>, mut on_datagram: F) -> Result<()>
where
    F: FnMut(Bytes, SocketAddr) -> bool + Send + 'static,
{
    socket.set_read_timeout(Some(RECV_POLL))?;
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut buf = [0u8; MAX_DATAGRAM];
        while !stop.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if !on_datagram(Bytes::copy_from_slice(&buf[..n]), from) {
                        break;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "udp receiver stopped");
                    break;
                }
            }
        }
    })?;
    Ok(())
}

/// Server socket pair of one negotiated track, and where it sends.
pub struct UdpPair {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    peers: [SocketAddr; 2],
    rebound: [bool; 2],
    stop: Arc<AtomicBool>,
}

impl UdpPair {
    /// Pair sending to `peer_ip` at the client's announced ports.
    pub fn new(rtp: UdpSocket, rtcp: UdpSocket, peer_ip: IpAddr, client_port: (u16, u16)) -> Self {
        Self {
            rtp,
            rtcp,
            peers: [
                SocketAddr::new(peer_ip, client_port.0),
                SocketAddr::new(peer_ip, client_port.1),
            ],
            rebound: [false; 2],
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_ports(&self) -> (u16, u16) {
        let port = |s: &UdpSocket| s.local_addr().map(|a| a.port()).unwrap_or(0);
        (port(&self.rtp), port(&self.rtcp))
    }

    pub fn peer(&self, rtcp: bool) -> SocketAddr {
        self.peers[rtcp as usize]
    }

    /// Start receiving on both sockets. `on_datagram(rtcp, data, from)`.
    pub fn listen<F>(&self, label: &str, on_datagram: F) -> Result<()>
    where
        F: Fn(bool, Bytes, SocketAddr) -> bool + Send + Sync + 'static,
    {
        let on_datagram = Arc::new(on_datagram);
        for (rtcp, socket) in [(false, &self.rtp), (true, &self.rtcp)] {
            let cb = on_datagram.clone();
            spawn_receiver(
                &format!("{label}-{}", if rtcp { "rtcp" } else { "rtp" }),
                socket.try_clone()?,
                self.stop.clone(),
                move |data, from| cb(rtcp, data, from),
            )?;
        }
        Ok(())
    }

    /// NAT punch-through: the first datagram from the RTSP peer's IP on each
    /// socket fixes where that socket sends. Other IPs are refused.
    pub fn accept_from(&mut self, rtcp: bool, from: SocketAddr, peer_ip: IpAddr) -> bool {
        if from.ip() != peer_ip {
            tracing::warn!(%from, %peer_ip, rtcp, "udp datagram from unexpected address dropped");
            return false;
        }
        let i = rtcp as usize;
        if !self.rebound[i] {
            self.rebound[i] = true;
            if self.peers[i] != from {
                tracing::debug!(old = %self.peers[i], new = %from, rtcp, "udp peer rebound");
                self.peers[i] = from;
            }
        }
        true
    }

    pub fn send_rtp(&self, data: &[u8]) -> std::io::Result<usize> {
        self.rtp.send_to(data, self.peers[0])
    }

    pub fn send_rtcp(&self, data: &[u8]) -> std::io::Result<usize> {
        self.rtcp.send_to(data, self.peers[1])
    }
}

impl Drop for UdpPair {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
