//! Live sources and the registry that addresses them.
//!
//! A [`MediaSource`] is one named RTSP-servable stream: its SDP, the
//! per-track RTP state players need for `RTP-Info`, and the broadcast ring
//! players attach to. Whoever produces the stream (a publishing session or
//! the fan-out engine's RTSP output) owns the `Arc`; the registry and the
//! players only hold weak references, so dropping the owner ends the
//! stream everywhere.

pub mod identity;
pub mod registry;
pub mod ring;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::media::TrackType;
use crate::media::rtp::RtpPacket;
use crate::protocol::sdp::{SdpTrack, parse_sdp};

pub use identity::{MediaInfo, StreamIdentity};
pub use registry::MediaRegistry;
pub use ring::{RingReader, RtpBatch, RtpRing};

/// Control surface a source's owner exposes to players and the registry.
///
/// Every method has a refusing default so owners implement only what they
/// support.
pub trait MediaSourceEvent: Send + Sync {
    /// Ask the owner to stop the stream. Without `force` an owner may refuse
    /// while readers are attached.
    fn close(&self, _source: &MediaSource, _force: bool) -> bool {
        false
    }

    fn on_reader_changed(&self, _source: &MediaSource, _count: usize) {}

    fn pause(&self, _source: &MediaSource, _pause: bool) -> bool {
        false
    }

    fn speed(&self, _source: &MediaSource, _speed: f32) -> bool {
        false
    }

    /// Seek to `stamp_ms` from the start of the stream.
    fn seek(&self, _source: &MediaSource, _stamp_ms: u64) -> bool {
        false
    }

    /// Readers across every output of the stream, not just this ring.
    fn total_reader_count(&self, source: &MediaSource) -> usize {
        source.reader_count()
    }
}

pub struct MediaSource {
    identity: StreamIdentity,
    sdp: String,
    tracks: RwLock<Vec<SdpTrack>>,
    ring: Arc<RtpRing>,
    listener: RwLock<Option<Weak<dyn MediaSourceEvent>>>,
    registry: Mutex<Weak<MediaRegistry>>,
    created: Instant,
    bytes: AtomicU64,
}

impl MediaSource {
    pub fn new(identity: StreamIdentity, sdp: String) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MediaSource>| {
            let weak = weak.clone();
            let ring = RtpRing::with_reader_callback(ring::MAX_GOP_BATCHES, move |count| {
                if let Some(source) = weak.upgrade() {
                    source.on_reader_changed(count);
                }
            });
            MediaSource {
                identity,
                tracks: RwLock::new(parse_sdp(&sdp)),
                sdp,
                ring: Arc::new(ring),
                listener: RwLock::new(None),
                registry: Mutex::new(Weak::new()),
                created: Instant::now(),
                bytes: AtomicU64::new(0),
            }
        })
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Tracks from the SDP, with ssrc/seq/timestamp of the newest packet.
    pub fn tracks(&self) -> Vec<SdpTrack> {
        self.tracks.read().clone()
    }

    pub fn ring(&self) -> &Arc<RtpRing> {
        &self.ring
    }

    pub fn set_listener(&self, listener: Weak<dyn MediaSourceEvent>) {
        *self.listener.write() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn MediaSourceEvent>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn bind_registry(&self, registry: Weak<MediaRegistry>) {
        *self.registry.lock() = registry;
    }

    /// Write one packet; see [`write_batch`](Self::write_batch).
    pub fn write_rtp(&self, packet: RtpPacket, key: bool) {
        self.write_batch(vec![packet], key);
    }

    /// Publish packets to every attached reader.
    pub fn write_batch(&self, packets: Vec<RtpPacket>, key: bool) {
        let Some(last) = packets.last() else {
            return;
        };
        {
            let mut tracks = self.tracks.write();
            if let Some(t) = tracks.iter_mut().find(|t| t.track_type == last.track_type) {
                t.ssrc = last.ssrc();
                t.seq = last.seq();
                t.timestamp = last.timestamp();
            }
        }
        let bytes: usize = packets.iter().map(RtpPacket::len).sum();
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        tracing::trace!(source = %self.identity, packets = packets.len(), key, "rtp written");
        self.ring.write(Arc::new(packets), key);
    }

    pub fn has_track(&self, track_type: TrackType) -> bool {
        self.tracks.read().iter().any(|t| t.track_type == track_type)
    }

    pub fn reader_count(&self) -> usize {
        self.ring.reader_count()
    }

    pub fn total_reader_count(&self) -> usize {
        match self.listener() {
            Some(l) => l.total_reader_count(self),
            None => self.reader_count(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn alive_secs(&self) -> u64 {
        self.created.elapsed().as_secs()
    }

    pub fn close(&self, force: bool) -> bool {
        match self.listener() {
            Some(l) => l.close(self, force),
            None => false,
        }
    }

    pub fn pause(&self, pause: bool) -> bool {
        self.listener().is_some_and(|l| l.pause(self, pause))
    }

    pub fn speed(&self, speed: f32) -> bool {
        self.listener().is_some_and(|l| l.speed(self, speed))
    }

    pub fn seek(&self, stamp_ms: u64) -> bool {
        self.listener().is_some_and(|l| l.seek(self, stamp_ms))
    }

    fn on_reader_changed(&self, count: usize) {
        tracing::debug!(source = %self.identity, count, "reader count changed");
        if let Some(l) = self.listener() {
            l.on_reader_changed(self, count);
        }
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.get_mut().upgrade() {
            registry.unregister(self);
        }
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("identity", &self.identity)
            .field("readers", &self.reader_count())
            .finish()
    }
}
