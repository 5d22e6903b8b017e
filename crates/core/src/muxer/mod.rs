//! Fan-out engine: one decoded frame stream in, every live output out.
//!
//! [`MultiSourceMuxer`] owns the stream's tracks and a fixed set of sink
//! slots (RTMP, RTSP, TS, FMP4, HLS, MP4) plus any number of RTP
//! re-senders keyed by SSRC. Each slot is an atomically replaceable
//! `Arc`: frame delivery clones the slot once per call, so a recorder
//! started or stopped from another thread either sees the whole frame or
//! none of it.
//!
//! Frames are only forwarded once every track is ready (or the readiness
//! wait expired and the unready tracks were dropped).

pub mod rtp_sender;
pub mod rtsp;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::media::stamp::Stamp;
use crate::media::{CodecId, Frame, Track};
use crate::protocol::sdp::SdpOrigin;
use crate::source::registry::MediaRegistry;
use crate::source::{MediaSource, MediaSourceEvent, StreamIdentity};

use self::rtp_sender::RtpSender;
use self::rtsp::RtspMuxer;

/// One output of the fan-out engine.
///
/// Methods take `&self`: sinks are shared with the engine's delivery path
/// and keep their own interior state.
pub trait MediaSink: Send + Sync {
    fn name(&self) -> &str;

    /// Offer a ready track; `false` means this sink cannot carry it.
    fn add_track(&self, track: &Arc<Track>) -> bool;

    /// No more tracks will be added.
    fn add_track_completed(&self) {}

    fn input_frame(&self, frame: &Frame) -> bool;

    fn reset_tracks(&self);

    fn reader_count(&self) -> usize {
        0
    }

    /// Whether anybody consumes this output right now.
    fn is_enabled(&self) -> bool {
        self.reader_count() > 0
    }
}

/// Protocol outputs made by a [`SinkFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Rtmp,
    Ts,
    Fmp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Hls,
    Mp4,
}

/// Builds the format muxers and recorders this crate does not implement.
pub trait SinkFactory: Send + Sync {
    fn create_sink(&self, kind: SinkKind, identity: &StreamIdentity) -> Option<Arc<dyn MediaSink>>;

    /// `path` empty means the recorder's default location; `max_secs` 0
    /// means no segment limit.
    fn create_recorder(
        &self,
        kind: RecordKind,
        identity: &StreamIdentity,
        path: &str,
        max_secs: u64,
    ) -> Option<Arc<dyn MediaSink>>;
}

/// Owner side of the engine. Source control requests from any output
/// (close, pause, seek) are forwarded here.
pub trait MuxerListener: MediaSourceEvent {
    fn on_all_tracks_ready(&self, _tracks: &[Arc<Track>]) {}
}

#[derive(Clone)]
pub struct MuxerOptions {
    pub enable_rtsp: bool,
    pub enable_rtmp: bool,
    pub enable_ts: bool,
    pub enable_fmp4: bool,
    pub enable_hls: bool,
    pub enable_mp4: bool,
    pub modify_stamp: bool,
    pub max_wait_track_ready: Duration,
    pub stream_none_reader_delay: Duration,
    pub sdp_origin: SdpOrigin,
}

impl Default for MuxerOptions {
    fn default() -> Self {
        Self {
            enable_rtsp: true,
            enable_rtmp: true,
            enable_ts: true,
            enable_fmp4: true,
            enable_hls: false,
            enable_mp4: false,
            modify_stamp: false,
            max_wait_track_ready: Duration::from_millis(10_000),
            stream_none_reader_delay: Duration::from_millis(20_000),
            sdp_origin: SdpOrigin::default(),
        }
    }
}

type Slot = RwLock<Option<Arc<dyn MediaSink>>>;

#[derive(Default)]
struct TrackSet {
    tracks: Vec<Arc<Track>>,
    completed: bool,
    all_ready: bool,
    first_added: Option<Instant>,
    stamps: [Stamp; 3],
}

struct EnabledCheck {
    enabled: bool,
    last_check: Instant,
}

pub struct MultiSourceMuxer {
    identity: StreamIdentity,
    options: MuxerOptions,
    factory: Option<Arc<dyn SinkFactory>>,
    rtmp: Slot,
    rtsp: Slot,
    ts: Slot,
    fmp4: Slot,
    hls: Slot,
    mp4: Slot,
    rtp_senders: Mutex<HashMap<u32, Arc<RtpSender>>>,
    track_set: Mutex<TrackSet>,
    listener: RwLock<Option<Weak<dyn MuxerListener>>>,
    enabled: Mutex<EnabledCheck>,
}

impl MultiSourceMuxer {
    /// `identity` is schema-neutral; each output registers under its own
    /// schema.
    pub fn new(
        identity: StreamIdentity,
        options: MuxerOptions,
        registry: &Arc<MediaRegistry>,
        factory: Option<Arc<dyn SinkFactory>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MultiSourceMuxer>| {
            let listener: Weak<dyn MediaSourceEvent> = weak.clone();
            let make = |enabled: bool, kind: SinkKind| -> Slot {
                let sink = enabled
                    .then(|| factory.as_ref()?.create_sink(kind, &identity))
                    .flatten();
                RwLock::new(sink)
            };
            let make_recorder = |enabled: bool, kind: RecordKind| -> Slot {
                let sink = enabled
                    .then(|| factory.as_ref()?.create_recorder(kind, &identity, "", 0))
                    .flatten();
                RwLock::new(sink)
            };
            let rtsp: Option<Arc<dyn MediaSink>> = options.enable_rtsp.then(|| {
                Arc::new(RtspMuxer::new(
                    identity.with_schema(crate::source::identity::RTSP_SCHEMA),
                    registry.clone(),
                    options.sdp_origin.clone(),
                    listener,
                )) as Arc<dyn MediaSink>
            });
            MultiSourceMuxer {
                rtmp: make(options.enable_rtmp, SinkKind::Rtmp),
                rtsp: RwLock::new(rtsp),
                ts: make(options.enable_ts, SinkKind::Ts),
                fmp4: make(options.enable_fmp4, SinkKind::Fmp4),
                hls: make_recorder(options.enable_hls, RecordKind::Hls),
                mp4: make_recorder(options.enable_mp4, RecordKind::Mp4),
                identity,
                options,
                factory,
                rtp_senders: Mutex::new(HashMap::new()),
                track_set: Mutex::new(TrackSet::default()),
                listener: RwLock::new(None),
                enabled: Mutex::new(EnabledCheck {
                    enabled: false,
                    last_check: Instant::now(),
                }),
            }
        })
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    pub fn set_listener(&self, listener: Weak<dyn MuxerListener>) {
        *self.listener.write() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn MuxerListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    /// Slots in delivery order.
    fn sinks(&self) -> Vec<Arc<dyn MediaSink>> {
        [&self.rtmp, &self.rtsp, &self.ts, &self.hls, &self.mp4, &self.fmp4]
            .into_iter()
            .filter_map(|slot| slot.read().clone())
            .collect()
    }

    fn senders(&self) -> Vec<Arc<RtpSender>> {
        self.rtp_senders.lock().values().cloned().collect()
    }

    /// Add a track to the stream. Linear PCM is refused, as are a second
    /// track of one type and tracks added after the set is complete.
    pub fn add_track(&self, track: Arc<Track>) -> bool {
        if track.codec() == CodecId::L16 {
            tracing::warn!(stream = %self.identity, "L16 audio is only carried over RTSP, track ignored");
            return false;
        }
        let mut set = self.track_set.lock();
        if set.all_ready {
            tracing::warn!(stream = %self.identity, %track, "track added after all tracks ready, ignored");
            return false;
        }
        if set.tracks.iter().any(|t| t.track_type() == track.track_type()) {
            tracing::warn!(stream = %self.identity, %track, "duplicate track type, ignored");
            return false;
        }
        set.first_added.get_or_insert_with(Instant::now);
        tracing::debug!(stream = %self.identity, %track, "track added");
        set.tracks.push(track);
        true
    }

    /// No more tracks will be added; the set is ready once each track is.
    pub fn add_track_completed(&self) {
        let ready = {
            let mut set = self.track_set.lock();
            set.completed = true;
            self.check_ready(&mut set)
        };
        if let Some(tracks) = ready {
            self.announce_tracks(&tracks);
        }
    }

    /// Marks the set ready when it is, returning the tracks to announce.
    fn check_ready(&self, set: &mut TrackSet) -> Option<Vec<Arc<Track>>> {
        if set.all_ready || set.tracks.is_empty() {
            return None;
        }
        let waited = set.first_added.map(|t| t.elapsed()).unwrap_or_default();
        let timed_out = waited > self.options.max_wait_track_ready;
        if !set.completed && !timed_out {
            return None;
        }
        if !set.tracks.iter().all(|t| t.is_ready()) {
            if !timed_out || !set.tracks.iter().any(|t| t.is_ready()) {
                return None;
            }
            set.tracks.retain(|t| {
                if !t.is_ready() {
                    tracing::warn!(stream = %self.identity, track = %t, ?waited, "track never became ready, dropped");
                }
                t.is_ready()
            });
        }

        set.all_ready = true;
        Some(set.tracks.clone())
    }

    fn announce_tracks(&self, tracks: &[Arc<Track>]) {
        for track in tracks {
            self.on_track_ready(track);
        }
        self.on_all_tracks_ready(tracks);
    }

    /// Offer a ready track to every sink; true if any took it.
    fn on_track_ready(&self, track: &Arc<Track>) -> bool {
        let mut accepted = false;
        for sink in self.sinks() {
            if sink.add_track(track) {
                accepted = true;
            } else {
                tracing::warn!(stream = %self.identity, sink = sink.name(), %track, "sink rejected track");
            }
        }
        accepted
    }

    fn on_all_tracks_ready(&self, tracks: &[Arc<Track>]) {
        for sink in self.sinks() {
            sink.add_track_completed();
        }
        if let Some(listener) = self.listener() {
            listener.on_all_tracks_ready(tracks);
        }
        let codecs: Vec<String> = tracks.iter().map(|t| t.to_string()).collect();
        tracing::info!(stream = %self.identity, codec_info = %codecs.join(" "), "all tracks ready");
    }

    /// Deliver one frame to every output; true if any took it.
    pub fn input_frame(&self, frame: &Frame) -> bool {
        let ready = {
            let mut set = self.track_set.lock();
            let ready = self.check_ready(&mut set);
            if !set.all_ready {
                tracing::trace!(stream = %self.identity, dts = frame.dts, "frame before tracks ready, dropped");
                return false;
            }
            ready
        };
        if let Some(tracks) = ready {
            self.announce_tracks(&tracks);
        }

        let frame = {
            let mut set = self.track_set.lock();
            let kind = frame.track_type();
            if !set.tracks.iter().any(|t| t.track_type() == kind) {
                return false;
            }
            if self.options.modify_stamp {
                let (dts, pts) = set.stamps[kind.index()].revise(frame.dts, frame.pts);
                frame.with_stamps(dts, pts)
            } else {
                frame.clone()
            }
        };

        let mut accepted = false;
        for sink in self.sinks() {
            if sink.input_frame(&frame) {
                accepted = true;
            } else {
                tracing::trace!(stream = %self.identity, sink = sink.name(), "sink rejected frame");
            }
        }
        for sender in self.senders() {
            if sender.input_frame(&frame) {
                accepted = true;
            }
        }
        accepted
    }

    /// Start or stop one recorder kind. Idempotent, callable from any thread.
    pub fn setup_record(&self, kind: RecordKind, start: bool, path: &str, max_secs: u64) -> bool {
        let slot = match kind {
            RecordKind::Hls => &self.hls,
            RecordKind::Mp4 => &self.mp4,
        };
        if !start {
            if slot.write().take().is_some() {
                tracing::info!(stream = %self.identity, ?kind, "recording stopped");
            }
            return true;
        }
        if slot.read().is_some() {
            return true;
        }
        let Some(factory) = self.factory.as_ref() else {
            tracing::warn!(stream = %self.identity, ?kind, "no sink factory, cannot record");
            return false;
        };
        let Some(recorder) = factory.create_recorder(kind, &self.identity, path, max_secs) else {
            return false;
        };
        let (tracks, ready) = {
            let set = self.track_set.lock();
            (set.tracks.clone(), set.all_ready)
        };
        if ready {
            for track in &tracks {
                recorder.add_track(track);
            }
            recorder.add_track_completed();
        }
        let mut guard = slot.write();
        if guard.is_none() {
            *guard = Some(recorder);
            tracing::info!(stream = %self.identity, ?kind, path, "recording started");
        }
        true
    }

    pub fn is_recording(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Hls => self.hls.read().is_some(),
            RecordKind::Mp4 => self.mp4.read().is_some(),
        }
    }

    /// Re-send the stream as RTP over UDP to `dst` with `ssrc`, replacing
    /// any sender with the same SSRC. Returns the local port.
    pub fn start_send_rtp(&self, ssrc: u32, dst: SocketAddr, src_port: u16) -> Result<u16> {
        let tracks = {
            let set = self.track_set.lock();
            if !set.all_ready {
                return Err(RtspError::TrackNotSetup(format!(
                    "{} has no ready tracks",
                    self.identity
                )));
            }
            set.tracks.clone()
        };
        let sender = Arc::new(RtpSender::bind(ssrc, dst, src_port)?);
        for track in &tracks {
            sender.add_track(track);
        }
        sender.add_track_completed();
        let port = sender.local_port();
        self.rtp_senders.lock().insert(ssrc, sender);
        tracing::info!(stream = %self.identity, ssrc, %dst, port, "rtp sender started");
        Ok(port)
    }

    /// Stop the sender for `ssrc`, or every sender when `None`.
    pub fn stop_send_rtp(&self, ssrc: Option<u32>) -> bool {
        let stopped = {
            let mut senders = self.rtp_senders.lock();
            match ssrc {
                None => {
                    let n = senders.len();
                    senders.clear();
                    n > 0
                }
                Some(ssrc) => senders.remove(&ssrc).is_some(),
            }
        };
        if stopped {
            tracing::info!(stream = %self.identity, ?ssrc, "rtp sender stopped");
        }
        stopped
    }

    /// Forget every track, in the engine and in every output.
    pub fn reset_tracks(&self) {
        *self.track_set.lock() = TrackSet::default();
        for sink in self.sinks() {
            sink.reset_tracks();
        }
        for sender in self.senders() {
            sender.reset_tracks();
        }
    }

    pub fn tracks(&self, ready_only: bool) -> Vec<Arc<Track>> {
        let set = self.track_set.lock();
        set.tracks
            .iter()
            .filter(|t| !ready_only || t.is_ready())
            .cloned()
            .collect()
    }

    pub fn total_reader_count(&self) -> usize {
        let sinks: usize = self.sinks().iter().map(|s| s.reader_count()).sum();
        sinks + self.rtp_senders.lock().len()
    }

    /// Whether any output consumes frames. Rechecked on every call while
    /// idle; once active, only after the no-reader grace period.
    pub fn is_enabled(&self) -> bool {
        let mut check = self.enabled.lock();
        if !check.enabled || check.last_check.elapsed() > self.options.stream_none_reader_delay {
            let any_sink = self.sinks().iter().any(|s| s.is_enabled())
                || self.mp4.read().is_some();
            check.enabled = any_sink || !self.rtp_senders.lock().is_empty();
            if check.enabled {
                check.last_check = Instant::now();
            }
        }
        check.enabled
    }
}

impl MediaSourceEvent for MultiSourceMuxer {
    fn close(&self, source: &MediaSource, force: bool) -> bool {
        self.listener().is_some_and(|l| l.close(source, force))
    }

    fn on_reader_changed(&self, source: &MediaSource, _count: usize) {
        if let Some(l) = self.listener() {
            l.on_reader_changed(source, self.total_reader_count());
        }
    }

    fn pause(&self, source: &MediaSource, pause: bool) -> bool {
        self.listener().is_some_and(|l| l.pause(source, pause))
    }

    fn speed(&self, source: &MediaSource, speed: f32) -> bool {
        self.listener().is_some_and(|l| l.speed(source, speed))
    }

    fn seek(&self, source: &MediaSource, stamp_ms: u64) -> bool {
        self.listener().is_some_and(|l| l.seek(source, stamp_ms))
    }

    fn total_reader_count(&self, source: &MediaSource) -> usize {
        match self.listener() {
            Some(l) => l.total_reader_count(source),
            None => self.total_reader_count(),
        }
    }
}

impl fmt::Debug for MultiSourceMuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiSourceMuxer")
            .field("identity", &self.identity)
            .field("sinks", &self.sinks().len())
            .field("rtp_senders", &self.rtp_senders.lock().len())
            .finish()
    }
}
