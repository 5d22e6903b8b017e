use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::media::{Frame, Packetizer, Track, TrackType, packetizer_for, payload_type_for};
use crate::protocol::sdp::{MediaSection, SdpOrigin, generate_sdp};
use crate::source::registry::MediaRegistry;
use crate::source::{MediaSource, MediaSourceEvent, StreamIdentity};

use super::MediaSink;

struct RtspTrack {
    track_type: TrackType,
    packetizer: Box<dyn Packetizer>,
}

#[derive(Default)]
struct State {
    tracks: Vec<RtspTrack>,
    source: Option<Arc<MediaSource>>,
}

/// Fan-out output that serves the stream to RTSP players.
///
/// Packetizes frames into RTP and writes them to an `rtsp` schema
/// [`MediaSource`], registered once all tracks are known so its SDP is
/// complete.
pub struct RtspMuxer {
    identity: StreamIdentity,
    registry: Arc<MediaRegistry>,
    origin: SdpOrigin,
    listener: Weak<dyn MediaSourceEvent>,
    state: Mutex<State>,
}

impl RtspMuxer {
    pub fn new(
        identity: StreamIdentity,
        registry: Arc<MediaRegistry>,
        origin: SdpOrigin,
        listener: Weak<dyn MediaSourceEvent>,
    ) -> Self {
        Self {
            identity,
            registry,
            origin,
            listener,
            state: Mutex::new(State::default()),
        }
    }

    pub fn source(&self) -> Option<Arc<MediaSource>> {
        self.state.lock().source.clone()
    }
}

impl MediaSink for RtspMuxer {
    fn name(&self) -> &str {
        "rtsp"
    }

    fn add_track(&self, track: &Arc<Track>) -> bool {
        let Some(packetizer) = packetizer_for(track, payload_type_for(track)) else {
            return false;
        };
        let mut state = self.state.lock();
        state.tracks.push(RtspTrack {
            track_type: track.track_type(),
            packetizer,
        });
        true
    }

    fn add_track_completed(&self) {
        let media: Vec<MediaSection> = {
            let state = self.state.lock();
            if state.tracks.is_empty() || state.source.is_some() {
                return;
            }
            state
                .tracks
                .iter()
                .enumerate()
                .map(|(i, t)| MediaSection {
                    track_type: t.track_type,
                    payload_type: t.packetizer.payload_type(),
                    attributes: t.packetizer.sdp_attributes(i),
                })
                .collect()
        };
        let source = MediaSource::new(self.identity.clone(), generate_sdp(&self.origin, &media));
        source.set_listener(self.listener.clone());
        if let Err(e) = self.registry.register(&source) {
            tracing::warn!(source = %self.identity, error = %e, "rtsp output not registered");
            return;
        }
        self.state.lock().source = Some(source);
    }

    fn input_frame(&self, frame: &Frame) -> bool {
        let mut state = self.state.lock();
        let has_video = state
            .tracks
            .iter()
            .any(|t| t.track_type == TrackType::Video);
        let kind = frame.track_type();
        let Some(track) = state.tracks.iter_mut().find(|t| t.track_type == kind) else {
            return false;
        };
        let packets = track.packetizer.packetize(frame);
        let Some(source) = state.source.clone() else {
            return false;
        };
        drop(state);

        // audio-only streams restart the cache on every frame
        let key = match kind {
            TrackType::Video => frame.key_frame || frame.config_frame,
            _ => !has_video,
        };
        source.write_batch(packets, key);
        true
    }

    fn reset_tracks(&self) {
        let source = {
            let mut state = self.state.lock();
            state.tracks.clear();
            state.source.take()
        };
        // dropped outside the lock: it unregisters and detaches players
        drop(source);
    }

    fn reader_count(&self) -> usize {
        self.source().map_or(0, |s| s.reader_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::CodecId;
    use crate::source::identity::DEFAULT_VHOST;

    struct NoOwner;
    impl MediaSourceEvent for NoOwner {}

    fn muxer(registry: &Arc<MediaRegistry>) -> RtspMuxer {
        let weak: Weak<dyn MediaSourceEvent> = Weak::<NoOwner>::new();
        RtspMuxer::new(
            StreamIdentity::new("rtsp", DEFAULT_VHOST, "live", "cam"),
            registry.clone(),
            SdpOrigin::default(),
            weak,
        )
    }

    #[test]
    fn registers_playable_source_when_complete() {
        let registry = MediaRegistry::new();
        let m = muxer(&registry);
        let video = Arc::new(Track::video(CodecId::H264, 640, 480, 25.0).ready());
        let audio = Arc::new(Track::audio(CodecId::G711A, 8000, 1, 16).ready());
        assert!(m.add_track(&video));
        assert!(m.add_track(&audio));
        assert!(m.source().is_none());
        m.add_track_completed();

        let id = StreamIdentity::new("rtsp", DEFAULT_VHOST, "live", "cam");
        let source = registry.find(&id).expect("registered");
        let sdp = source.sdp();
        assert!(sdp.contains("m=video 0 RTP/AVP 96"), "{sdp}");
        assert!(sdp.contains("m=audio 0 RTP/AVP 8"), "{sdp}");
        assert!(sdp.contains("a=control:trackID=1"), "{sdp}");
        assert_eq!(source.tracks().len(), 2);

        let (tx, rx) = std::sync::mpsc::channel();
        let _reader = source.ring().attach(false, move |b| tx.send(b.len()).unwrap(), || {});
        assert_eq!(m.reader_count(), 1);
        let idr = Frame::new(CodecId::H264, 0, 0, vec![0, 0, 0, 1, 0x65, 1, 2, 3]).key();
        assert!(m.input_frame(&idr));
        assert_eq!(rx.try_recv(), Ok(1));
    }

    #[test]
    fn reset_unregisters() {
        let registry = MediaRegistry::new();
        let m = muxer(&registry);
        m.add_track(&Arc::new(Track::audio(CodecId::G711U, 8000, 1, 16).ready()));
        m.add_track_completed();
        assert_eq!(registry.sources().len(), 1);
        m.reset_tracks();
        assert!(registry.sources().is_empty());
        assert!(!m.input_frame(&Frame::new(CodecId::G711U, 0, 0, vec![0xff; 160])));
    }

    #[test]
    fn unsupported_codec_is_rejected() {
        let m = muxer(&MediaRegistry::new());
        assert!(!m.add_track(&Arc::new(Track::unknown(CodecId::Unknown))));
    }
}
