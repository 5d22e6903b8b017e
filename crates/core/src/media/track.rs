use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Video,
    Audio,
    Unknown,
}

impl TrackType {
    /// Index used for per-type tables (video = 0, audio = 1, unknown = 2).
    pub fn index(self) -> usize {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
            Self::Unknown => 2,
        }
    }

    /// SDP media name (`m=video`, `m=audio`).
    pub fn sdp_name(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Unknown => "application",
        }
    }

    pub fn from_sdp_name(name: &str) -> Self {
        match name {
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Unknown,
        }
    }
}

/// Codec identifier carried by tracks and frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Aac,
    G711A,
    G711U,
    Opus,
    /// 16-bit linear PCM; only carried over RTSP.
    L16,
    Unknown,
}

impl CodecId {
    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::H265 => "H265",
            Self::Aac => "mpeg4-generic",
            Self::G711A => "PCMA",
            Self::G711U => "PCMU",
            Self::Opus => "opus",
            Self::L16 => "L16",
            Self::Unknown => "unknown",
        }
    }

    /// Map an SDP `a=rtpmap` encoding name to a codec (case-insensitive).
    pub fn from_encoding_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "H264" => Self::H264,
            "H265" | "HEVC" => Self::H265,
            "MPEG4-GENERIC" => Self::Aac,
            "PCMA" => Self::G711A,
            "PCMU" => Self::G711U,
            "OPUS" => Self::Opus,
            "L16" => Self::L16,
            _ => Self::Unknown,
        }
    }

    pub fn track_type(self) -> TrackType {
        match self {
            Self::H264 | Self::H265 => TrackType::Video,
            Self::Aac | Self::G711A | Self::G711U | Self::Opus | Self::L16 => TrackType::Audio,
            Self::Unknown => TrackType::Unknown,
        }
    }
}

/// Kind-specific track attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackInfo {
    Video { width: u32, height: u32, fps: f32 },
    Audio { sample_rate: u32, channels: u8, sample_bits: u8 },
    Unknown,
}

/// A decoded-stream track as seen by the fan-out engine.
///
/// Codec parsing lives outside this crate; whoever parses the codec flips
/// readiness with [`set_ready`](Self::set_ready) once config data (SPS/PPS,
/// AudioSpecificConfig) is known.
#[derive(Debug)]
pub struct Track {
    codec: CodecId,
    info: TrackInfo,
    ready: AtomicBool,
}

impl Track {
    pub fn video(codec: CodecId, width: u32, height: u32, fps: f32) -> Self {
        Self {
            codec,
            info: TrackInfo::Video { width, height, fps },
            ready: AtomicBool::new(false),
        }
    }

    pub fn audio(codec: CodecId, sample_rate: u32, channels: u8, sample_bits: u8) -> Self {
        Self {
            codec,
            info: TrackInfo::Audio {
                sample_rate,
                channels,
                sample_bits,
            },
            ready: AtomicBool::new(false),
        }
    }

    pub fn unknown(codec: CodecId) -> Self {
        Self {
            codec,
            info: TrackInfo::Unknown,
            ready: AtomicBool::new(false),
        }
    }

    /// Builder form of [`set_ready`](Self::set_ready).
    pub fn ready(self) -> Self {
        self.set_ready();
        self
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn track_type(&self) -> TrackType {
        match self.info {
            TrackInfo::Video { .. } => TrackType::Video,
            TrackInfo::Audio { .. } => TrackType::Audio,
            TrackInfo::Unknown => self.codec.track_type(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// RTP clock rate for this track.
    pub fn clock_rate(&self) -> u32 {
        match self.info {
            TrackInfo::Audio { sample_rate, .. } if sample_rate > 0 => sample_rate,
            TrackInfo::Audio { .. } => 8000,
            _ => 90000,
        }
    }
}

impl fmt::Display for Track {
    /// `H264[1920/1080/30]`, `mpeg4-generic[44100/2/16]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.info {
            TrackInfo::Video { width, height, fps } => write!(
                f,
                "{}[{}/{}/{}]",
                self.codec.name(),
                width,
                height,
                fps.round()
            ),
            TrackInfo::Audio {
                sample_rate,
                channels,
                sample_bits,
            } => write!(
                f,
                "{}[{}/{}/{}]",
                self.codec.name(),
                sample_rate,
                channels,
                sample_bits
            ),
            TrackInfo::Unknown => write!(f, "{}", self.codec.name()),
        }
    }
}
