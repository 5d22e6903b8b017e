use bytes::Bytes;

use super::track::{CodecId, TrackType};

/// One decoded access unit flowing through the fan-out engine.
///
/// Cheap to clone: payload is a reference-counted [`Bytes`]. Timestamp
/// rewriting produces a new frame via [`with_stamps`](Self::with_stamps);
/// the original is never mutated.
#[derive(Debug, Clone)]
pub struct Frame {
    pub codec: CodecId,
    /// Decode timestamp in milliseconds.
    pub dts: u64,
    /// Presentation timestamp in milliseconds.
    pub pts: u64,
    pub key_frame: bool,
    /// SPS/PPS/VPS-style configuration data.
    pub config_frame: bool,
    pub data: Bytes,
}

impl Frame {
    pub fn new(codec: CodecId, dts: u64, pts: u64, data: impl Into<Bytes>) -> Self {
        Self {
            codec,
            dts,
            pts,
            key_frame: false,
            config_frame: false,
            data: data.into(),
        }
    }

    pub fn key(mut self) -> Self {
        self.key_frame = true;
        self
    }

    pub fn config(mut self) -> Self {
        self.config_frame = true;
        self
    }

    pub fn track_type(&self) -> TrackType {
        self.codec.track_type()
    }

    /// Copy of this frame carrying rewritten timestamps.
    pub fn with_stamps(&self, dts: u64, pts: u64) -> Self {
        Self {
            dts,
            pts,
            ..self.clone()
        }
    }
}
