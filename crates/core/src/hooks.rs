//! Authorization and notification hooks.
//!
//! Every hook is optional; `None` means nobody listens, which the session
//! treats as "allowed" (or "no authentication") exactly as if a listener
//! had answered immediately. Hooks receive a [`Completion`] and may answer
//! from any thread, now or later. The session re-dispatches the answer onto
//! its own connection thread before touching any state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::source::identity::MediaInfo;

/// Single-shot continuation.
///
/// Invoked exactly once: either through [`complete`](Self::complete) or,
/// if the holder drops it unanswered, with the fallback value given at
/// construction.
pub struct Completion<T: Send + 'static> {
    callback: Option<Box<dyn FnOnce(T) + Send>>,
    fallback: Option<T>,
}

impl<T: Send + 'static> Completion<T> {
    pub fn new(fallback: T, callback: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            fallback: Some(fallback),
        }
    }

    pub fn complete(mut self, value: T) {
        if let Some(cb) = self.callback.take() {
            cb(value);
        }
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if let (Some(cb), Some(value)) = (self.callback.take(), self.fallback.take()) {
            tracing::warn!("completion dropped without an answer, using fallback");
            cb(value);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Password handed back by the password-lookup hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Password {
    Plain(String),
    /// `MD5(user:realm:password)` as lowercase or uppercase hex.
    Md5(String),
}

/// Accepted publish, with the recorder defaults for this stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishGrant {
    pub enable_hls: bool,
    pub enable_mp4: bool,
}

/// Traffic summary of a finished session.
#[derive(Debug, Clone)]
pub struct FlowReport {
    pub info: MediaInfo,
    pub total_bytes: u64,
    pub duration: Duration,
    pub is_player: bool,
    pub peer: String,
}

/// Realm lookup: an empty realm means the stream needs no authentication.
pub type RealmHook = Arc<dyn Fn(&MediaInfo, Completion<String>) + Send + Sync>;

/// Password lookup for `(realm, user)`. `must_be_plain` is set for Basic.
/// Answering `None` rejects the user.
pub type PasswordHook =
    Arc<dyn Fn(&MediaInfo, &str, &str, bool, Completion<Option<Password>>) + Send + Sync>;

/// Play authorization: `Err(reason)` rejects.
pub type PlayHook = Arc<dyn Fn(&MediaInfo, Completion<Result<(), String>>) + Send + Sync>;

/// Publish authorization: `Err(reason)` rejects.
pub type PublishHook =
    Arc<dyn Fn(&MediaInfo, Completion<Result<PublishGrant, String>>) + Send + Sync>;

pub type FlowReportHook = Arc<dyn Fn(&FlowReport) + Send + Sync>;

/// Fired when a player asks for a stream that is not live, so an
/// on-demand pull can be started before the lookup times out.
pub type NotFoundHook = Arc<dyn Fn(&MediaInfo) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_get_realm: Option<RealmHook>,
    pub on_rtsp_auth: Option<PasswordHook>,
    pub on_play: Option<PlayHook>,
    pub on_publish: Option<PublishHook>,
    pub on_flow_report: Option<FlowReportHook>,
    pub on_stream_not_found: Option<NotFoundHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_get_realm", &self.on_get_realm.is_some())
            .field("on_rtsp_auth", &self.on_rtsp_auth.is_some())
            .field("on_play", &self.on_play.is_some())
            .field("on_publish", &self.on_publish.is_some())
            .field("on_flow_report", &self.on_flow_report.is_some())
            .field("on_stream_not_found", &self.on_stream_not_found.is_some())
            .finish()
    }
}
