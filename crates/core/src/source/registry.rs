use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::hooks::Completion;

use super::{MediaSource, StreamIdentity};

/// Called with `(source, registered)` on every registration change.
pub type RegistryListener = Arc<dyn Fn(&MediaSource, bool) + Send + Sync>;

type FindResult = Option<Arc<MediaSource>>;

struct Waiter {
    identity: StreamIdentity,
    deadline: Instant,
    done: Completion<FindResult>,
}

/// Process-wide directory of live sources, keyed by [`StreamIdentity`].
///
/// Entries are weak: a source stays registered only while its producer
/// holds it, and unregisters itself when dropped.
#[derive(Default)]
pub struct MediaRegistry {
    sources: RwLock<HashMap<StreamIdentity, Weak<MediaSource>>>,
    waiters: Mutex<Vec<Waiter>>,
    listeners: RwLock<Vec<RegistryListener>>,
}

impl MediaRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `source` findable. Fails if its identity is already live.
    pub fn register(self: &Arc<Self>, source: &Arc<MediaSource>) -> Result<()> {
        {
            let mut sources = self.sources.write();
            let identity = source.identity().clone();
            if sources.get(&identity).is_some_and(|w| w.strong_count() > 0) {
                return Err(RtspError::AlreadyPublishing(identity.to_string()));
            }
            sources.insert(identity, Arc::downgrade(source));
        }
        source.bind_registry(Arc::downgrade(self));
        tracing::info!(source = %source.identity(), "media source registered");

        let ready: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let (ready, pending) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| &w.identity == source.identity());
            *waiters = pending;
            ready
        };
        for waiter in ready {
            waiter.done.complete(Some(source.clone()));
        }
        self.notify(source, true);
        Ok(())
    }

    /// Remove `source` if it is the one registered under its identity.
    pub fn unregister(&self, source: &MediaSource) -> bool {
        let removed = {
            let mut sources = self.sources.write();
            let same = sources
                .get(source.identity())
                .is_some_and(|w| std::ptr::eq(w.as_ptr(), source));
            if same {
                sources.remove(source.identity());
            }
            same
        };
        if removed {
            tracing::info!(source = %source.identity(), "media source unregistered");
            self.notify(source, false);
        }
        removed
    }

    pub fn find(&self, identity: &StreamIdentity) -> Option<Arc<MediaSource>> {
        self.sources.read().get(identity).and_then(Weak::upgrade)
    }

    /// Resolve now if live, else wait up to `timeout` for a registration.
    /// `done` receives `None` on timeout or [`clear`](Self::clear).
    pub fn find_async(
        &self,
        identity: &StreamIdentity,
        timeout: Duration,
        done: Completion<FindResult>,
    ) {
        if let Some(source) = self.find(identity) {
            done.complete(Some(source));
            return;
        }
        tracing::debug!(source = %identity, ?timeout, "waiting for media source");
        self.waiters.lock().push(Waiter {
            identity: identity.clone(),
            deadline: Instant::now() + timeout,
            done,
        });
    }

    /// Fail waiters whose deadline passed. Driven by the manager tick.
    pub fn expire_waiters(&self, now: Instant) {
        let expired: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let (expired, pending) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| w.deadline <= now);
            *waiters = pending;
            expired
        };
        for waiter in expired {
            tracing::debug!(source = %waiter.identity, "media source lookup timed out");
            waiter.done.complete(None);
        }
    }

    pub fn add_listener(&self, listener: RegistryListener) {
        self.listeners.write().push(listener);
    }

    /// Live sources, in no particular order.
    pub fn sources(&self) -> Vec<Arc<MediaSource>> {
        self.sources.read().values().filter_map(Weak::upgrade).collect()
    }

    /// Force-close every source and fail every waiter. Used at shutdown.
    pub fn clear(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.done.complete(None);
        }
        for source in self.sources() {
            source.close(true);
        }
        self.sources.write().clear();
    }

    fn notify(&self, source: &MediaSource, registered: bool) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(source, registered);
        }
    }
}
