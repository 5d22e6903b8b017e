//! Broadcast ring: one writer, many readers, with a GOP cache.
//!
//! Writers push batches of RTP packets (one access unit, or one received
//! packet) flagged as key or not. A key batch whose RTP timestamp differs
//! from the previous key batch restarts the cache, so parameter sets and
//! the IDR that shares their timestamp stay together. A reader attached
//! with `use_gop` first receives the cached batches, then live ones.
//!
//! Delivery runs under the ring lock, so reader callbacks must only hand
//! the batch off (post it to a channel); they never block on I/O.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::media::rtp::RtpPacket;

/// Packets written together; shared by every reader.
pub type RtpBatch = Arc<Vec<RtpPacket>>;

/// Default cap on cached batches.
pub const MAX_GOP_BATCHES: usize = 512;

type ReadFn = Box<dyn Fn(&RtpBatch) + Send + Sync>;
type DetachFn = Box<dyn FnOnce() + Send>;
type CountFn = Box<dyn Fn(usize) + Send + Sync>;

struct Reader {
    id: u64,
    on_read: ReadFn,
    on_detach: Option<DetachFn>,
}

#[derive(Default)]
struct RingState {
    readers: Vec<Reader>,
    gop: VecDeque<RtpBatch>,
    last_key_stamp: Option<u32>,
    next_id: u64,
}

pub struct RtpRing {
    state: Mutex<RingState>,
    max_gop: usize,
    on_reader_changed: Option<CountFn>,
}

impl RtpRing {
    pub fn new(max_gop: usize) -> Self {
        Self {
            state: Mutex::new(RingState::default()),
            max_gop,
            on_reader_changed: None,
        }
    }

    /// Ring that reports its reader count after every attach and detach.
    pub fn with_reader_callback(
        max_gop: usize,
        on_reader_changed: impl Fn(usize) + Send + Sync + 'static,
    ) -> Self {
        let mut ring = Self::new(max_gop);
        ring.on_reader_changed = Some(Box::new(on_reader_changed));
        ring
    }

    pub fn write(&self, batch: RtpBatch, key: bool) {
        let mut state = self.state.lock();
        if self.max_gop > 0 {
            let stamp = batch.first().map(|p| p.timestamp());
            if key && stamp != state.last_key_stamp {
                state.gop.clear();
                state.last_key_stamp = stamp;
            }
            // nothing decodable is cached before the first key batch
            if state.last_key_stamp.is_some() {
                state.gop.push_back(batch.clone());
                if state.gop.len() > self.max_gop {
                    state.gop.pop_front();
                }
            }
        }
        for reader in &state.readers {
            (reader.on_read)(&batch);
        }
    }

    /// Attach a reader. `on_detach` fires if the ring goes away while the
    /// returned handle is still alive; dropping the handle detaches quietly.
    pub fn attach(
        self: &Arc<Self>,
        use_gop: bool,
        on_read: impl Fn(&RtpBatch) + Send + Sync + 'static,
        on_detach: impl FnOnce() + Send + 'static,
    ) -> RingReader {
        let (id, count) = {
            let mut state = self.state.lock();
            if use_gop {
                for batch in &state.gop {
                    on_read(batch);
                }
            }
            let id = state.next_id;
            state.next_id += 1;
            state.readers.push(Reader {
                id,
                on_read: Box::new(on_read),
                on_detach: Some(Box::new(on_detach)),
            });
            (id, state.readers.len())
        };
        self.notify(count);
        RingReader {
            ring: Arc::downgrade(self),
            id,
        }
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn gop_len(&self) -> usize {
        self.state.lock().gop.len()
    }

    fn detach(&self, id: u64) {
        let count = {
            let mut state = self.state.lock();
            let before = state.readers.len();
            state.readers.retain(|r| r.id != id);
            if state.readers.len() == before {
                return;
            }
            state.readers.len()
        };
        self.notify(count);
    }

    fn notify(&self, count: usize) {
        if let Some(cb) = &self.on_reader_changed {
            cb(count);
        }
    }
}

impl Drop for RtpRing {
    fn drop(&mut self) {
        let readers = std::mem::take(&mut self.state.get_mut().readers);
        for mut reader in readers {
            if let Some(cb) = reader.on_detach.take() {
                cb();
            }
        }
    }
}

/// Handle of an attached reader.
pub struct RingReader {
    ring: Weak<RtpRing>,
    id: u64,
}

impl Drop for RingReader {
    fn drop(&mut self) {
        if let Some(ring) = self.ring.upgrade() {
            ring.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackType;
    use crate::media::rtp::RtpHeader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn batch(header: &mut RtpHeader, ts: u32, nal: u8) -> RtpBatch {
        let hdr = header.write(true, ts);
        Arc::new(vec![RtpPacket::from_parts(hdr, &[nal, 0], TrackType::Video, 90000)])
    }

    #[test]
    fn late_reader_gets_gop_from_last_key() {
        let ring = Arc::new(RtpRing::new(MAX_GOP_BATCHES));
        let mut h = RtpHeader::new(96, 1);
        ring.write(batch(&mut h, 0, 0x41), false);
        ring.write(batch(&mut h, 3000, 0x65), true);
        ring.write(batch(&mut h, 6000, 0x41), false);
        ring.write(batch(&mut h, 9000, 0x65), true);
        ring.write(batch(&mut h, 12000, 0x41), false);
        assert_eq!(ring.gop_len(), 2);

        let (tx, rx) = mpsc::channel();
        let _reader = ring.attach(
            true,
            move |b| tx.send(b[0].timestamp()).unwrap(),
            || {},
        );
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![9000, 12000]);
    }

    #[test]
    fn key_batches_sharing_a_stamp_stay_together() {
        let ring = Arc::new(RtpRing::new(MAX_GOP_BATCHES));
        let mut h = RtpHeader::new(96, 1);
        ring.write(batch(&mut h, 3000, 0x67), true);
        ring.write(batch(&mut h, 3000, 0x68), false);
        ring.write(batch(&mut h, 3000, 0x65), true);
        assert_eq!(ring.gop_len(), 3);
    }

    #[test]
    fn gop_is_capped() {
        let ring = Arc::new(RtpRing::new(4));
        let mut h = RtpHeader::new(96, 1);
        ring.write(batch(&mut h, 0, 0x65), true);
        for i in 1..10 {
            ring.write(batch(&mut h, i * 3000, 0x41), false);
        }
        assert_eq!(ring.gop_len(), 4);
    }

    #[test]
    fn reader_count_follows_attach_and_drop() {
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let s = seen.clone();
        let ring = Arc::new(RtpRing::with_reader_callback(0, move |n| {
            s.store(n, Ordering::SeqCst)
        }));
        let a = ring.attach(false, |_| {}, || {});
        let b = ring.attach(false, |_| {}, || {});
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        drop(a);
        assert_eq!(ring.reader_count(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_ring_detaches_readers_once() {
        let detached = Arc::new(AtomicUsize::new(0));
        let ring = Arc::new(RtpRing::new(0));
        let d = detached.clone();
        let reader = ring.attach(false, |_| {}, move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        drop(ring);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
        drop(reader);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }
}
