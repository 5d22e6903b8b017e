//! Shared RTP multicast groups.
//!
//! Every player that SETUPs a stream with `multicast` joins the same group:
//! one [`RtpMulticaster`] per [`StreamIdentity`], reading the source's ring
//! once and sending each packet to `group:port`. Sessions hold the `Arc`;
//! the manager only keeps a weak entry, so the group is torn down with its
//! last player. If the source goes away first, every registered detach
//! callback fires once.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak, mpsc};
use std::thread;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::media::TrackType;
use crate::source::{MediaSource, RingReader, RtpBatch, StreamIdentity};

use super::udp::UdpPortAllocator;

type DetachFn = Box<dyn FnOnce() + Send>;

/// Hands out group addresses from a configured range, never two at once.
struct AddressPool {
    first: u32,
    last: u32,
    next: u32,
    in_use: HashSet<u32>,
}

impl AddressPool {
    fn new(range: RangeInclusive<Ipv4Addr>) -> Self {
        let first = u32::from(*range.start());
        Self {
            first,
            last: u32::from(*range.end()).max(first),
            next: first,
            in_use: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Option<Ipv4Addr> {
        let span = (self.last - self.first) as u64 + 1;
        for _ in 0..span {
            let addr = self.next;
            self.next = if addr >= self.last { self.first } else { addr + 1 };
            if self.in_use.insert(addr) {
                return Some(Ipv4Addr::from(addr));
            }
        }
        None
    }

    fn release(&mut self, addr: Ipv4Addr) {
        self.in_use.remove(&u32::from(addr));
    }
}

struct GroupTrack {
    track_type: TrackType,
    rtp: UdpSocket,
    // keeps the advertised RTCP port reserved
    _rtcp: UdpSocket,
    ports: (u16, u16),
}

pub struct MulticastManager {
    groups: Mutex<HashMap<StreamIdentity, Weak<RtpMulticaster>>>,
    pool: Mutex<AddressPool>,
    udp: Arc<UdpPortAllocator>,
    ttl: u32,
}

impl MulticastManager {
    pub fn new(range: RangeInclusive<Ipv4Addr>, ttl: u32, udp: Arc<UdpPortAllocator>) -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
            pool: Mutex::new(AddressPool::new(range)),
            udp,
            ttl,
        })
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// The group for `source`, created on first use.
    pub fn get(self: &Arc<Self>, local_ip: IpAddr, source: &Arc<MediaSource>) -> Result<Arc<RtpMulticaster>> {
        if let Some(existing) = self.lookup(source.identity()) {
            return Ok(existing);
        }
        // binding and attaching take other locks, so the table is not held here
        let caster = self.create(local_ip, source)?;
        let mut groups = self.groups.lock();
        if let Some(existing) = groups.get(source.identity()).and_then(Weak::upgrade) {
            drop(groups);
            tracing::debug!(source = %source.identity(), "multicast group created concurrently, reusing it");
            // dropping the spare returns its address through `release`
            drop(caster);
            return Ok(existing);
        }
        groups.insert(source.identity().clone(), Arc::downgrade(&caster));
        Ok(caster)
    }

    fn lookup(&self, identity: &StreamIdentity) -> Option<Arc<RtpMulticaster>> {
        self.groups.lock().get(identity).and_then(Weak::upgrade)
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().values().filter(|w| w.strong_count() > 0).count()
    }

    fn create(self: &Arc<Self>, local_ip: IpAddr, source: &Arc<MediaSource>) -> Result<Arc<RtpMulticaster>> {
        if !local_ip.is_ipv4() {
            return Err(RtspError::TransportAllocationFailed(
                "multicast needs an IPv4 interface".into(),
            ));
        }
        let group = self.pool.lock().allocate().ok_or_else(|| {
            RtspError::TransportAllocationFailed("multicast address range exhausted".into())
        })?;

        let tracks = match self.bind_tracks(local_ip, source) {
            Ok(tracks) => Arc::new(tracks),
            Err(e) => {
                self.pool.lock().release(group);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel::<RtpBatch>();
        let sender_tracks = tracks.clone();
        thread::Builder::new()
            .name("rtp-multicast".into())
            .spawn(move || {
                for batch in rx {
                    for packet in batch.iter() {
                        let Some(t) = sender_tracks.iter().find(|t| t.track_type == packet.track_type) else {
                            continue;
                        };
                        let dst = SocketAddr::new(IpAddr::V4(group), t.ports.0);
                        if let Err(e) = t.rtp.send_to(packet.as_bytes(), dst) {
                            tracing::trace!(%dst, error = %e, "multicast send failed");
                        }
                    }
                }
            })?;

        let caster = Arc::new(RtpMulticaster {
            identity: source.identity().clone(),
            group,
            tracks,
            reader: Mutex::new(None),
            detach: Arc::new(Mutex::new(HashMap::new())),
            manager: Arc::downgrade(self),
        });

        let tx = Mutex::new(tx);
        let detach = caster.detach.clone();
        let reader = source.ring().attach(
            true,
            move |batch| {
                let _ = tx.lock().send(batch.clone());
            },
            move || {
                let callbacks: Vec<DetachFn> = detach.lock().drain().map(|(_, cb)| cb).collect();
                for cb in callbacks {
                    cb();
                }
            },
        );
        *caster.reader.lock() = Some(reader);
        tracing::info!(source = %caster.identity, %group, "multicast group created");
        Ok(caster)
    }

    fn bind_tracks(&self, local_ip: IpAddr, source: &MediaSource) -> Result<Vec<GroupTrack>> {
        let mut tracks = Vec::new();
        for t in source.tracks() {
            let (rtp, rtcp) = self.udp.bind_pair(local_ip)?;
            if let Err(e) = rtp.set_multicast_ttl_v4(self.ttl) {
                tracing::warn!(error = %e, "can not set multicast ttl");
            }
            let ports = (rtp.local_addr()?.port(), rtcp.local_addr()?.port());
            tracks.push(GroupTrack {
                track_type: t.track_type,
                rtp,
                _rtcp: rtcp,
                ports,
            });
        }
        Ok(tracks)
    }

    fn release(&self, identity: &StreamIdentity, group: Ipv4Addr) {
        let mut groups = self.groups.lock();
        if groups.get(identity).is_some_and(|w| w.strong_count() == 0) {
            groups.remove(identity);
        }
        drop(groups);
        self.pool.lock().release(group);
    }
}

pub struct RtpMulticaster {
    identity: StreamIdentity,
    group: Ipv4Addr,
    tracks: Arc<Vec<GroupTrack>>,
    reader: Mutex<Option<RingReader>>,
    detach: Arc<Mutex<HashMap<u64, DetachFn>>>,
    manager: Weak<MulticastManager>,
}

impl RtpMulticaster {
    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    /// (RTP, RTCP) ports of the track, which are also the destination ports.
    pub fn ports(&self, track_type: TrackType) -> Option<(u16, u16)> {
        self.tracks
            .iter()
            .find(|t| t.track_type == track_type)
            .map(|t| t.ports)
    }

    /// Register `cb` to run once if the source goes away under the group.
    pub fn set_detach(&self, session: u64, cb: impl FnOnce() + Send + 'static) {
        self.detach.lock().insert(session, Box::new(cb));
    }

    pub fn remove_detach(&self, session: u64) {
        self.detach.lock().remove(&session);
    }
}

impl Drop for RtpMulticaster {
    fn drop(&mut self) {
        self.reader.get_mut().take();
        tracing::info!(source = %self.identity, group = %self.group, "multicast group released");
        if let Some(manager) = self.manager.upgrade() {
            manager.release(&self.identity, self.group);
        }
    }
}
