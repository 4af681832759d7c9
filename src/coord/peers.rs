use defmt::Format;
use heapless::Vec;

use crate::wire::MacAddr;

/// Discovery table capacity
pub const MAX_PEERS: usize = 8;

/// What is known about a device seen during discovery
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub struct PeerInfo {
    pub addr: MacAddr,
    pub first_seen_us: u64,
    pub last_seen_us: u64,
    pub beacons: u32,
    /// Round-trip time of the most recent answered ping
    pub last_rtt_us: Option<u32>,
    /// When the unanswered ping was sent
    pub ping_sent_at_us: Option<u64>,
    /// Timestamp the pong has to echo
    ping_stamp: u32,
    rtt_total_us: u64,
    rtt_count: u32,
}

impl PeerInfo {
    fn new(addr: MacAddr, now: u64) -> Self {
        Self {
            addr,
            first_seen_us: now,
            last_seen_us: now,
            beacons: 1,
            last_rtt_us: None,
            ping_sent_at_us: None,
            ping_stamp: 0,
            rtt_total_us: 0,
            rtt_count: 0,
        }
    }

    /// Average round-trip time of answered pings
    pub fn average_rtt_us(&self) -> u32 {
        crate::utils::average(self.rtt_total_us, self.rtt_count) as u32
    }

    pub fn rtt_samples(&self) -> u32 {
        self.rtt_count
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at_us.is_some()
    }

    fn add_rtt(&mut self, rtt_us: u32) {
        self.last_rtt_us = Some(rtt_us);
        self.rtt_total_us += rtt_us as u64;
        self.rtt_count += 1;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Observed {
    New,
    Known,
    /// Table full, not recorded
    Full,
}

/// Devices seen in the current cycle
///
/// Only the first one is ever addressed, the rest is kept for diagnostics.
#[derive(Default)]
pub struct PeerTable {
    peers: Vec<PeerInfo, MAX_PEERS>,
}

impl PeerTable {
    pub const fn new() -> Self {
        Self { peers: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    pub fn get(&self, addr: MacAddr) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.addr == addr)
    }

    /// Record a beacon from `addr`
    pub fn observe(&mut self, addr: MacAddr, now: u64) -> Observed {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.addr == addr) {
            peer.last_seen_us = now;
            peer.beacons = peer.beacons.saturating_add(1);
            return Observed::Known;
        }
        match self.peers.push(PeerInfo::new(addr, now)) {
            Ok(()) => Observed::New,
            Err(_) => Observed::Full,
        }
    }

    fn get_mut(&mut self, addr: MacAddr) -> Option<&mut PeerInfo> {
        self.peers.iter_mut().find(|p| p.addr == addr)
    }

    /// Mark a ping stamped with `stamp` as outstanding, false if `addr` is unknown
    pub fn ping_sent(&mut self, addr: MacAddr, stamp: u32, now: u64) -> bool {
        match self.get_mut(addr) {
            Some(peer) => {
                peer.ping_sent_at_us = Some(now);
                peer.ping_stamp = stamp;
                true
            },
            None => false,
        }
    }

    /// Stop waiting for the pong of the outstanding ping
    pub fn ping_abandoned(&mut self, addr: MacAddr) {
        if let Some(peer) = self.get_mut(addr) {
            peer.ping_sent_at_us = None;
        }
    }

    /// Resolve the outstanding ping if `stamp` echoes it
    pub fn pong(&mut self, addr: MacAddr, stamp: u32, rtt_us: u32) -> bool {
        match self.get_mut(addr) {
            Some(peer) if peer.ping_outstanding() && peer.ping_stamp == stamp => {
                peer.ping_sent_at_us = None;
                peer.add_rtt(rtt_us);
                true
            },
            _ => false,
        }
    }

    pub fn record_rtt(&mut self, addr: MacAddr, rtt_us: u32) {
        if let Some(peer) = self.get_mut(addr) {
            peer.add_rtt(rtt_us);
        }
    }
}
