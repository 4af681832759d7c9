use defmt::Format;

use crate::periph::{Indicator, ModeControl};
use crate::time::Clock;
use crate::transport::Radio;
use crate::wire::{Body, Message};
use super::Service;

/// How discovery ended
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Discovery {
    /// All pings resolved, roles are to be assigned
    Complete,
    /// Peer announced a drill, we are the participant
    Joined,
    Stopped,
}

/// Per-cycle discovery progress
#[derive(Default)]
pub(super) struct DiscoveryState {
    /// When the peer was first seen
    pub(super) seen_at: Option<u64>,
    pub(super) sent: u8,
    /// Pings answered or given up on
    pub(super) resolved: u8,
    last_ping_at: Option<u64>,
    last_beacon_at: Option<u64>,
    beacons: u32,
}

impl<'a, R, C, M, I, const N: usize> Service<'a, R, C, M, I, N>
where
    R: Radio,
    C: Clock,
    M: ModeControl,
    I: Indicator,
{
    /// Find a peer and measure the link to it
    ///
    /// Beacons are broadcast the whole time. Once the first peer has been known
    /// for a while it is pinged a fixed number of times. A JoinDrill from the
    /// peer, or from any pod while no peer is known yet, ends discovery
    /// immediately.
    pub fn discover(&mut self) -> Discovery {
        defmt::info!("Discovery");
        loop {
            if !self.is_running() {
                return Discovery::Stopped;
            }
            if self.join_received {
                return Discovery::Joined;
            }

            self.beacon();
            if self.ping_phase() {
                return Discovery::Complete;
            }

            self.poll(self.timing.discovery_poll_ms);
        }
    }

    fn beacon(&mut self) {
        let state = &self.discovery;
        let due = state.last_beacon_at
            .map_or(true, |t| self.clock.expired(t, self.timing.beacon_interval_ms));
        if !due {
            return;
        }

        self.discovery.last_beacon_at = Some(self.clock.now_us());
        self.broadcast(Body::Beacon).ok();
        self.discovery.beacons += 1;
        let n = self.discovery.beacons;
        if n <= 3 || n % 10 == 0 {
            defmt::info!("Beacon #{=u32}", n);
        }
    }

    /// Drive the ping exchange, returns true once every ping is resolved
    fn ping_phase(&mut self) -> bool {
        let (Some(peer), Some(seen_at)) = (self.peer, self.discovery.seen_at) else {
            return false;
        };
        if !self.clock.expired(seen_at, self.timing.ping_delay_ms) {
            return false;
        }

        let sent_at = self.peers.get(peer).and_then(|info| info.ping_sent_at_us);
        if let Some(sent_at) = sent_at {
            if self.clock.expired(sent_at, self.timing.pong_timeout_ms) {
                defmt::warn!("Pong timeout ({=u8}/{=u8})", self.discovery.sent, self.timing.ping_count);
                self.peers.ping_abandoned(peer);
                self.discovery.resolved += 1;
            }
        }

        let outstanding = self.peers.get(peer).map_or(false, |info| info.ping_outstanding());
        let spaced = self.discovery.last_ping_at
            .map_or(true, |t| self.clock.expired(t, self.timing.ping_interval_ms));
        if !outstanding && self.discovery.sent < self.timing.ping_count && spaced {
            let now = self.clock.now_us();
            let stamp = self.clock.stamp();
            self.discovery.sent += 1;
            self.discovery.last_ping_at = Some(now);
            defmt::debug!("Ping #{=u8} to {}", self.discovery.sent, peer);
            let sent = self.transmit(Some(peer), Message::new(self.own, stamp, Body::Ping)).is_ok();
            // Not delivered or not tracked, nothing to wait for
            if !(sent && self.peers.ping_sent(peer, stamp, now)) {
                self.discovery.resolved += 1;
            }
        }

        if self.discovery.resolved >= self.timing.ping_count {
            if let Some(info) = self.peers.get(peer) {
                defmt::info!("Ping done, {=u32}/{=u8} answered, last rtt {} us, average rtt {=u32} us",
                    info.rtt_samples(), self.timing.ping_count, info.last_rtt_us, info.average_rtt_us());
            }
            return true;
        }
        false
    }
}
