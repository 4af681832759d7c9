//! Peer coordination service
//!
//! Runs in its own context and performs all blocking radio I/O. Each drill
//! cycle goes through discovery, role assignment and the drill loop of the
//! chosen role, then pauses and starts over:
//!
//! * discovery: broadcast beacons, adopt the first unseen pod as the peer and
//!   measure round-trip time with a series of pings; ends early when the peer
//!   announces a drill, which makes us the participant
//! * role assignment: lower hardware address coordinates
//! * drill loop: the coordinator alternates rounds between its own input and the
//!   peer's, the participant executes commands and reports its outcomes
//!
//! Outcomes of the local input arrive through [`Control`]. A dead peer is not an
//! error, the cycle just ends and discovery starts again.

mod discovery;
mod drill;
mod peers;
mod role;

use core::sync::atomic::{AtomicBool, Ordering};

use defmt::Format;
use rgb::RGB8;

use crate::config::Timing;
use crate::input::{Control, Outcome, Phase};
use crate::periph::{Indicator, ModeControl};
use crate::time::Clock;
use crate::transport::{self, Radio, Transport};
use crate::utils::stamp_delta;
use crate::wire::{Body, Message, MacAddr, MAX_PAYLOAD};
use discovery::DiscoveryState;
pub use discovery::Discovery;
pub use drill::{DrillReport, RoundResult, Target, MAX_ROUNDS};
pub use peers::{Observed, PeerInfo, PeerTable, MAX_PEERS};
pub use role::{elect, Role};

/// Granularity of pauses, bounds how late a stop request is noticed
const PAUSE_STEP_MS: u32 = 100;

/// Why a drill cycle ended
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Exit {
    /// Coordinator ran all rounds
    Finished,
    /// Participant received StopAll
    StopReceived,
    /// Participant heard nothing from the coordinator for too long
    HeartbeatLost,
    /// Service was asked to stop
    Stopped,
}

#[derive(Format)]
#[cfg_attr(test, derive(Debug))]
pub struct CycleReport {
    pub role: Option<Role>,
    pub drill: Option<DrillReport>,
    pub exit: Exit,
}

/// Coordination service of one pod
pub struct Service<'a, R, C, M, I, const N: usize> {
    transport: Transport<'a, R, C, N>,
    clock: &'a C,
    input: &'a Control,
    modes: M,
    indicator: I,
    timing: Timing,
    running: &'a AtomicBool,
    own: MacAddr,
    peers: PeerTable,
    peer: Option<MacAddr>,
    role: Option<Role>,
    join_received: bool,
    stop_received: bool,
    /// Outcome reported by the peer in the current round
    outcome: Option<Outcome>,
    last_peer_msg_us: u64,
    discovery: DiscoveryState,
}

impl<'a, R, C, M, I, const N: usize> Service<'a, R, C, M, I, N>
where
    R: Radio,
    C: Clock,
    M: ModeControl,
    I: Indicator,
{
    pub fn new(
        transport: Transport<'a, R, C, N>,
        clock: &'a C,
        input: &'a Control,
        modes: M,
        indicator: I,
        timing: Timing,
        running: &'a AtomicBool,
    ) -> Self {
        let own = transport.address();
        Self {
            transport,
            clock,
            input,
            modes,
            indicator,
            timing,
            running,
            own,
            peers: PeerTable::new(),
            peer: None,
            role: None,
            join_received: false,
            stop_received: false,
            outcome: None,
            last_peer_msg_us: 0,
            discovery: DiscoveryState::default(),
        }
    }

    /// Run drill cycles until stopped
    pub fn run(&mut self) -> Result<(), transport::Error> {
        if !self.transport.is_initialized() {
            self.transport.init()?;
        }
        defmt::info!("podlink {=str} ({=str}) at {}",
            crate::build_info::PKG_VERSION, crate::build_info::PROFILE, self.own);

        while self.is_running() {
            let report = self.run_cycle();
            defmt::info!("Cycle ended: {}", report.exit);
            self.pause(self.timing.restart_pause_ms);
        }

        self.reset_cycle();
        self.transport.shutdown();
        defmt::info!("Service stopped");
        Ok(())
    }

    /// Single discovery, role assignment and drill pass
    pub fn run_cycle(&mut self) -> CycleReport {
        self.reset_cycle();

        let role = match self.discover() {
            Discovery::Stopped => return CycleReport { role: None, drill: None, exit: Exit::Stopped },
            Discovery::Joined => {
                defmt::info!("Drill announced by {}, acting as participant", self.peer);
                Role::Participant
            },
            Discovery::Complete => self.assign_role(),
        };
        self.role = Some(role);

        match role {
            Role::Coordinator => {
                let drill = self.run_coordinator();
                let exit = if self.is_running() { Exit::Finished } else { Exit::Stopped };
                CycleReport { role: Some(role), drill: Some(drill), exit }
            },
            Role::Participant => {
                let exit = self.run_participant();
                CycleReport { role: Some(role), drill: None, exit }
            },
        }
    }

    /// Decide role from the hardware addresses
    pub fn assign_role(&mut self) -> Role {
        let role = match self.peer {
            Some(peer) => elect(self.own, peer),
            None => Role::Participant,
        };
        defmt::info!("Role {} (own {}, peer {})", role, self.own, self.peer);
        self.role = Some(role);
        role
    }

    /// Request the service to stop at the next check
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Address of the pod we drill with in this cycle
    pub fn peer(&self) -> Option<MacAddr> {
        self.peer
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn address(&self) -> MacAddr {
        self.own
    }

    pub fn modes(&self) -> &M {
        &self.modes
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    fn reset_cycle(&mut self) {
        self.peers.clear();
        self.peer = None;
        self.role = None;
        self.join_received = false;
        self.stop_received = false;
        self.outcome = None;
        self.discovery = DiscoveryState::default();
        self.input.unsubscribe();
    }

    /// Wait for one datagram and dispatch it, returns false on timeout
    fn poll(&mut self, timeout_ms: u32) -> bool {
        let mut buf = [0; MAX_PAYLOAD];
        match self.transport.receive(&mut buf, timeout_ms) {
            Ok((_, len)) => {
                self.handle_datagram(&buf[..len]);
                true
            },
            Err(transport::Error::Timeout) => false,
            Err(e) => {
                defmt::warn!("Receive failed: {}", e);
                self.clock.delay_ms(timeout_ms);
                false
            },
        }
    }

    /// Dispatch everything already queued without waiting
    fn poll_pending(&mut self) {
        let mut buf = [0; MAX_PAYLOAD];
        while let Ok((_, len)) = self.transport.try_receive(&mut buf) {
            self.handle_datagram(&buf[..len]);
        }
    }

    /// Process one received datagram
    ///
    /// Datagrams that cannot be decoded and our own broadcasts are dropped.
    pub fn handle_datagram(&mut self, data: &[u8]) {
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                defmt::debug!("Dropping datagram: {}", e);
                return;
            },
        };
        if msg.sender == self.own {
            return;
        }

        let now = self.clock.now_us();
        let sender = msg.sender;
        match msg.body {
            Body::Beacon => match self.peers.observe(sender, now) {
                Observed::New => {
                    defmt::info!("New peer {}", sender);
                    if self.peer.is_none() {
                        self.adopt_peer(sender);
                        self.discovery.seen_at = Some(now);
                    }
                },
                Observed::Known => {},
                Observed::Full => defmt::debug!("Peer table full, ignoring {}", sender),
            },
            Body::Ping => {
                if let Err(e) = self.transport.add_peer(sender) {
                    defmt::warn!("Could not register {}: {}", sender, e);
                }
                // Pong echoes the ping timestamp
                let pong = Message::new(self.own, msg.timestamp, Body::Pong);
                self.transmit(Some(sender), pong).ok();
            },
            Body::Pong => {
                let rtt = stamp_delta(self.clock.stamp(), msg.timestamp);
                if Some(sender) == self.peer && self.peers.pong(sender, msg.timestamp, rtt) {
                    defmt::info!("Pong from {}, rtt {=u32} us", sender, rtt);
                    self.discovery.resolved += 1;
                } else {
                    defmt::debug!("Unexpected pong from {}", sender);
                }
            },
            Body::JoinDrill => {
                // The peer is fixed for the whole cycle once known
                if self.role == Some(Role::Coordinator) || self.peer.map_or(false, |p| p != sender) {
                    defmt::debug!("Ignoring JoinDrill from {}", sender);
                    return;
                }
                defmt::info!("JoinDrill from {}", sender);
                self.join_received = true;
                if self.peer.is_none() {
                    self.peers.observe(sender, now);
                    self.adopt_peer(sender);
                }
                if !self.modes.enter_drill() {
                    defmt::warn!("Could not enter drill mode from {}", self.modes.current_mode());
                }
            },
            Body::ArmInput { timeout_ms, feedback } => {
                if self.role != Some(Role::Participant) || Some(sender) != self.peer {
                    defmt::debug!("Ignoring ArmInput from {}", sender);
                } else {
                    defmt::info!("Arm for {=u32} ms ({})", timeout_ms, feedback);
                    if !self.input.is_subscribed() {
                        self.input.subscribe();
                    }
                    if self.input.phase() != Phase::Ready {
                        defmt::debug!("Input busy in {}, forcing disarm", self.input.phase());
                    }
                    if let Err(e) = self.input.rearm(timeout_ms, feedback) {
                        defmt::warn!("Arm failed: {}", e);
                    }
                }
            },
            Body::SetIndicator { red, green, blue } => {
                if Some(sender) == self.peer {
                    self.indicator.set_color(RGB8::new(red, green, blue));
                }
            },
            Body::StopAll => {
                if !self.stop_received {
                    defmt::info!("StopAll from {}", sender);
                }
                self.stop_received = true;
            },
            Body::TouchEvent { reaction_us, pad } => self.peer_outcome(sender, Outcome::hit(reaction_us, pad)),
            Body::TimeoutEvent => self.peer_outcome(sender, Outcome::miss()),
        }

        // Heartbeat only counts messages from the pod we drill with
        if Some(sender) == self.peer {
            self.last_peer_msg_us = now;
        }
    }

    fn peer_outcome(&mut self, sender: MacAddr, outcome: Outcome) {
        if self.role == Some(Role::Coordinator) && Some(sender) == self.peer {
            self.outcome = Some(outcome);
        } else {
            defmt::debug!("Ignoring outcome from {}", sender);
        }
    }

    fn adopt_peer(&mut self, addr: MacAddr) {
        defmt::info!("Peer {} adopted", addr);
        self.peer = Some(addr);
        if let Err(e) = self.transport.add_peer(addr) {
            defmt::warn!("Could not register {}: {}", addr, e);
        }
    }

    fn message(&self, body: Body) -> Message {
        Message::new(self.own, self.clock.stamp(), body)
    }

    fn broadcast(&mut self, body: Body) -> Result<(), transport::Error> {
        let msg = self.message(body);
        self.transmit(None, msg)
    }

    fn send_peer(&mut self, body: Body) -> Result<(), transport::Error> {
        let peer = self.peer.ok_or(transport::Error::InvalidArgument)?;
        let msg = self.message(body);
        self.transmit(Some(peer), msg)
    }

    fn transmit(&mut self, dest: Option<MacAddr>, msg: Message) -> Result<(), transport::Error> {
        let frame = msg.encode().map_err(|e| {
            defmt::error!("Encoding {} failed: {}", msg.kind(), e);
            transport::Error::InvalidArgument
        })?;
        let result = match dest {
            Some(addr) => self.transport.send_to(addr, &frame),
            None => self.transport.send(&frame),
        };
        if let Err(e) = result {
            defmt::warn!("Sending {} failed: {}", msg.kind(), e);
        }
        result
    }

    /// Sleep without servicing the radio, returns early when stopped
    fn pause(&self, ms: u32) {
        let mut remaining = ms;
        while remaining > 0 && self.is_running() {
            let step = remaining.min(PAUSE_STEP_MS);
            self.clock.delay_ms(step);
            remaining -= step;
        }
    }

    #[cfg(test)]
    fn transport(&mut self) -> &mut Transport<'a, R, C, N> {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicBool;

    use super::*;
    use crate::config::CONFIG;
    use crate::input::FeedbackMode;
    use crate::periph::Mode;
    use crate::sim::{self, Air, SimIndicator, SimModes, StdClock, POD_1, POD_2, POD_3};
    use crate::transport::Link;

    fn frame(sender: MacAddr, body: Body) -> crate::wire::Frame {
        Message::new(sender, 1234, body).encode().unwrap()
    }

    macro_rules! single_node {
        ($clock:ident, $link:ident, $control:ident, $running:ident, $air:ident, $service:ident) => {
            let $clock = StdClock::new();
            let $link = Link::<1024>::new();
            let $control = Control::new();
            let $running = AtomicBool::new(true);
            let $air = Air::new();
            let transport = sim::node(&$air, &$link, &$clock, POD_1, &CONFIG);
            #[allow(unused_mut)]
            let mut $service = Service::new(transport, &$clock, &$control,
                SimModes::new(), SimIndicator::default(), sim::fast_timing(), &$running);
        };
    }

    #[test]
    fn malformed_datagram_dropped() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        let peers = service.peers().len();

        service.handle_datagram(&[0x01, 0x02, 0x00]);
        service.handle_datagram(&[]);
        let arm = frame(POD_2, Body::ArmInput { timeout_ms: 100, feedback: FeedbackMode::default() });
        service.handle_datagram(&arm[..12]);

        assert_eq!(service.peers().len(), peers);
        assert_eq!(service.peer(), Some(POD_2));
        assert_eq!(control.phase(), Phase::Ready);
        assert!(!control.command_pending());
    }

    #[test]
    fn malformed_datagram_over_the_air() {
        single_node!(clock, link, control, running, air, service);
        air.inject(POD_2, POD_1, &[0x01; 5]);
        air.inject(POD_2, POD_1, &frame(POD_2, Body::Beacon));
        assert!(service.poll(10));
        assert!(service.peers().is_empty());
        assert!(service.poll(10));
        assert_eq!(service.peers().len(), 1);
    }

    #[test]
    fn own_messages_ignored() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_1, Body::Beacon));
        assert!(service.peers().is_empty());
        assert_eq!(service.peer(), None);
    }

    #[test]
    fn duplicate_beacon_is_idempotent() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        let seen_at = service.discovery.seen_at;
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        assert_eq!(service.peers().len(), 1);
        assert_eq!(service.peer(), Some(POD_2));
        assert_eq!(service.discovery.seen_at, seen_at);
        assert_eq!(service.peers().get(POD_2).unwrap().beacons, 2);
    }

    #[test]
    fn first_peer_wins() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_3, Body::Beacon));
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        assert_eq!(service.peers().len(), 2);
        assert_eq!(service.peer(), Some(POD_3));
    }

    #[test]
    fn duplicate_stop_is_idempotent() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        service.handle_datagram(&frame(POD_2, Body::StopAll));
        service.handle_datagram(&frame(POD_2, Body::StopAll));
        assert!(service.stop_received);
        assert_eq!(service.peers().len(), 1);
        assert_eq!(service.peer(), Some(POD_2));
    }

    #[test]
    fn ping_answered_with_echo() {
        let clock = StdClock::new();
        let (link, other) = (Link::<1024>::new(), Link::<1024>::new());
        let control = Control::new();
        let running = AtomicBool::new(true);
        let air = Air::new();
        let transport = sim::node(&air, &link, &clock, POD_1, &CONFIG);
        let mut service = Service::new(transport, &clock, &control,
            SimModes::new(), SimIndicator::default(), sim::fast_timing(), &running);
        let mut remote = sim::node(&air, &other, &clock, POD_2, &CONFIG);

        service.handle_datagram(&Message::new(POD_2, 0xdeadbeef, Body::Ping).encode().unwrap());
        assert_eq!(service.transport().peer_count(), 1);

        let mut buf = [0; 32];
        let (src, len) = remote.receive(&mut buf, 100).unwrap();
        assert_eq!(src, POD_1);
        let pong = Message::decode(&buf[..len]).unwrap();
        assert_eq!(pong.body, Body::Pong);
        assert_eq!(pong.timestamp, 0xdeadbeef);
    }

    #[test]
    fn pong_resolves_outstanding_ping() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        service.handle_datagram(&frame(POD_2, Body::Pong));
        assert_eq!(service.discovery.resolved, 0);

        service.peers.ping_sent(POD_2, 1234, clock.now_us());
        service.handle_datagram(&Message::new(POD_2, 999, Body::Pong).encode().unwrap());
        service.handle_datagram(&frame(POD_3, Body::Pong));
        assert_eq!(service.discovery.resolved, 0);
        assert!(service.peers().get(POD_2).unwrap().ping_outstanding());

        service.handle_datagram(&frame(POD_2, Body::Pong));
        assert_eq!(service.discovery.resolved, 1);
        let info = service.peers().get(POD_2).unwrap();
        assert!(!info.ping_outstanding());
        assert!(info.last_rtt_us.is_some());
        assert_eq!(info.rtt_samples(), 1);
    }

    #[test]
    fn join_adopts_sender_without_peer() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_3, Body::JoinDrill));
        assert!(service.join_received);
        assert_eq!(service.peer(), Some(POD_3));
        assert_eq!(service.peers().len(), 1);
        assert_eq!(service.modes().current_mode(), Mode::Drill);
    }

    #[test]
    fn join_from_stranger_keeps_peer() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        service.handle_datagram(&frame(POD_3, Body::JoinDrill));
        assert!(!service.join_received);
        assert_eq!(service.peer(), Some(POD_2));
        assert_eq!(service.modes().current_mode(), Mode::Booting);

        // the real coordinator can still arm us
        service.role = Some(Role::Participant);
        let last = service.last_peer_msg_us;
        clock.delay_ms(2);
        service.handle_datagram(&frame(POD_3, Body::JoinDrill));
        assert_eq!(service.last_peer_msg_us, last);
        service.handle_datagram(&frame(POD_2, Body::ArmInput { timeout_ms: 100, feedback: FeedbackMode::default() }));
        assert_eq!(service.peer(), Some(POD_2));
        assert!(control.command_pending());
    }

    #[test]
    fn coordinator_ignores_join() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        service.role = Some(Role::Coordinator);
        service.handle_datagram(&frame(POD_3, Body::JoinDrill));
        service.handle_datagram(&frame(POD_2, Body::JoinDrill));
        assert!(!service.join_received);
        assert_eq!(service.peer(), Some(POD_2));
    }

    #[test]
    fn arm_only_from_coordinator() {
        single_node!(clock, link, control, running, air, service);
        let arm = frame(POD_2, Body::ArmInput { timeout_ms: 100, feedback: FeedbackMode::default() });
        service.handle_datagram(&frame(POD_2, Body::JoinDrill));

        // role not decided yet
        service.handle_datagram(&arm);
        assert!(!control.command_pending());

        service.role = Some(Role::Participant);
        service.handle_datagram(&frame(POD_3, Body::ArmInput { timeout_ms: 100, feedback: FeedbackMode::default() }));
        assert!(!control.command_pending());
        service.handle_datagram(&arm);
        assert!(control.command_pending());
        assert!(control.is_subscribed());
    }

    #[test]
    fn indicator_from_peer() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        service.handle_datagram(&frame(POD_3, Body::SetIndicator { red: 1, green: 2, blue: 3 }));
        assert_eq!(service.indicator().color, None);
        service.handle_datagram(&frame(POD_2, Body::SetIndicator { red: 1, green: 2, blue: 3 }));
        assert_eq!(service.indicator().color, Some(RGB8::new(1, 2, 3)));
    }

    #[test]
    fn heartbeat_only_from_peer() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        let last = service.last_peer_msg_us;
        clock.delay_ms(2);
        service.handle_datagram(&frame(POD_3, Body::Beacon));
        assert_eq!(service.last_peer_msg_us, last);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        assert!(service.last_peer_msg_us > last);
    }

    #[test]
    fn outcome_only_for_coordinator() {
        single_node!(clock, link, control, running, air, service);
        service.handle_datagram(&frame(POD_2, Body::Beacon));
        service.handle_datagram(&frame(POD_2, Body::TimeoutEvent));
        assert_eq!(service.outcome, None);

        service.role = Some(Role::Coordinator);
        service.handle_datagram(&frame(POD_3, Body::TimeoutEvent));
        assert_eq!(service.outcome, None);
        service.handle_datagram(&frame(POD_2, Body::TouchEvent { reaction_us: 250_000, pad: 1 }));
        assert_eq!(service.outcome, Some(Outcome::hit(250_000, 1)));
    }

    #[test]
    fn stopped_before_discovery() {
        single_node!(clock, link, control, running, air, service);
        service.stop();
        let report = service.run_cycle();
        assert_eq!(report.exit, Exit::Stopped);
        assert_eq!(report.role, None);
    }
}
