//! Host-side doubles for multi-pod tests
//!
//! [`Air`] connects the [`RxHandle`]s of any number of simulated pods. Frames
//! are delivered synchronously, unicast frames are acknowledged when the
//! destination is on the air and not filtered out.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::boxed::Box;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use std::vec::Vec;

use rgb::RGB8;

use crate::config::{Timing, CONFIG};
use crate::input::{Control, Feedback, InputMachine, TouchPads};
use crate::periph::{Indicator, Mode, ModeControl};
use crate::time::Clock;
use crate::transport::{Link, Radio, RadioError, RxHandle, Transport};
use crate::wire::MacAddr;

pub const POD_1: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
pub const POD_2: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
pub const POD_3: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x03]);

/// Timings scaled down so that a full cycle takes a couple of seconds
pub fn fast_timing() -> Timing {
    Timing {
        beacon_interval_ms: 50,
        discovery_poll_ms: 20,
        ping_delay_ms: 100,
        ping_count: 3,
        ping_interval_ms: 20,
        pong_timeout_ms: 100,
        rounds: 10,
        arm_timeout_ms: 400,
        round_margin_ms: 200,
        inter_round_ms: 50,
        join_settle_ms: 50,
        heartbeat_ms: 1500,
        restart_pause_ms: 100,
        peer_round_poll_ms: 10,
        participant_poll_ms: 10,
        local_round_poll_ms: 5,
        feedback_ms: 20,
        broadcast_send_timeout_ms: 50,
        unicast_send_timeout_ms: 50,
        ..CONFIG
    }
}

/// Wall clock
pub struct StdClock {
    start: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for StdClock {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn delay_us(&self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

/// Clock that only moves when told to (or when delaying)
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: AtomicU64::new(0) }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay_us(&self, us: u32) {
        self.now.fetch_add(us as u64, Ordering::SeqCst);
    }
}

/// Returns true for frames (src, dst, data) that should be lost
type Filter = Box<dyn Fn(MacAddr, MacAddr, &[u8]) -> bool + Send>;

struct Node<'l, const N: usize> {
    addr: MacAddr,
    rx: RxHandle<'l, N>,
}

/// Shared radio medium
pub struct Air<'l, const N: usize> {
    nodes: Mutex<Vec<Node<'l, N>>>,
    filter: Mutex<Option<Filter>>,
}

impl<'l, const N: usize> Air<'l, N> {
    pub fn new() -> Self {
        Self { nodes: Mutex::new(Vec::new()), filter: Mutex::new(None) }
    }

    pub fn attach(&self, addr: MacAddr, rx: RxHandle<'l, N>) {
        self.nodes.lock().unwrap().push(Node { addr, rx });
    }

    pub fn set_filter(&self, filter: impl Fn(MacAddr, MacAddr, &[u8]) -> bool + Send + 'static) {
        *self.filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// Radio transmission, returns true if any pod received the frame
    fn transmit(&self, src: MacAddr, dst: MacAddr, data: &[u8]) -> bool {
        let lost = self.filter.lock().unwrap()
            .as_ref()
            .map_or(false, |f| f(src, dst, data));
        !lost && self.inject(src, dst, data)
    }

    /// Put a frame on the air bypassing the filter
    pub fn inject(&self, src: MacAddr, dst: MacAddr, data: &[u8]) -> bool {
        let mut delivered = false;
        for node in self.nodes.lock().unwrap().iter_mut() {
            if node.addr != src && (dst.is_broadcast() || node.addr == dst) {
                node.rx.on_receive(src, data);
                delivered = true;
            }
        }
        delivered
    }
}

pub struct SimRadio<'s, 'l, const N: usize> {
    air: &'s Air<'l, N>,
    link: &'l Link<N>,
    addr: MacAddr,
    peers: Vec<MacAddr>,
    on: bool,
}

impl<'s, 'l, const N: usize> Radio for SimRadio<'s, 'l, N> {
    fn start(&mut self) -> Result<(), RadioError> {
        self.on = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.on = false;
    }

    fn address(&self) -> MacAddr {
        self.addr
    }

    fn add_peer(&mut self, addr: MacAddr) -> Result<(), RadioError> {
        if self.peers.contains(&addr) {
            return Err(RadioError::PeerExists);
        }
        self.peers.push(addr);
        Ok(())
    }

    fn remove_peer(&mut self, addr: MacAddr) -> Result<(), RadioError> {
        let i = self.peers.iter().position(|p| *p == addr).ok_or(RadioError::PeerNotFound)?;
        self.peers.remove(i);
        Ok(())
    }

    fn transmit(&mut self, dest: MacAddr, data: &[u8]) -> Result<(), RadioError> {
        if !self.on {
            return Err(RadioError::Disconnected);
        }
        if !self.peers.contains(&dest) {
            return Err(RadioError::PeerNotFound);
        }
        let acked = self.air.transmit(self.addr, dest, data);
        self.link.on_send_complete(dest.is_broadcast() || acked);
        Ok(())
    }
}

/// Initialized transport of a pod attached to `air`
pub fn node<'s, 'l, const N: usize>(
    air: &'s Air<'l, N>,
    link: &'l Link<N>,
    clock: &'l StdClock,
    addr: MacAddr,
    timing: &Timing,
) -> Transport<'l, SimRadio<'s, 'l, N>, StdClock, N> {
    let radio = SimRadio { air, link, addr, peers: Vec::new(), on: false };
    let (mut transport, rx) = link.split(radio, clock, timing).unwrap();
    air.attach(addr, rx);
    transport.init().unwrap();
    transport
}

/// Mode manager that refuses to jump from booting straight into a drill
pub struct SimModes {
    mode: Mode,
    pub history: Vec<Mode>,
}

impl SimModes {
    pub fn new() -> Self {
        Self { mode: Mode::Booting, history: Vec::new() }
    }
}

impl ModeControl for SimModes {
    fn current_mode(&self) -> Mode {
        self.mode
    }

    fn transition_to(&mut self, mode: Mode) -> bool {
        if self.mode == Mode::Booting && mode == Mode::Drill {
            return false;
        }
        self.mode = mode;
        self.history.push(mode);
        true
    }
}

#[derive(Default)]
pub struct SimIndicator {
    pub color: Option<RGB8>,
    pub changes: usize,
}

impl Indicator for SimIndicator {
    fn set_color(&mut self, color: RGB8) {
        self.color = Some(color);
        self.changes += 1;
    }

    fn clear(&mut self) {
        self.color = None;
    }
}

#[derive(Default)]
pub struct SimFeedback {
    pub flashes: usize,
    pub tones: usize,
}

impl Feedback for SimFeedback {
    fn flash(&mut self, _color: RGB8, _duration_ms: u32) {
        self.flashes += 1;
    }

    fn tone(&mut self, _duration_ms: u32) {
        self.tones += 1;
    }
}

/// Single pad touched a fixed time after every arming
pub struct ReflexPads<'c> {
    clock: &'c StdClock,
    delay_us: Option<u64>,
    armed_at: u64,
}

impl<'c> ReflexPads<'c> {
    pub fn after_ms(clock: &'c StdClock, ms: u64) -> Self {
        Self { clock, delay_us: Some(ms * 1000), armed_at: 0 }
    }

    pub fn never(clock: &'c StdClock) -> Self {
        Self { clock, delay_us: None, armed_at: 0 }
    }
}

impl<'c> TouchPads for ReflexPads<'c> {
    fn count(&self) -> usize {
        1
    }

    fn is_touched(&mut self, _pad: usize) -> bool {
        self.delay_us
            .map_or(false, |delay| self.clock.elapsed_us(self.armed_at) >= delay)
    }

    fn reset(&mut self) {
        self.armed_at = self.clock.now_us();
    }
}

/// Input polling context of a simulated pod, 1 ms period
pub fn run_input<P: TouchPads>(pads: P, clock: &StdClock, control: &Control, running: &AtomicBool, timing: Timing) {
    let mut input = InputMachine::new(pads, SimFeedback::default(), clock, control, timing);
    input.run(running, 1000);
}
