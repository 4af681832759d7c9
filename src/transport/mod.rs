//! Datagram transport over the pod radio
//!
//! A [`Link`] holds all state shared between the service context and the radio
//! driver callbacks. It is split once into a [`Transport`], used by the
//! coordination service for blocking sends and receives, and an [`RxHandle`],
//! the single place through which driver callbacks feed received frames.
//!
//! Broadcast sends only guarantee that the frame left the air, unicast sends
//! wait for the link-layer acknowledgement of the addressed radio. Nothing is
//! retried here.

mod semaphore;

use core::sync::atomic::{AtomicBool, Ordering};

use bbqueue::{BBBuffer, framed::{FrameConsumer, FrameProducer}};
use defmt::Format;
use heapless::Vec;

use crate::config::Timing;
use crate::time::Clock;
use crate::wire::{MacAddr, MAX_PAYLOAD};
pub use semaphore::Semaphore;

/// Default size of the receive queue in bytes
pub const RX_QUEUE_SIZE: usize = 2048;
/// Maximum number of received frames waiting in the queue
pub const RX_MAX_PENDING: u32 = 32;
/// Unicast destinations the transport keeps track of
pub const MAX_UNICAST_PEERS: usize = 16;

const ADDR_LEN: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Error {
    NotInitialized,
    AlreadyInitialized,
    InvalidArgument,
    Timeout,
    Io,
    Disconnected,
}

/// Error reported by the radio driver
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum RadioError {
    PeerExists,
    PeerNotFound,
    Disconnected,
    Driver(i32),
}

impl From<RadioError> for Error {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::PeerNotFound => Self::InvalidArgument,
            RadioError::Disconnected => Self::Disconnected,
            RadioError::PeerExists | RadioError::Driver(_) => Self::Io,
        }
    }
}

/// Raw radio driver primitives
///
/// Received frames must be passed to [`RxHandle::on_receive`] and the result of
/// every [`Radio::transmit`] must be reported with [`Link::on_send_complete`].
pub trait Radio {
    /// Power up the radio and start delivering callbacks
    fn start(&mut self) -> Result<(), RadioError>;
    fn stop(&mut self);
    /// Hardware address of this radio
    fn address(&self) -> MacAddr;
    fn add_peer(&mut self, addr: MacAddr) -> Result<(), RadioError>;
    fn remove_peer(&mut self, addr: MacAddr) -> Result<(), RadioError>;
    /// Queue a frame; completion is reported asynchronously
    fn transmit(&mut self, dest: MacAddr, data: &[u8]) -> Result<(), RadioError>;
}

/// State shared between the transport and the radio callbacks
pub struct Link<const N: usize = RX_QUEUE_SIZE> {
    queue: BBBuffer<N>,
    rx_ready: Semaphore,
    tx_done: Semaphore,
    tx_ok: AtomicBool,
    active: AtomicBool,
}

impl<const N: usize> Link<N> {
    pub const fn new() -> Self {
        Self {
            queue: BBBuffer::new(),
            rx_ready: Semaphore::new(RX_MAX_PENDING),
            tx_done: Semaphore::new(1),
            tx_ok: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    /// Split into the service and callback sides, can only be done once
    pub fn split<'a, R: Radio, C: Clock>(
        &'a self,
        radio: R,
        clock: &'a C,
        timing: &Timing,
    ) -> Result<(Transport<'a, R, C, N>, RxHandle<'a, N>), Error> {
        let (producer, consumer) = self.queue.try_split_framed()
            .map_err(|_| Error::AlreadyInitialized)?;
        let transport = Transport {
            radio,
            clock,
            link: self,
            rx: consumer,
            peers: Vec::new(),
            initialized: false,
            broadcast_timeout_ms: timing.broadcast_send_timeout_ms,
            unicast_timeout_ms: timing.unicast_send_timeout_ms,
        };
        let handle = RxHandle { link: self, tx: producer, dropped: 0 };
        Ok((transport, handle))
    }

    /// Send-completion callback of the radio driver
    ///
    /// `ok` is the link-level delivery status (acknowledged for unicast).
    pub fn on_send_complete(&self, ok: bool) {
        self.tx_ok.store(ok, Ordering::Relaxed);
        self.tx_done.give();
    }
}

/// Receive side of the link, owned by the radio driver callback
pub struct RxHandle<'a, const N: usize> {
    link: &'a Link<N>,
    tx: FrameProducer<'a, N>,
    dropped: u32,
}

impl<'a, const N: usize> RxHandle<'a, N> {
    /// Receive callback of the radio driver
    ///
    /// Queues the frame together with its source address. Frames arriving
    /// while the transport is not initialized, or that do not fit, are dropped.
    pub fn on_receive(&mut self, src: MacAddr, data: &[u8]) {
        if !self.link.active.load(Ordering::Acquire) || data.is_empty() || data.len() > MAX_PAYLOAD {
            return;
        }
        // Single producer, so the count can only decrease between check and give
        if self.link.rx_ready.is_full() {
            self.drop_frame();
            return;
        }
        let len = ADDR_LEN + data.len();
        let mut grant = match self.tx.grant(len) {
            Ok(grant) => grant,
            Err(_) => {
                self.drop_frame();
                return;
            },
        };
        grant[..ADDR_LEN].copy_from_slice(&src.0);
        grant[ADDR_LEN..len].copy_from_slice(data);
        grant.commit(len);
        self.link.rx_ready.give();
    }

    /// Number of frames dropped because the queue was full
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    fn drop_frame(&mut self) {
        self.dropped = self.dropped.wrapping_add(1);
        defmt::warn!("RX queue full, frame dropped ({=u32} total)", self.dropped);
    }
}

/// Blocking datagram transport used by the coordination service
pub struct Transport<'a, R, C, const N: usize> {
    radio: R,
    clock: &'a C,
    link: &'a Link<N>,
    rx: FrameConsumer<'a, N>,
    /// Unicast destinations registered with the radio, broadcast excluded
    peers: Vec<MacAddr, MAX_UNICAST_PEERS>,
    initialized: bool,
    broadcast_timeout_ms: u32,
    unicast_timeout_ms: u32,
}

impl<'a, R: Radio, C: Clock, const N: usize> Transport<'a, R, C, N> {
    /// Start the radio and register the broadcast destination
    pub fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }
        self.radio.start()?;
        match self.radio.add_peer(MacAddr::BROADCAST) {
            Ok(()) | Err(RadioError::PeerExists) => {},
            Err(e) => {
                self.radio.stop();
                return Err(e.into());
            },
        }
        self.link.active.store(true, Ordering::Release);
        self.initialized = true;
        defmt::info!("Transport up, address {}", self.radio.address());
        Ok(())
    }

    /// Unregister all destinations and stop the radio
    ///
    /// All calls fail with [`Error::NotInitialized`] afterwards.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        self.link.active.store(false, Ordering::Release);
        for addr in self.peers.iter().chain(core::iter::once(&MacAddr::BROADCAST)) {
            if let Err(e) = self.radio.remove_peer(*addr) {
                defmt::debug!("Removing {} failed: {}", addr, e);
            }
        }
        self.peers.clear();
        self.radio.stop();
        self.initialized = false;
        self.discard_pending();
        self.link.tx_done.drain();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn address(&self) -> MacAddr {
        self.radio.address()
    }

    /// Broadcast to all listeners, success means the frame was transmitted
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.transmit(MacAddr::BROADCAST, data, self.broadcast_timeout_ms)
            .map(drop)
    }

    /// Unicast to a registered peer, success means the peer acknowledged it
    pub fn send_to(&mut self, addr: MacAddr, data: &[u8]) -> Result<(), Error> {
        if self.transmit(addr, data, self.unicast_timeout_ms)? {
            Ok(())
        } else {
            Err(Error::Io)
        }
    }

    fn transmit(&mut self, dest: MacAddr, data: &[u8], timeout_ms: u32) -> Result<bool, Error> {
        self.check_initialized()?;
        if data.is_empty() || data.len() > MAX_PAYLOAD {
            return Err(Error::InvalidArgument);
        }

        // A completion from an earlier send that already timed out must not
        // satisfy this wait
        let stale = self.link.tx_done.drain();
        if stale > 0 {
            defmt::debug!("Dropped {=u32} stale send completion", stale);
        }

        self.radio.transmit(dest, data)?;
        if self.link.tx_done.take(self.clock, timeout_ms) {
            Ok(self.link.tx_ok.load(Ordering::Relaxed))
        } else {
            Err(Error::Timeout)
        }
    }

    /// Wait up to `timeout_ms` for a datagram
    ///
    /// Copies the datagram into `buf` (truncating if it does not fit) and
    /// returns its source address and copied length.
    pub fn receive(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<(MacAddr, usize), Error> {
        self.check_initialized()?;
        if !self.link.rx_ready.take(self.clock, timeout_ms) {
            return Err(Error::Timeout);
        }
        self.pop(buf).ok_or(Error::Timeout)
    }

    /// Non-blocking variant of [`Transport::receive`]
    pub fn try_receive(&mut self, buf: &mut [u8]) -> nb::Result<(MacAddr, usize), Error> {
        self.check_initialized()?;
        self.link.rx_ready.try_take()
            .map_err(|_| nb::Error::WouldBlock)?;
        self.pop(buf).ok_or(nb::Error::WouldBlock)
    }

    /// Drop all queued datagrams, returns their number
    pub fn discard_pending(&mut self) -> usize {
        let mut n = 0;
        while self.link.rx_ready.try_take().is_ok() {
            if let Some(grant) = self.rx.read() {
                grant.release();
            }
            n += 1;
        }
        n
    }

    fn pop(&mut self, buf: &mut [u8]) -> Option<(MacAddr, usize)> {
        let grant = self.rx.read()?;
        let mut src = [0; ADDR_LEN];
        src.copy_from_slice(&grant[..ADDR_LEN]);
        let data = &grant[ADDR_LEN..];
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        grant.release();
        Some((MacAddr(src), len))
    }

    /// Register a unicast destination, registering an existing one is not an error
    pub fn add_peer(&mut self, addr: MacAddr) -> Result<(), Error> {
        self.check_initialized()?;
        if addr.is_broadcast() || self.peers.contains(&addr) {
            return Ok(());
        }
        if self.peers.is_full() {
            return Err(Error::InvalidArgument);
        }
        match self.radio.add_peer(addr) {
            Ok(()) | Err(RadioError::PeerExists) => {},
            Err(e) => return Err(e.into()),
        }
        // capacity checked above
        self.peers.push(addr).ok();
        Ok(())
    }

    pub fn remove_peer(&mut self, addr: MacAddr) -> Result<(), Error> {
        self.check_initialized()?;
        self.radio.remove_peer(addr)?;
        self.peers.retain(|p| *p != addr);
        Ok(())
    }

    /// Number of registered unicast destinations, broadcast excluded
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn check_initialized(&self) -> Result<(), Error> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    #[cfg(test)]
    pub fn radio(&mut self) -> &mut R {
        &mut self.radio
    }
}
