use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use defmt::Format;

use super::pads::FeedbackMode;

/// Externally visible state of the input machine
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
#[repr(u8)]
pub enum Phase {
    Ready = 0,
    Armed = 1,
    Triggered = 2,
    Feedback = 3,
}

impl Phase {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Armed,
            2 => Self::Triggered,
            3 => Self::Feedback,
            _ => Self::Ready,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum OutcomeKind {
    Hit,
    Miss,
}

/// Result of one armed period
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// Time from arming to touch, 0 on miss
    pub reaction_us: u32,
    /// Index of the touched pad, 0 on miss
    pub pad: u8,
}

impl Outcome {
    pub const fn hit(reaction_us: u32, pad: u8) -> Self {
        Self { kind: OutcomeKind::Hit, reaction_us, pad }
    }

    pub const fn miss() -> Self {
        Self { kind: OutcomeKind::Miss, reaction_us: 0, pad: 0 }
    }

    pub fn is_hit(&self) -> bool {
        self.kind == OutcomeKind::Hit
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum ArmError {
    /// Input is not ready to be armed
    Busy(Phase),
    /// Previous command has not been picked up yet
    Pending,
}

/// Single-slot outcome mailbox between the input and service contexts
///
/// The producer writes the payload first and then sets `pending` with release
/// ordering, the consumer only reads the payload after observing `pending`
/// with acquire ordering. A new outcome is only written once the previous one
/// has been consumed, so the payload is never modified while visible.
pub struct Handoff {
    pending: AtomicBool,
    hit: AtomicBool,
    reaction_us: AtomicU32,
    pad: AtomicU8,
}

impl Handoff {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            hit: AtomicBool::new(false),
            reaction_us: AtomicU32::new(0),
            pad: AtomicU8::new(0),
        }
    }

    /// Producer side, returns false if the previous outcome is still pending
    pub fn publish(&self, outcome: Outcome) -> bool {
        if self.pending.load(Ordering::Acquire) {
            return false;
        }
        self.hit.store(outcome.is_hit(), Ordering::Relaxed);
        self.reaction_us.store(outcome.reaction_us, Ordering::Relaxed);
        self.pad.store(outcome.pad, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
        true
    }

    /// Consumer side
    pub fn take(&self) -> Option<Outcome> {
        if !self.pending.load(Ordering::Acquire) {
            return None;
        }
        let outcome = Outcome {
            kind: if self.hit.load(Ordering::Relaxed) { OutcomeKind::Hit } else { OutcomeKind::Miss },
            reaction_us: self.reaction_us.load(Ordering::Relaxed),
            pad: self.pad.load(Ordering::Relaxed),
        };
        self.pending.store(false, Ordering::Release);
        Some(outcome)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Discard an outcome that has not been consumed
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

const CMD_NONE: u8 = 0;
const CMD_ARM: u8 = 1;
const CMD_REARM: u8 = 2;
const CMD_DISARM: u8 = 3;

/// Command picked up by the input context on its next tick
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Command {
    Arm { timeout_ms: u32, mode: FeedbackMode },
    /// Disarm first if needed, then arm
    Rearm { timeout_ms: u32, mode: FeedbackMode },
    Disarm,
}

/// Everything shared between the input polling context and the service
///
/// The service requests arming through a one-slot command mailbox, observes the
/// machine through the published phase and receives outcomes through the
/// [`Handoff`] while subscribed. Lives in a `static` or in a scope that outlives
/// both contexts.
pub struct Control {
    command: AtomicU8,
    timeout_ms: AtomicU32,
    mode: AtomicU8,
    phase: AtomicU8,
    subscribed: AtomicBool,
    handoff: Handoff,
}

impl Control {
    pub const fn new() -> Self {
        Self {
            command: AtomicU8::new(CMD_NONE),
            timeout_ms: AtomicU32::new(0),
            mode: AtomicU8::new(0),
            phase: AtomicU8::new(Phase::Ready as u8),
            subscribed: AtomicBool::new(false),
            handoff: Handoff::new(),
        }
    }

    /// Request arming, rejected unless the input is ready
    pub fn arm(&self, timeout_ms: u32, mode: FeedbackMode) -> Result<(), ArmError> {
        match self.phase() {
            Phase::Ready => self.request(CMD_ARM, timeout_ms, mode),
            phase => Err(ArmError::Busy(phase)),
        }
    }

    /// Request arming, disarming first if the input is in any other state
    pub fn rearm(&self, timeout_ms: u32, mode: FeedbackMode) -> Result<(), ArmError> {
        self.request(CMD_REARM, timeout_ms, mode)
    }

    /// Force the input back to ready, replacing any pending command
    pub fn disarm(&self) {
        self.command.store(CMD_DISARM, Ordering::Release);
    }

    fn request(&self, cmd: u8, timeout_ms: u32, mode: FeedbackMode) -> Result<(), ArmError> {
        if self.command.load(Ordering::Acquire) != CMD_NONE {
            return Err(ArmError::Pending);
        }
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
        self.mode.store(mode.bits(), Ordering::Relaxed);
        self.command.store(cmd, Ordering::Release);
        Ok(())
    }

    /// Fetch the pending command, input context only
    ///
    /// Arguments are read while the command is still pending, so a new request
    /// cannot slip its arguments in. The command is only cleared if it did not
    /// change meanwhile (a disarm may replace it at any time).
    pub(super) fn take_command(&self) -> Option<Command> {
        loop {
            let cmd = self.command.load(Ordering::Acquire);
            if cmd == CMD_NONE {
                return None;
            }
            let timeout_ms = self.timeout_ms.load(Ordering::Relaxed);
            let mode = FeedbackMode::from_bits(self.mode.load(Ordering::Relaxed));
            if self.command
                .compare_exchange(cmd, CMD_NONE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            return match cmd {
                CMD_ARM => Some(Command::Arm { timeout_ms, mode }),
                CMD_REARM => Some(Command::Rearm { timeout_ms, mode }),
                CMD_DISARM => Some(Command::Disarm),
                _ => None,
            };
        }
    }

    /// Command written but not yet picked up by the input context
    pub fn command_pending(&self) -> bool {
        self.command.load(Ordering::Acquire) != CMD_NONE
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(super) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Start forwarding outcomes to the handoff
    pub fn subscribe(&self) {
        self.handoff.clear();
        self.subscribed.store(true, Ordering::Release);
    }

    /// Stop forwarding outcomes and drop any unconsumed one
    pub fn unsubscribe(&self) {
        self.subscribed.store(false, Ordering::Release);
        self.handoff.clear();
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    /// Consume a pending outcome
    pub fn take_outcome(&self) -> Option<Outcome> {
        self.handoff.take()
    }
}
