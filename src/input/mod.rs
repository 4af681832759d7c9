//! Touch input state machine
//!
//! Runs in the fast input polling context. Each [`InputMachine::tick`] applies
//! commands from the service, polls the pads while armed and, when a round
//! ends, plays local feedback and hands the [`Outcome`] over to the service.
//! Nothing here blocks.

mod control;
mod pads;

use core::sync::atomic::{AtomicBool, Ordering};

use smlang::statemachine;

use crate::config::Timing;
use crate::time::Clock;
pub use control::{ArmError, Command, Control, Handoff, Outcome, OutcomeKind, Phase};
pub use pads::{Feedback, FeedbackMode, TouchPads};

statemachine! {
    transitions: {
        *Ready + Arm / start = Armed,
        // Touch is reported within the same tick it was detected
        Armed + Touch / capture = Triggered,
        Armed + Expire / miss = Feedback,
        Triggered + Report / hit = Feedback,
        Feedback + Settle = Ready,

        Ready + Disarm / reset = Ready,
        Armed + Disarm / reset = Ready,
        Triggered + Disarm / reset = Ready,
        Feedback + Disarm / reset = Ready,
    }
}

/// Data of the current armed period
pub struct Context {
    now: u64,
    armed_at: u64,
    timeout_us: u64,
    mode: FeedbackMode,
    pad: u8,
    reaction_us: u32,
    feedback_at: u64,
    outcome: Option<Outcome>,
}

impl StateMachineContext for Context {
    fn start(&mut self) {
        self.armed_at = self.now;
        self.reaction_us = 0;
        self.outcome = None;
    }

    fn capture(&mut self) {
        self.reaction_us = u32::try_from(self.now.saturating_sub(self.armed_at))
            .unwrap_or(u32::MAX);
    }

    fn hit(&mut self) {
        self.feedback_at = self.now;
        self.outcome = Some(Outcome::hit(self.reaction_us, self.pad));
    }

    fn miss(&mut self) {
        self.feedback_at = self.now;
        self.outcome = Some(Outcome::miss());
    }

    fn reset(&mut self) {
        self.outcome = None;
    }
}

/// Input state machine together with its pads, feedback outputs and the
/// shared [`Control`] block
pub struct InputMachine<'a, P, F, C> {
    fsm: StateMachine<Context>,
    pads: P,
    feedback: F,
    clock: &'a C,
    control: &'a Control,
    timing: Timing,
}

impl<'a, P: TouchPads, F: Feedback, C: Clock> InputMachine<'a, P, F, C> {
    pub fn new(pads: P, feedback: F, clock: &'a C, control: &'a Control, timing: Timing) -> Self {
        let context = Context {
            now: 0,
            armed_at: 0,
            timeout_us: 0,
            mode: FeedbackMode::default(),
            pad: 0,
            reaction_us: 0,
            feedback_at: 0,
            outcome: None,
        };
        control.set_phase(Phase::Ready);
        Self {
            fsm: StateMachine::new(context),
            pads,
            feedback,
            clock,
            control,
            timing,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.fsm.state() {
            States::Ready => Phase::Ready,
            States::Armed => Phase::Armed,
            States::Triggered => Phase::Triggered,
            States::Feedback => Phase::Feedback,
        }
    }

    /// Arm directly from the polling context
    pub fn arm(&mut self, timeout_ms: u32, mode: FeedbackMode) -> Result<(), ArmError> {
        let phase = self.phase();
        if phase != Phase::Ready {
            defmt::warn!("Arm rejected in {}", phase);
            return Err(ArmError::Busy(phase));
        }
        self.fsm.context.now = self.clock.now_us();
        self.fsm.context.timeout_us = timeout_ms as u64 * 1000;
        self.fsm.context.mode = mode;
        self.pads.reset();
        self.event(Events::Arm);
        self.publish_phase();
        defmt::debug!("Armed for {=u32} ms", timeout_ms);
        Ok(())
    }

    /// Force ready from any state, a running round produces no outcome
    pub fn disarm(&mut self) {
        self.event(Events::Disarm);
        self.publish_phase();
    }

    /// Reaction time of the most recent hit
    pub fn last_reaction_us(&self) -> u32 {
        self.fsm.context.reaction_us
    }

    /// Single polling step
    pub fn tick(&mut self) {
        self.apply_command();

        let now = self.clock.now_us();
        self.fsm.context.now = now;
        match self.phase() {
            Phase::Ready => {},
            Phase::Armed => {
                if let Some(pad) = self.poll_pads() {
                    self.fsm.context.pad = pad;
                    self.event(Events::Touch);
                    self.event(Events::Report);
                } else if now.saturating_sub(self.fsm.context.armed_at) >= self.fsm.context.timeout_us {
                    self.event(Events::Expire);
                }
            },
            Phase::Triggered => self.event(Events::Report),
            Phase::Feedback => {
                if now.saturating_sub(self.fsm.context.feedback_at) >= self.timing.feedback_ms as u64 * 1000 {
                    self.event(Events::Settle);
                }
            },
        }

        if let Some(outcome) = self.fsm.context.outcome.take() {
            self.finish(outcome);
        }
        self.publish_phase();
    }

    /// Poll forever with a fixed period until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool, period_us: u32) {
        while running.load(Ordering::Relaxed) {
            self.tick();
            self.clock.delay_us(period_us);
        }
    }

    pub fn pads(&mut self) -> &mut P {
        &mut self.pads
    }

    pub fn feedback(&mut self) -> &mut F {
        &mut self.feedback
    }

    fn apply_command(&mut self) {
        let Some(command) = self.control.take_command() else {
            return;
        };
        match command {
            Command::Arm { timeout_ms, mode } => {
                self.arm(timeout_ms, mode).ok();
            },
            Command::Rearm { timeout_ms, mode } => {
                if self.phase() != Phase::Ready {
                    self.disarm();
                }
                self.arm(timeout_ms, mode).ok();
            },
            Command::Disarm => self.disarm(),
        }
    }

    fn poll_pads(&mut self) -> Option<u8> {
        for pad in 0..self.pads.count() {
            if self.pads.is_touched(pad) {
                return Some(pad as u8);
            }
        }
        None
    }

    /// Play feedback and hand the outcome to the service
    fn finish(&mut self, outcome: Outcome) {
        let mode = self.fsm.context.mode;
        let duration = self.timing.feedback_ms;
        match outcome.kind {
            OutcomeKind::Hit => {
                defmt::info!("Hit on pad {=u8} after {=u32} us", outcome.pad, outcome.reaction_us);
                if mode.light() {
                    self.feedback.flash(self.timing.hit_color, duration);
                }
                if mode.audio() {
                    self.feedback.tone(duration);
                }
            },
            OutcomeKind::Miss => {
                defmt::info!("Miss");
                if mode.light() {
                    self.feedback.flash(self.timing.miss_color, duration);
                }
            },
        }

        if self.control.is_subscribed() {
            if !self.control.handoff().publish(outcome) {
                defmt::warn!("Previous outcome not consumed, dropping {}", outcome);
            }
        } else {
            defmt::debug!("No subscriber for {}", outcome);
        }
    }

    fn event(&mut self, event: Events) {
        self.fsm.process_event(event).ok();
    }

    fn publish_phase(&self) {
        self.control.set_phase(self.phase());
    }
}
