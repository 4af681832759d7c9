use defmt::Format;
use heapless::Vec;

use crate::input::{FeedbackMode, Outcome, OutcomeKind};
use crate::periph::{Indicator, ModeControl};
use crate::time::Clock;
use crate::transport::Radio;
use crate::utils::average;
use crate::wire::Body;
use super::{Exit, Service};

/// Most rounds a single drill report can hold
pub const MAX_ROUNDS: usize = 64;

/// Whose input a round arms
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Target {
    Local,
    Peer,
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub struct RoundResult {
    pub round: u8,
    pub target: Target,
    pub outcome: Outcome,
}

/// Results of a coordinated drill
#[derive(Clone, Default, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub struct DrillReport {
    pub rounds: Vec<RoundResult, MAX_ROUNDS>,
}

impl DrillReport {
    pub fn hits(&self) -> u32 {
        self.rounds.iter().filter(|r| r.outcome.is_hit()).count() as u32
    }

    pub fn misses(&self) -> u32 {
        self.rounds.len() as u32 - self.hits()
    }

    /// Average reaction time of hits in milliseconds, 0 without hits
    pub fn average_reaction_ms(&self) -> u32 {
        let total: u64 = self.rounds.iter()
            .filter(|r| r.outcome.is_hit())
            .map(|r| r.outcome.reaction_us as u64)
            .sum();
        (average(total, self.hits()) / 1000) as u32
    }
}

impl<'a, R, C, M, I, const N: usize> Service<'a, R, C, M, I, N>
where
    R: Radio,
    C: Clock,
    M: ModeControl,
    I: Indicator,
{
    /// Drive a drill, even rounds arm our own input, odd ones the peer's
    pub fn run_coordinator(&mut self) -> DrillReport {
        defmt::info!("Coordinating drill with {}", self.peer);
        let mut report = DrillReport::default();
        if !self.modes.enter_drill() {
            defmt::warn!("Could not enter drill mode from {}", self.modes.current_mode());
        }

        self.send_peer(Body::JoinDrill).ok();
        self.pause(self.timing.join_settle_ms);
        let stale = self.transport.discard_pending();
        if stale > 0 {
            defmt::debug!("Discarded {=usize} stale messages", stale);
        }

        let rounds = self.timing.rounds.min(MAX_ROUNDS as u8);
        for round in 0..rounds {
            if !self.is_running() {
                break;
            }
            let target = if round % 2 == 0 { Target::Local } else { Target::Peer };
            let outcome = match target {
                Target::Local => self.local_round(),
                Target::Peer => self.peer_round(),
            };
            defmt::info!("Round {=u8}/{=u8} {}: {}", round + 1, rounds, target, outcome);
            // capacity checked by `rounds`
            report.rounds.push(RoundResult { round, target, outcome }).ok();

            if round + 1 < rounds {
                self.pause(self.timing.inter_round_ms);
            }
        }

        self.broadcast(Body::StopAll).ok();
        defmt::info!("Drill done: {=u32}/{=usize} hits, average {=u32} ms",
            report.hits(), report.rounds.len(), report.average_reaction_ms());

        self.input.disarm();
        self.input.unsubscribe();
        self.indicator.clear();
        self.modes.leave_drill();
        report
    }

    /// Arm our own input and wait for its outcome
    fn local_round(&mut self) -> Outcome {
        let mode = FeedbackMode::from_bits(self.timing.feedback_mode);
        self.input.subscribe();
        self.indicator.set_color(self.timing.armed_color);
        if let Err(e) = self.input.rearm(self.timing.arm_timeout_ms, mode) {
            defmt::warn!("Local arm failed: {}", e);
        }

        let start = self.clock.now_us();
        let outcome = loop {
            if let Some(outcome) = self.input.take_outcome() {
                break outcome;
            }
            if self.clock.expired(start, self.timing.round_deadline_ms()) || !self.is_running() {
                defmt::warn!("Local round deadline passed");
                self.input.disarm();
                break Outcome::miss();
            }
            self.clock.delay_ms(self.timing.local_round_poll_ms);
        };

        self.indicator.clear();
        outcome
    }

    /// Arm the peer's input and wait for its report
    fn peer_round(&mut self) -> Outcome {
        // Late reports of earlier rounds must not count for this one
        self.poll_pending();
        self.outcome = None;

        let arm = Body::ArmInput {
            timeout_ms: self.timing.arm_timeout_ms,
            feedback: FeedbackMode::from_bits(self.timing.feedback_mode),
        };
        self.send_peer(Body::indicator(self.timing.armed_color)).ok();
        if self.send_peer(arm).is_err() {
            return Outcome::miss();
        }

        let start = self.clock.now_us();
        loop {
            if let Some(outcome) = self.outcome.take() {
                return outcome;
            }
            if self.clock.expired(start, self.timing.round_deadline_ms()) || !self.is_running() {
                defmt::warn!("Peer round deadline passed");
                return Outcome::miss();
            }
            self.poll(self.timing.peer_round_poll_ms);
        }
    }

    /// Follow the coordinator's commands until it stops or goes silent
    pub fn run_participant(&mut self) -> Exit {
        defmt::info!("Participating in drill of {}", self.peer);
        if !self.modes.enter_drill() {
            defmt::warn!("Could not enter drill mode from {}", self.modes.current_mode());
        }
        self.stop_received = false;
        self.last_peer_msg_us = self.clock.now_us();

        let exit = loop {
            if !self.is_running() {
                break Exit::Stopped;
            }

            if let Some(outcome) = self.input.take_outcome() {
                let body = match outcome.kind {
                    OutcomeKind::Hit => Body::TouchEvent {
                        reaction_us: outcome.reaction_us,
                        pad: outcome.pad,
                    },
                    OutcomeKind::Miss => Body::TimeoutEvent,
                };
                self.send_peer(body).ok();
            }

            self.poll(self.timing.participant_poll_ms);
            if self.stop_received {
                break Exit::StopReceived;
            }

            if self.clock.expired(self.last_peer_msg_us, self.timing.heartbeat_ms) {
                defmt::warn!("No message from {} for {=u32} ms", self.peer, self.timing.heartbeat_ms);
                break Exit::HeartbeatLost;
            }
        };

        self.input.disarm();
        self.input.unsubscribe();
        self.indicator.clear();
        self.modes.leave_drill();
        defmt::info!("Participant done: {}", exit);
        exit
    }
}
