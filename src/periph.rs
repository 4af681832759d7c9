//! Collaborators outside the drill core
//!
//! The device mode manager and the indicator light are provided by the board
//! support code.

use defmt::Format;
use rgb::RGB8;

/// Device operating mode
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Mode {
    Booting,
    Idle,
    /// Drill in progress
    Drill,
    Error,
}

pub trait ModeControl {
    fn current_mode(&self) -> Mode;
    /// Returns false if the transition is not allowed from the current mode
    fn transition_to(&mut self, mode: Mode) -> bool;

    /// Get into drill mode, passing through idle when still booting
    fn enter_drill(&mut self) -> bool {
        match self.current_mode() {
            Mode::Drill => true,
            Mode::Booting => self.transition_to(Mode::Idle) && self.transition_to(Mode::Drill),
            _ => self.transition_to(Mode::Drill),
        }
    }

    fn leave_drill(&mut self) {
        if self.current_mode() != Mode::Idle && !self.transition_to(Mode::Idle) {
            defmt::warn!("Could not leave {}", self.current_mode());
        }
    }
}

/// Status light of the pod
pub trait Indicator {
    fn set_color(&mut self, color: RGB8);
    fn clear(&mut self);
}
