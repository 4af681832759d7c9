use core::convert::Infallible;

use bitfield::bitfield;
use embedded_hal::digital::v2::InputPin;
use rgb::RGB8;

use crate::utils::InfallibleResult;

bitfield! {
    /// Which kinds of feedback to play when a round ends
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct FeedbackMode(u8);
    impl Debug;
    pub light, set_light: 0;
    pub audio, set_audio: 1;
}

impl FeedbackMode {
    pub const LIGHT: u8 = 0x01;
    pub const AUDIO: u8 = 0x02;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }
}

impl Default for FeedbackMode {
    fn default() -> Self {
        Self(Self::LIGHT | Self::AUDIO)
    }
}

impl defmt::Format for FeedbackMode {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "FeedbackMode(light={=bool}, audio={=bool})", self.light(), self.audio());
    }
}

/// Set of touch inputs polled while the input is armed
pub trait TouchPads {
    fn count(&self) -> usize;

    /// Read current state of given pad
    fn is_touched(&mut self, pad: usize) -> bool;

    /// Called whenever the input gets armed, e.g. to re-baseline sensors
    fn reset(&mut self) {}
}

/// Digital touch sensors that drive their output high when touched
impl<P: InputPin<Error = Infallible>, const N: usize> TouchPads for [P; N] {
    fn count(&self) -> usize {
        N
    }

    fn is_touched(&mut self, pad: usize) -> bool {
        self.get(pad)
            .map(|pin| pin.is_high().infallible())
            .unwrap_or(false)
    }
}

/// Local visual and audio output
///
/// Called from the input polling context, so implementations must only start
/// the effect and return without blocking.
pub trait Feedback {
    fn flash(&mut self, color: RGB8, duration_ms: u32);
    fn tone(&mut self, duration_ms: u32);
}
