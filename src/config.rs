//! Drill configuration
//!
//! All protocol timings and colours live in a single [`Timing`] value. The
//! compiled-in [`CONFIG`] is either written in code below or, with feature
//! `json-config`, generated at build time from a JSON file.

use rgb::RGB8;
use serde::{Serialize, Deserialize};

#[cfg(feature = "json-config")]
pub use generated::CONFIG;

#[cfg(not(feature = "json-config"))]
pub use code::CONFIG;

#[cfg(feature = "json-config")]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

#[cfg(not(feature = "json-config"))]
mod code {
    use rgb::RGB8;
    use super::Timing;

    pub static CONFIG: Timing = Timing {
        beacon_interval_ms: 2000,
        discovery_poll_ms: 500,
        ping_delay_ms: 3000,
        ping_count: 10,
        ping_interval_ms: 500,
        pong_timeout_ms: 2000,
        rounds: 10,
        arm_timeout_ms: 3000,
        feedback_mode: 0x03,
        inter_round_ms: 1000,
        join_settle_ms: 2000,
        round_margin_ms: 2000,
        heartbeat_ms: 15000,
        restart_pause_ms: 5000,
        peer_round_poll_ms: 100,
        participant_poll_ms: 100,
        local_round_poll_ms: 10,
        feedback_ms: 200,
        broadcast_send_timeout_ms: 200,
        unicast_send_timeout_ms: 1000,
        armed_color: RGB8::new(0, 255, 0),
        hit_color: RGB8::new(255, 255, 255),
        miss_color: RGB8::new(255, 0, 0),
    };
}

/// Protocol timings in milliseconds, counts and feedback colours
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq)]
#[cfg_attr(test, derive(Debug))]
pub struct Timing {
    /// Beacon broadcast period during discovery
    pub beacon_interval_ms: u32,
    /// Receive timeout while servicing discovery traffic
    pub discovery_poll_ms: u32,
    /// Delay between first peer sighting and the ping phase
    pub ping_delay_ms: u32,
    pub ping_count: u8,
    pub ping_interval_ms: u32,
    pub pong_timeout_ms: u32,
    /// Number of rounds in a drill
    pub rounds: u8,
    /// Input arm timeout for every round
    pub arm_timeout_ms: u32,
    /// Feedback bitmask sent with every arm command
    pub feedback_mode: u8,
    pub inter_round_ms: u32,
    /// Wait after JoinDrill before the first round
    pub join_settle_ms: u32,
    /// Added to the arm timeout to get the overall round deadline
    pub round_margin_ms: u32,
    /// Coordinator silence after which a participant gives up
    pub heartbeat_ms: u32,
    /// Pause between drill cycles
    pub restart_pause_ms: u32,
    pub peer_round_poll_ms: u32,
    pub participant_poll_ms: u32,
    pub local_round_poll_ms: u32,
    /// Input cool-down while feedback plays
    pub feedback_ms: u32,
    pub broadcast_send_timeout_ms: u32,
    pub unicast_send_timeout_ms: u32,
    /// Indicator colour of an armed pod
    pub armed_color: RGB8,
    pub hit_color: RGB8,
    pub miss_color: RGB8,
}

#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
#[cfg_attr(test, derive(Debug))]
pub enum InvalidTiming {
    NoRounds,
    NoPings,
    ZeroTimeout,
    /// Feedback would still be playing when the next round starts
    CooldownTooLong,
}

impl Timing {
    /// Largest serialized size, postcard varints included
    pub const MAX_SERIALIZED_LEN: usize = 17 * 5 + 3 + 3 * 3;

    /// Overall deadline of a single round
    pub const fn round_deadline_ms(&self) -> u32 {
        self.arm_timeout_ms.saturating_add(self.round_margin_ms)
    }

    pub fn validate(&self) -> Result<(), InvalidTiming> {
        if self.rounds == 0 {
            return Err(InvalidTiming::NoRounds);
        }
        if self.ping_count == 0 {
            return Err(InvalidTiming::NoPings);
        }
        let timeouts = [
            self.beacon_interval_ms,
            self.discovery_poll_ms,
            self.pong_timeout_ms,
            self.arm_timeout_ms,
            self.heartbeat_ms,
            self.peer_round_poll_ms,
            self.participant_poll_ms,
            self.broadcast_send_timeout_ms,
            self.unicast_send_timeout_ms,
        ];
        if timeouts.iter().any(|&t| t == 0) {
            return Err(InvalidTiming::ZeroTimeout);
        }
        if self.feedback_ms >= self.inter_round_ms {
            return Err(InvalidTiming::CooldownTooLong);
        }
        Ok(())
    }

    /// Serialize for persistent storage
    pub fn to_slice<'a>(&self, buf: &'a mut [u8]) -> postcard::Result<&'a mut [u8]> {
        postcard::to_slice(self, buf)
    }

    /// Load from persistent storage
    pub fn from_bytes(buf: &[u8]) -> postcard::Result<Self> {
        postcard::from_bytes(buf)
    }
}

impl Default for Timing {
    fn default() -> Self {
        CONFIG
    }
}
