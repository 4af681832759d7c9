use defmt::Format;

use crate::wire::MacAddr;

/// Part a pod plays in one drill cycle
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Role {
    /// Drives the rounds
    Coordinator,
    /// Responds to the coordinator's commands
    Participant,
}

/// The numerically lower hardware address coordinates
///
/// Both pods reach the same answer from addresses they already know, no
/// messages are exchanged.
pub fn elect(own: MacAddr, peer: MacAddr) -> Role {
    if own < peer {
        Role::Coordinator
    } else {
        Role::Participant
    }
}
