//! Radio wire protocol
//!
//! Fixed-layout binary messages shared by both pods. Each message is packed
//! (no padding), little-endian and starts with the 11 byte [`Header`]:
//! `[type tag (1)][sender address (6)][truncated µs timestamp (4)]`, optionally
//! followed by a type-specific body. There are no checksums (the radio checks
//! frame integrity) and no version field.
//!
//! The decoder only reports what is wrong with a buffer, discarding bad
//! buffers is up to the caller.

use core::convert::TryInto;

use defmt::Format;
use heapless::Vec;
use packed_struct::prelude::*;
use rgb::RGB8;
use serde::{Serialize, Deserialize};
use static_assertions as sa;

use crate::input::FeedbackMode;

/// Size of the common message header
pub const HEADER_LEN: usize = 11;
/// Radio datagram payload ceiling
pub const MAX_PAYLOAD: usize = 250;
/// Largest message defined by the protocol
pub const MAX_MESSAGE_LEN: usize = 16;

sa::const_assert!(MAX_MESSAGE_LEN <= MAX_PAYLOAD);
sa::const_assert_eq!(core::mem::size_of::<<Header as PackedStruct>::ByteArray>(), HEADER_LEN);
sa::const_assert!(Kind::ArmInput.wire_len() <= MAX_MESSAGE_LEN);
sa::const_assert!(Kind::TouchEvent.wire_len() <= MAX_MESSAGE_LEN);

/// Encoded message, ready to be handed to the transport
pub type Frame = Vec<u8, MAX_MESSAGE_LEN>;

/// Radio hardware address
///
/// Ordering compares bytes from the first one, i.e. the numeric value of the address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(test, derive(Debug))]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Destination used for broadcast frames
    pub const BROADCAST: Self = Self([0xff; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl Format for MacAddr {
    fn format(&self, f: defmt::Formatter) {
        let m = &self.0;
        defmt::write!(f, "{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]);
    }
}

/// Message type tag
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
#[repr(u8)]
pub enum Kind {
    // Discovery
    Beacon = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    // Control, coordinator -> participant
    JoinDrill = 0x10,
    ArmInput = 0x11,
    SetIndicator = 0x12,
    StopAll = 0x13,
    // Outcomes, participant -> coordinator
    TouchEvent = 0x20,
    TimeoutEvent = 0x21,
}

impl Kind {
    pub const fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Beacon,
            0x02 => Self::Ping,
            0x03 => Self::Pong,
            0x10 => Self::JoinDrill,
            0x11 => Self::ArmInput,
            0x12 => Self::SetIndicator,
            0x13 => Self::StopAll,
            0x20 => Self::TouchEvent,
            0x21 => Self::TimeoutEvent,
            _ => return None,
        })
    }

    /// Fixed size of a message of this type, header included
    pub const fn wire_len(self) -> usize {
        match self {
            Self::ArmInput | Self::TouchEvent => HEADER_LEN + 5,
            Self::SetIndicator => HEADER_LEN + 3,
            _ => HEADER_LEN,
        }
    }
}

/// Common message header
#[derive(PackedStruct, Clone, Copy, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0")]
pub struct Header {
    #[packed_field(bytes = "0")]
    pub kind: u8,
    #[packed_field(bytes = "1..=6")]
    pub sender: [u8; 6],
    #[packed_field(bytes = "7..=10", endian = "lsb")]
    pub timestamp: u32,
}

#[derive(PackedStruct, Clone, Copy, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0")]
struct ArmBody {
    #[packed_field(bytes = "0..=3", endian = "lsb")]
    timeout_ms: u32,
    #[packed_field(bytes = "4")]
    feedback: u8,
}

#[derive(PackedStruct, Clone, Copy, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0")]
struct ColorBody {
    #[packed_field(bytes = "0")]
    red: u8,
    #[packed_field(bytes = "1")]
    green: u8,
    #[packed_field(bytes = "2")]
    blue: u8,
}

#[derive(PackedStruct, Clone, Copy, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0")]
struct TouchBody {
    #[packed_field(bytes = "0..=3", endian = "lsb")]
    reaction_us: u32,
    #[packed_field(bytes = "4")]
    pad: u8,
}

/// Type-specific part of a message
#[derive(Clone, Copy, PartialEq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum Body {
    /// Periodic broadcast used for peer discovery
    Beacon,
    /// Round-trip measurement, answered with [`Body::Pong`]
    Ping,
    /// Ping answer; header timestamp echoes the one from the ping
    Pong,
    /// Coordinator announces the drill, receiver becomes the participant
    JoinDrill,
    /// Arm the participant's input
    ArmInput { timeout_ms: u32, feedback: FeedbackMode },
    /// Set the participant's indicator colour
    SetIndicator { red: u8, green: u8, blue: u8 },
    /// End of drill
    StopAll,
    /// Participant was touched
    TouchEvent { reaction_us: u32, pad: u8 },
    /// Participant was not touched before its arm timeout
    TimeoutEvent,
}

impl Body {
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Beacon => Kind::Beacon,
            Self::Ping => Kind::Ping,
            Self::Pong => Kind::Pong,
            Self::JoinDrill => Kind::JoinDrill,
            Self::ArmInput { .. } => Kind::ArmInput,
            Self::SetIndicator { .. } => Kind::SetIndicator,
            Self::StopAll => Kind::StopAll,
            Self::TouchEvent { .. } => Kind::TouchEvent,
            Self::TimeoutEvent => Kind::TimeoutEvent,
        }
    }

    pub const fn indicator(color: RGB8) -> Self {
        Self::SetIndicator { red: color.r, green: color.g, blue: color.b }
    }
}

/// Complete protocol message
#[derive(Clone, Copy, PartialEq, Format)]
#[cfg_attr(test, derive(Debug))]
pub struct Message {
    pub sender: MacAddr,
    pub timestamp: u32,
    pub body: Body,
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum EncodeError {
    /// Field value does not fit its wire representation
    Packing,
    /// Encoded message larger than [`MAX_MESSAGE_LEN`]
    Overflow,
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[cfg_attr(test, derive(Debug))]
pub enum DecodeError {
    /// Buffer shorter than the header or than the size implied by its type tag
    TooShort { len: usize, need: usize },
    /// Type tag not defined by the protocol
    UnknownKind(u8),
    /// Bytes could not be unpacked
    Malformed,
}

impl From<PackingError> for EncodeError {
    fn from(_: PackingError) -> Self {
        Self::Packing
    }
}

impl From<PackingError> for DecodeError {
    fn from(_: PackingError) -> Self {
        Self::Malformed
    }
}

impl Message {
    pub const fn new(sender: MacAddr, timestamp: u32, body: Body) -> Self {
        Self { sender, timestamp, body }
    }

    pub const fn kind(&self) -> Kind {
        self.body.kind()
    }

    /// Serialize to the fixed wire layout
    pub fn encode(&self) -> Result<Frame, EncodeError> {
        let header = Header {
            kind: self.kind() as u8,
            sender: self.sender.0,
            timestamp: self.timestamp,
        };

        let mut frame = Frame::new();
        push(&mut frame, &header.pack()?)?;
        match self.body {
            Body::ArmInput { timeout_ms, feedback } => {
                let body = ArmBody { timeout_ms, feedback: feedback.bits() };
                push(&mut frame, &body.pack()?)?;
            },
            Body::SetIndicator { red, green, blue } => {
                push(&mut frame, &ColorBody { red, green, blue }.pack()?)?;
            },
            Body::TouchEvent { reaction_us, pad } => {
                push(&mut frame, &TouchBody { reaction_us, pad }.pack()?)?;
            },
            _ => {},
        }

        debug_assert_eq!(frame.len(), self.kind().wire_len());
        Ok(frame)
    }

    /// Parse a received buffer
    ///
    /// Trailing bytes beyond the size implied by the type tag are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let header = Header::unpack(fixed::<HEADER_LEN>(data, 0)?)?;
        let kind = Kind::from_tag(header.kind)
            .ok_or(DecodeError::UnknownKind(header.kind))?;
        if data.len() < kind.wire_len() {
            return Err(DecodeError::TooShort { len: data.len(), need: kind.wire_len() });
        }

        let body = match kind {
            Kind::Beacon => Body::Beacon,
            Kind::Ping => Body::Ping,
            Kind::Pong => Body::Pong,
            Kind::JoinDrill => Body::JoinDrill,
            Kind::StopAll => Body::StopAll,
            Kind::TimeoutEvent => Body::TimeoutEvent,
            Kind::ArmInput => {
                let body = ArmBody::unpack(fixed(data, HEADER_LEN)?)?;
                Body::ArmInput {
                    timeout_ms: body.timeout_ms,
                    feedback: FeedbackMode::from_bits(body.feedback),
                }
            },
            Kind::SetIndicator => {
                let body = ColorBody::unpack(fixed(data, HEADER_LEN)?)?;
                Body::SetIndicator { red: body.red, green: body.green, blue: body.blue }
            },
            Kind::TouchEvent => {
                let body = TouchBody::unpack(fixed(data, HEADER_LEN)?)?;
                Body::TouchEvent { reaction_us: body.reaction_us, pad: body.pad }
            },
        };

        Ok(Self {
            sender: MacAddr(header.sender),
            timestamp: header.timestamp,
            body,
        })
    }
}

fn push(frame: &mut Frame, bytes: &[u8]) -> Result<(), EncodeError> {
    frame.extend_from_slice(bytes).map_err(|_| EncodeError::Overflow)
}

/// View `N` bytes of `data` starting at `offset` as an array
fn fixed<const N: usize>(data: &[u8], offset: usize) -> Result<&[u8; N], DecodeError> {
    let need = offset + N;
    data.get(offset..need)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::TooShort { len: data.len(), need })
}

#[cfg(test)]
mod tests {
    use super::*;

    const POD_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    #[test]
    fn header_layout() {
        let msg = Message::new(POD_A, 0x11223344, Body::Beacon);
        let frame = msg.encode().unwrap();
        assert_eq!(&frame[..], &[0x01, 0x02, 0, 0, 0, 0, 0x01, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn arm_input_layout() {
        let msg = Message::new(POD_A, 7, Body::ArmInput {
            timeout_ms: 3000,
            feedback: FeedbackMode::from_bits(0x03),
        });
        let frame = msg.encode().unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(frame[0], 0x11);
        // 3000 = 0x0bb8
        assert_eq!(&frame[11..], &[0xb8, 0x0b, 0x00, 0x00, 0x03]);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn touch_event_layout() {
        let msg = Message::new(POD_A, 0, Body::TouchEvent { reaction_us: 100_000, pad: 2 });
        let frame = msg.encode().unwrap();
        // 100000 = 0x0186a0
        assert_eq!(&frame[11..], &[0xa0, 0x86, 0x01, 0x00, 0x02]);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn message_sizes() {
        let sizes = [
            (Body::Beacon, 11),
            (Body::Ping, 11),
            (Body::Pong, 11),
            (Body::JoinDrill, 11),
            (Body::ArmInput { timeout_ms: 1, feedback: FeedbackMode::default() }, 16),
            (Body::SetIndicator { red: 0, green: 255, blue: 0 }, 14),
            (Body::StopAll, 11),
            (Body::TouchEvent { reaction_us: 1, pad: 0 }, 16),
            (Body::TimeoutEvent, 11),
        ];
        for (body, len) in sizes {
            let frame = Message::new(POD_A, 0, body).encode().unwrap();
            assert_eq!(frame.len(), len, "{:?}", body);
            assert_eq!(body.kind().wire_len(), len);
        }
    }

    #[test]
    fn shorter_than_header() {
        assert_eq!(Message::decode(&[0x01, 0x02, 0x03]),
            Err(DecodeError::TooShort { len: 3, need: HEADER_LEN }));
        assert_eq!(Message::decode(&[]),
            Err(DecodeError::TooShort { len: 0, need: HEADER_LEN }));
    }

    #[test]
    fn shorter_than_type_implies() {
        let frame = Message::new(POD_A, 0, Body::indicator(RGB8::new(1, 2, 3))).encode().unwrap();
        assert_eq!(Message::decode(&frame[..13]),
            Err(DecodeError::TooShort { len: 13, need: 14 }));
    }

    #[test]
    fn unknown_tag() {
        let mut frame = Message::new(POD_A, 0, Body::Beacon).encode().unwrap();
        frame[0] = 0x7f;
        assert_eq!(Message::decode(&frame), Err(DecodeError::UnknownKind(0x7f)));
    }

    #[test]
    fn trailing_bytes_ignored() {
        let mut frame = Message::new(POD_A, 9, Body::StopAll).encode().unwrap();
        frame.push(0xaa).unwrap();
        assert_eq!(Message::decode(&frame).unwrap().body, Body::StopAll);
    }

    #[test]
    fn address_ordering_is_numeric() {
        let low = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
        let high = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
        assert!(low < high);
        assert!(MacAddr([0x01, 0xff, 0xff, 0xff, 0xff, 0xff]) < low);
        assert!(MacAddr::BROADCAST.is_broadcast());
    }
}
