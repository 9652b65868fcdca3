use bitflags::bitflags;
use bytes::Bytes;
use std::fmt::{Display, Formatter};

/// A 32-bit sequence number with wrap-around semantics: every comparison goes
///  through the signed difference of the raw values, so ordering stays correct
///  across the `u32::MAX` boundary. A plain `Ord` on the raw value would be a
///  latent wraparound bug, which is why this type deliberately does not
///  implement it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn advance(&self, n: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(n))
    }

    /// `self < other` in the modulo-2^32 order.
    pub fn is_before(&self, other: SeqNum) -> bool {
        (other.0.wrapping_sub(self.0) as i32) > 0
    }

    /// `self <= other` in the modulo-2^32 order.
    pub fn is_at_or_before(&self, other: SeqNum) -> bool {
        self.0 == other.0 || self.is_before(other)
    }

    /// The number of sequence numbers from `self` up to (excluding) `other`.
    pub fn distance_to(&self, other: SeqNum) -> u32 {
        other.0.wrapping_sub(self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentFlags: u8 {
        const SYN = 1;
        const ACK = 1 << 1;
        const FIN = 1 << 2;
        const RST = 1 << 3;
    }
}

/// The atomic unit of transmission: one decoded datagram's worth of control
///  flags and payload. The wire layout lives in [`crate::wire`]; everything in
///  the reliability engine works on this record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: SeqNum,
    pub ack: SeqNum,
    pub flags: SegmentFlags,
    /// the sender's free receive-buffer space at the time of emission
    pub window: u16,
    pub payload: Bytes,
}

impl Segment {
    pub fn control(seq: SeqNum, ack: SeqNum, flags: SegmentFlags, window: u16) -> Segment {
        Segment {
            seq,
            ack,
            flags,
            window,
            payload: Bytes::new(),
        }
    }

    pub fn data(seq: SeqNum, ack: SeqNum, window: u16, payload: Bytes) -> Segment {
        Segment {
            seq,
            ack,
            flags: SegmentFlags::ACK,
            window,
            payload,
        }
    }

    /// The number of sequence numbers this segment consumes: one per payload
    ///  byte, plus one each for SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(SegmentFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(SegmentFlags::FIN) {
            len += 1;
        }
        len
    }

    /// The sequence number directly after this segment. An acknowledgment at
    ///  or past this value acknowledges the whole segment.
    pub fn end_seq(&self) -> SeqNum {
        self.seq.advance(self.seq_len())
    }
}
