//! Wire layout of a segment - all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: sequence number (u32)
//!  4: acknowledgment number (u32)
//!  8: flags (u8): bit 0 SYN, bit 1 ACK, bit 2 FIN, bit 3 RST
//!  9: advertised window (u16)
//! 11: payload length (u16)
//! 13: payload
//! ```
//!
//! Decoding is strict: truncated headers, unknown flag bits and a payload
//!  length that disagrees with the datagram are all errors, and the receive
//!  loop drops such datagrams.

use crate::segment::{Segment, SegmentFlags, SeqNum};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

pub const HEADER_LEN: usize = 13;

impl Segment {
    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.payload.len() <= u16::MAX as usize);

        buf.put_u32(self.seq.to_raw());
        buf.put_u32(self.ack.to_raw());
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.window);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Segment> {
        if buf.remaining() < HEADER_LEN {
            bail!("segment too short: {} bytes", buf.remaining());
        }

        let seq = SeqNum::from_raw(buf.get_u32());
        let ack = SeqNum::from_raw(buf.get_u32());
        let raw_flags = buf.get_u8();
        let Some(flags) = SegmentFlags::from_bits(raw_flags) else {
            bail!("unknown flag bits: {:#010b}", raw_flags);
        };
        let window = buf.get_u16();
        let payload_len = buf.get_u16() as usize;

        if buf.remaining() < payload_len {
            bail!(
                "payload length mismatch: header says {}, got {}",
                payload_len,
                buf.remaining()
            );
        }

        Ok(Segment {
            seq,
            ack,
            flags,
            window,
            payload: buf.copy_to_bytes(payload_len),
        })
    }
}
