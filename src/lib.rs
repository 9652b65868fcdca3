//! A reliable, ordered byte-stream transport on top of UDP - connection
//!  oriented like TCP, but self-contained and not wire-compatible with it.
//!
//! ## Design goals
//!
//! * Full connection lifecycle over an unreliable datagram service:
//!   * three-way handshake (SYN / SYN+ACK / ACK)
//!   * in-order delivery with cumulative acknowledgments and retransmission
//!   * graceful four-way teardown, simultaneous close, and abortive reset
//! * The abstraction is a *byte stream*, not messages: writes are segmented,
//!   segments are reassembled, and readers see bytes in exactly the order
//!   they were written
//! * Out-of-order arrivals are buffered and drained the moment the gap fills;
//!   duplicates are acknowledged again and discarded
//! * The retransmission timeout adapts to the measured round-trip time
//!   (RFC 6298: SRTT/RTTVAR with exponential backoff, samples only from
//!   segments that were transmitted once)
//! * Flow control honors the peer's advertised window: the receiver announces
//!   its free buffer space in every segment, and the sender never puts more
//!   than that in flight
//! * One UDP socket serves many connections: a listener demultiplexes inbound
//!   datagrams by remote address, creating connections on first SYN
//!
//! ## Segment layout
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//!  0: sequence number (u32) - each payload byte consumes one sequence
//!      number, SYN and FIN consume one each; comparisons are modulo 2^32
//!  4: acknowledgment number (u32) - cumulatively acknowledges every
//!      sequence number strictly below it
//!  8: flags (u8): bit 0 SYN, bit 1 ACK, bit 2 FIN, bit 3 RST
//!  9: advertised window (u16) - the sender's free receive-buffer space
//! 11: payload length (u16)
//! 13: payload
//! ```
//!
//! ## Related
//!
//! * TCP (RFC 793): the transition graph and teardown choreography follow it;
//!   congestion control, SACK, window scaling and urgent data deliberately do
//!   not exist here
//! * RFC 6298: the retransmission timer computation
//! * QUIC: connection-oriented reliability over UDP as well, but stream
//!   multiplexing, TLS and connection migration put it in a different weight
//!   class

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod ring_buffer;
mod rto;
pub mod segment;
pub mod socket;
pub mod state_machine;
pub mod stats;
pub mod wire;

pub use config::Config;
pub use connection::Connection;
pub use endpoint::{dial, Listener};
pub use error::{Result, TransportError};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
