use crate::state_machine::{Event, State};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Non-fatal failures of the transport core. All of these leave the affected
///  component in a consistent state, and the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("capacity must be greater than zero")]
    InvalidCapacity,

    #[error("buffer is full")]
    BufferFull,

    #[error("buffer is empty")]
    BufferEmpty,

    #[error("cannot process {event} in state {state}")]
    InvalidTransition { state: State, event: Event },

    /// The connection is closed, or a read reached the end of the stream.
    ///  Whether the close was graceful or caused by a peer reset is visible
    ///  in the state machine's transition history.
    #[error("connection is closed")]
    Closed,

    #[error("handshake timed out")]
    HandshakeTimeout,
}
