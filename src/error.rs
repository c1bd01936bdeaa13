//! Error types of the protocol layers.

use thiserror::Error;

use crate::protocol::ErrorCode;
use crate::session::State;

#[derive(Debug, Error)]
pub enum Error {
    /// The device answered with an explicit failure packet.
    #[error("{0}")]
    Device(ErrorCode),

    /// No valid response after all attempts.
    #[error("communication failure")]
    CommunicationFailure,

    #[error("verify failed at address {address:#x}")]
    VerifyMismatch { address: u32 },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    #[error("unexpected response length (expected {expected}, got {actual})")]
    UnexpectedLength { expected: usize, actual: usize },

    #[error("payload of {0} bytes does not fit in a packet")]
    PayloadTooLarge(usize),

    #[error("data at {address:#010x} overlaps an existing segment")]
    SegmentOverlap { address: u32 },

    #[error(transparent)]
    Encoding(#[from] scroll::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
