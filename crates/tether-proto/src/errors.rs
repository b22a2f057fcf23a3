//! Error types for the Tether wire protocol.

use thiserror::Error;

/// Errors raised while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first four bytes of a datagram did not match the protocol magic.
    ///
    /// Receivers drop such datagrams without touching connection state.
    #[error("protocol magic mismatch: not a tether datagram")]
    ProtocolMismatch,

    /// Datagram shorter than the fixed header.
    #[error("header too short: expected at least {expected} bytes, got {actual}")]
    HeaderTooShort {
        /// Minimum required size in bytes.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Malformed body. The datagram is dropped; the connection is unaffected.
    #[error("failed to decode body: {0}")]
    Decode(String),

    /// Body serialization failed.
    #[error("failed to encode body: {0}")]
    Encode(String),

    /// An encoded package would exceed the maximum datagram size.
    ///
    /// Raised at encode time; the caller must split or drop events.
    #[error("package of {size} bytes exceeds the maximum of {max}")]
    SizeOverflow {
        /// Size the encoded datagram would have.
        size: usize,
        /// Maximum allowed datagram size.
        max: usize,
    },

    /// A `game_status` value outside the known set.
    #[error("invalid game status: {0}")]
    InvalidGameStatus(i64),
}

/// Convenient result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
