//! Error types for the connection engine and the façades.
//!
//! Transport errors never unwind past the connection boundary: user-visible
//! failure is always a callback, a status change, or a logged diagnostic.
//! The types here are what crosses the internal seams.

use std::net::SocketAddr;

use thiserror::Error;

use tether_proto::ProtocolError;

/// Errors raised while processing a received package.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// A package with this sequence number was already received.
    ///
    /// The duplicate is dropped silently; its events must not be
    /// re-dispatched.
    #[error("duplicate sequence number")]
    DuplicateSequence,

    /// A package older than the 32-sequence acknowledgement window.
    ///
    /// Too old to track; dropped like a duplicate.
    #[error("sequence number older than the acknowledgement window")]
    StaleSequence,

    /// The datagram was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The underlying socket failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}

/// Errors surfaced to callers of `dispatch_event`.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The event alone can never fit a datagram. The event is not sent.
    #[error("event of {size} bytes cannot fit a datagram of at most {max} bytes")]
    SizeOverflow {
        /// Encoded size of the event plus framing.
        size: usize,
        /// Maximum datagram size.
        max: usize,
    },

    /// The target address has no live connection.
    #[error("no connected client at {0}")]
    UnknownClient(SocketAddr),

    /// The connection is gone; the event was not queued.
    #[error("not connected")]
    Disconnected,

    /// The event could not be serialized.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
