//! Tether wire protocol: data model and datagram codec.
//!
//! This crate contains the pure data layer of tether: sequence numbers,
//! the fixed wire header, the serializable value model, events, game state
//! and state updates, and the three package shapes that cross the wire. It
//! performs no I/O and knows nothing about connections or sockets; that
//! lives in `tether-core`.
//!
//! # Wire format
//!
//! A datagram is a 12-byte header (magic, sequence, ack, ack bitfield)
//! followed by a CBOR body, capped at
//! [`MAX_DATAGRAM_SIZE`](package::MAX_DATAGRAM_SIZE) bytes. See the
//! module docs of [`header`] and [`package`] for the exact layout.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod event;
pub mod header;
pub mod package;
pub mod seq;
pub mod state;
pub mod value;

pub use errors::{ProtocolError, Result};
pub use event::{Event, RESERVED_PREFIX, SHUTDOWN_EVENT};
pub use header::{AckBitfield, Header, MAGIC};
pub use package::{ClientPackage, Package, ServerPackage, MAX_DATAGRAM_SIZE};
pub use seq::Seq;
pub use state::{merge_changes, GameState, GameStatus, StateChanges, StateUpdate};
pub use value::{Value, TAG_DELETE, TAG_SEQ};
