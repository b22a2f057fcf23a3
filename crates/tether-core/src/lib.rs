//! Tether engine: connections, state synchronization, and façades.
//!
//! This crate turns the pure data layer of `tether-proto` into a running
//! system:
//!
//! - [`connection`]: the sans-I/O per-peer transport state machine
//!   (sequencing, acknowledgement window, RTT, reliable-event retries)
//! - [`throttle`]: the congestion-driven send-rate quality machine
//! - [`store`]: the thread-safe state repository with its update cache
//! - [`machine`]: the simulation loop and the event wire into it
//! - [`events`]: the handler registry (sync and suspending handlers)
//! - [`socket`]: the datagram socket abstraction (UDP in production,
//!   simulated in tests)
//! - [`server`] / [`client`] / [`backend`]: the user-facing façades
//!
//! # Architecture
//!
//! Protocol logic is sans-I/O: the connection engine and throttle read no
//! clocks and touch no sockets. Time and datagrams are passed in, and
//! driver actors (tokio tasks) execute the results. This keeps the
//! transport rules deterministic and unit-testable, with tokio confined to
//! the driver layer.
//!
//! Transport errors never unwind past a connection: user-visible failure
//! is a callback, a status change, or a logged diagnostic.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backend;
pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod machine;
pub mod server;
pub mod socket;
pub mod store;
pub mod throttle;

pub use backend::Backend;
pub use client::{Client, GameStateGuard};
pub use connection::{Callback, Connection, ConnectionConfig, ConnectionStatus, Delivery, Liveness};
pub use error::{ConnectionError, DispatchError};
pub use events::{EventHandler, HandlerContext, HandlerError, HandlerResult, UniversalEventHandler};
pub use machine::{EventWire, GameStateMachine, MachineHandle, WiredEvent, DEFAULT_STEP_INTERVAL};
pub use server::{EventTarget, Server};
pub use socket::{bind_udp, DatagramSocket};
pub use store::{GameStateStore, DEFAULT_UPDATE_CACHE_SIZE};
pub use throttle::{Quality, Throttle, ThrottleConfig};
