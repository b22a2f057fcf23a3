//! Per-peer connection engine.
//!
//! `Connection` is the transport state machine for one direction pair of a
//! peer relationship: sequence bookkeeping with wrap-around, the 32-bit
//! acknowledgement window, round-trip-time estimation, congestion-driven
//! send-rate selection, and the ack/retry machinery for reliable events.
//!
//! # Architecture
//!
//! The engine is pure: it performs no I/O and reads no clocks. Time enters
//! as `Instant` parameters and datagrams enter as decoded headers; driver
//! code (the server's connection actors, the client task) owns the socket
//! and calls in three places:
//!
//! - [`Connection::receive`] for every decoded package,
//! - [`Connection::assemble`] on each send tick,
//! - [`Connection::poll_timeouts`] / [`Connection::check_liveness`] on a
//!   slower supervision tick.
//!
//! User-supplied ack/timeout callbacks are invoked inline at the point the
//! engine resolves them.
//!
//! # Invariants
//!
//! - Packages are emitted with strictly increasing (mod wrap) sequence
//!   numbers.
//! - A sequence number is acknowledged at most once; duplicates are
//!   rejected before any bookkeeping changes.
//! - Every reliable event is resolved exactly once: either its ack
//!   callback fires, or its timeout callback fires once the retry budget
//!   is exhausted or the connection closes.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use tether_proto::{
    AckBitfield, Event, Header, Seq, MAX_DATAGRAM_SIZE,
};

use crate::{
    error::{ConnectionError, DispatchError},
    throttle::{Throttle, ThrottleConfig},
};

/// Bytes reserved per datagram for body framing around the event list
/// (map and array headers, field keys, the client/server extra field).
const PACKAGE_OVERHEAD: usize = 64;

/// Extra bytes of framing per event inside the body array.
const PER_EVENT_OVERHEAD: usize = 4;

/// Smoothing factor of the round-trip-time moving average.
const LATENCY_SMOOTHING: f64 = 0.1;

/// A deferred user callback fired when an event resolves.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Delivery options for a dispatched event.
#[derive(Default)]
pub struct Delivery {
    /// How many times to resend after the carrying package is lost.
    pub retries: u32,
    /// Fired once the carrying package is acknowledged.
    pub ack_callback: Option<Callback>,
    /// Fired once the retry budget is exhausted without acknowledgement.
    pub timeout_callback: Option<Callback>,
}

impl Delivery {
    /// Fire-and-forget: no retries, no callbacks.
    #[must_use]
    pub fn unreliable() -> Self {
        Delivery::default()
    }

    /// Resend up to `retries` times; no callbacks.
    #[must_use]
    pub fn with_retries(retries: u32) -> Self {
        Delivery { retries, ..Delivery::default() }
    }

    fn is_reliable(&self) -> bool {
        self.retries > 0 || self.ack_callback.is_some() || self.timeout_callback.is_some()
    }
}

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Closed, or the peer is gone.
    Disconnected,
    /// Waiting for (renewed) proof of life from the peer.
    Connecting,
    /// Exchanging packages.
    Connected,
}

/// Liveness classification returned by [`Connection::check_liveness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Packages are arriving.
    Alive,
    /// Nothing received for the idle timeout; status reverted to
    /// `Connecting`.
    Idle,
    /// Nothing received for the dead timeout; the owner must close and
    /// remove this connection.
    Dead,
}

/// Tuning knobs for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time after which an unacknowledged package is considered lost.
    /// Also the per-attempt timeout of reliable events.
    pub event_timeout: Duration,
    /// Silence after which the status reverts to `Connecting`.
    pub idle_timeout: Duration,
    /// Silence after which the connection is dead.
    pub dead_timeout: Duration,
    /// Congestion throttle tuning.
    pub throttle: ThrottleConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            event_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(15),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// Reject events that can never fit a datagram, before queueing them.
pub(crate) fn check_event_size(event: &Event) -> Result<(), DispatchError> {
    let size = event.encoded_len()? + Header::SIZE + PACKAGE_OVERHEAD;
    if size > MAX_DATAGRAM_SIZE {
        return Err(DispatchError::SizeOverflow { size, max: MAX_DATAGRAM_SIZE });
    }
    Ok(())
}

struct QueuedEvent {
    event: Event,
    reliable: Option<ReliableState>,
}

struct ReliableState {
    retries_left: u32,
    ack_callback: Option<Callback>,
    timeout_callback: Option<Callback>,
}

struct PendingEvent {
    event: Event,
    state: ReliableState,
}

struct PendingPackage {
    sent_at: Instant,
    reliable: Vec<PendingEvent>,
}

/// The sans-I/O transport state machine for one remote peer.
pub struct Connection {
    remote_addr: SocketAddr,
    config: ConnectionConfig,
    local_seq: Seq,
    remote_seq: Seq,
    ack_bitfield: AckBitfield,
    /// Smoothed round-trip time in seconds.
    latency: f64,
    status: ConnectionStatus,
    throttle: Throttle,
    outgoing: VecDeque<QueuedEvent>,
    pending: HashMap<u16, PendingPackage>,
    last_recv: Option<Instant>,
    created_at: Instant,
}

impl Connection {
    /// Create a connection to `remote_addr` in the `Connecting` state.
    #[must_use]
    pub fn new(remote_addr: SocketAddr, config: ConnectionConfig, now: Instant) -> Self {
        let throttle = Throttle::new(config.throttle.clone());
        Connection {
            remote_addr,
            config,
            local_seq: Seq::NEVER,
            remote_seq: Seq::NEVER,
            ack_bitfield: AckBitfield::EMPTY,
            latency: 0.0,
            status: ConnectionStatus::Connecting,
            throttle,
            outgoing: VecDeque::new(),
            pending: HashMap::new(),
            last_recv: None,
            created_at: now,
        }
    }

    /// The peer's address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Smoothed round-trip time.
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency.max(0.0))
    }

    /// Current link quality.
    #[must_use]
    pub fn quality(&self) -> crate::throttle::Quality {
        self.throttle.quality()
    }

    /// Interval until the next send tick, selected by link quality.
    #[must_use]
    pub fn send_interval(&self) -> Duration {
        self.throttle.send_interval()
    }

    /// Sequence number of the newest package received from the peer.
    #[must_use]
    pub fn remote_seq(&self) -> Seq {
        self.remote_seq
    }

    /// Queue an event for the next outgoing package.
    ///
    /// Reliable events (a retry budget or any callback) are tracked against
    /// the package that carries them until acknowledged or timed out.
    ///
    /// # Errors
    ///
    /// [`DispatchError::SizeOverflow`] if the event alone can never fit a
    /// datagram; the event is not queued.
    pub fn queue_event(&mut self, event: Event, delivery: Delivery) -> Result<(), DispatchError> {
        check_event_size(&event)?;
        let reliable = delivery.is_reliable().then_some(ReliableState {
            retries_left: delivery.retries,
            ack_callback: delivery.ack_callback,
            timeout_callback: delivery.timeout_callback,
        });
        self.outgoing.push_back(QueuedEvent { event, reliable });
        Ok(())
    }

    /// Number of events waiting for an outgoing package.
    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.outgoing.len()
    }

    /// Build the next outgoing package: a fresh sequence number, the
    /// current acknowledgement state, and as many queued events as fit in
    /// `body_budget` bytes.
    ///
    /// The emission is recorded for round-trip measurement; reliable events
    /// are attached to the new sequence in the pending table.
    ///
    /// # Errors
    ///
    /// Propagates event serialization failures. The sequence number is not
    /// consumed in that case.
    pub fn assemble(
        &mut self,
        now: Instant,
        body_budget: usize,
    ) -> Result<(Header, Vec<Event>), DispatchError> {
        let mut used = 0;
        let mut taken = 0;
        // Measure before committing the sequence number.
        while let Some(queued) = self.outgoing.get(taken) {
            let len = queued.event.encoded_len()? + PER_EVENT_OVERHEAD;
            if used + len > body_budget {
                break;
            }
            used += len;
            taken += 1;
        }

        self.local_seq = self.local_seq.incremented();
        let header = Header {
            sequence: self.local_seq,
            ack: self.remote_seq,
            ack_bitfield: self.ack_bitfield,
        };

        let mut events = Vec::with_capacity(taken);
        let mut reliable = Vec::new();
        for queued in self.outgoing.drain(..taken) {
            if let Some(state) = queued.reliable {
                reliable.push(PendingEvent { event: queued.event.clone(), state });
            }
            events.push(queued.event);
        }
        self.pending
            .insert(self.local_seq.get(), PendingPackage { sent_at: now, reliable });

        trace!(
            peer = %self.remote_addr,
            sequence = %self.local_seq,
            events = events.len(),
            "assembled package"
        );
        Ok((header, events))
    }

    /// Process the header of a received package.
    ///
    /// On success the caller dispatches the package's events in order. On
    /// [`ConnectionError::DuplicateSequence`] or
    /// [`ConnectionError::StaleSequence`] the whole package must be
    /// dropped.
    ///
    /// # Errors
    ///
    /// See above; bookkeeping is untouched when an error is returned.
    pub fn receive(&mut self, header: &Header, now: Instant) -> Result<(), ConnectionError> {
        self.track_remote(header.sequence)?;
        // A valid package is proof of life even if it carries nothing.
        self.last_recv = Some(now);
        if self.status != ConnectionStatus::Connected {
            debug!(peer = %self.remote_addr, "peer connected");
            self.status = ConnectionStatus::Connected;
        }
        self.resolve_acks(header, now);
        Ok(())
    }

    fn track_remote(&mut self, received: Seq) -> Result<(), ConnectionError> {
        if self.remote_seq.is_never() {
            self.remote_seq = received;
            return Ok(());
        }
        let dist = received.dist(self.remote_seq);
        if dist > 0 {
            // Newer than anything seen: slide the window forward.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let gap = dist as u16;
            self.ack_bitfield = self.ack_bitfield.advanced(gap);
            self.remote_seq = received;
            Ok(())
        } else if dist == 0 {
            Err(ConnectionError::DuplicateSequence)
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let index = (-dist - 1) as u16;
            if index >= AckBitfield::LEN {
                return Err(ConnectionError::StaleSequence);
            }
            if self.ack_bitfield.is_set(index) {
                return Err(ConnectionError::DuplicateSequence);
            }
            self.ack_bitfield = self.ack_bitfield.with(index);
            Ok(())
        }
    }

    fn resolve_acks(&mut self, header: &Header, now: Instant) {
        let acked: Vec<u16> = self
            .pending
            .keys()
            .copied()
            .filter(|&seq| {
                let dist = header.ack.dist(Seq::new(seq));
                if dist == 0 {
                    return true;
                }
                if dist < 1 || dist > i32::from(AckBitfield::LEN) {
                    return false;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let index = (dist - 1) as u16;
                header.ack_bitfield.is_set(index)
            })
            .collect();

        for seq in acked {
            let Some(package) = self.pending.remove(&seq) else {
                continue;
            };
            let rtt = now.duration_since(package.sent_at);
            self.update_latency(rtt, now);
            for pending in package.reliable {
                trace!(peer = %self.remote_addr, sequence = seq, "reliable event acknowledged");
                if let Some(callback) = pending.state.ack_callback {
                    callback();
                }
            }
        }
    }

    fn update_latency(&mut self, rtt: Duration, now: Instant) {
        self.latency += LATENCY_SMOOTHING * (rtt.as_secs_f64() - self.latency);
        let smoothed = Duration::from_secs_f64(self.latency.max(0.0));
        if let Some(quality) = self.throttle.observe(smoothed, now) {
            debug!(peer = %self.remote_addr, ?quality, latency = ?smoothed, "link quality changed");
        }
    }

    /// Retry supervision: resolve pending packages older than the event
    /// timeout. Lost reliable events with retries left are re-queued for
    /// the next package; exhausted ones fire their timeout callback.
    ///
    /// Returns the number of packages declared lost.
    pub fn poll_timeouts(&mut self, now: Instant) -> usize {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, package)| now.duration_since(package.sent_at) > self.config.event_timeout)
            .map(|(&seq, _)| seq)
            .collect();

        for &seq in &expired {
            let Some(package) = self.pending.remove(&seq) else {
                continue;
            };
            for pending in package.reliable {
                let mut state = pending.state;
                if state.retries_left > 0 {
                    state.retries_left -= 1;
                    debug!(
                        peer = %self.remote_addr,
                        sequence = seq,
                        retries_left = state.retries_left,
                        event_type = %pending.event.event_type,
                        "package lost, re-queueing reliable event"
                    );
                    self.outgoing
                        .push_back(QueuedEvent { event: pending.event, reliable: Some(state) });
                } else {
                    warn!(
                        peer = %self.remote_addr,
                        sequence = seq,
                        event_type = %pending.event.event_type,
                        "reliable event timed out"
                    );
                    if let Some(callback) = state.timeout_callback {
                        callback();
                    }
                }
            }
        }

        // Keep the throttle moving even when no acks arrive.
        let smoothed = Duration::from_secs_f64(self.latency.max(0.0));
        if let Some(quality) = self.throttle.observe(smoothed, now) {
            debug!(peer = %self.remote_addr, ?quality, "link quality changed");
        }

        expired.len()
    }

    /// Classify peer liveness, reverting `Connected` to `Connecting` after
    /// the idle timeout. On [`Liveness::Dead`] the owner must call
    /// [`Connection::close`] and remove the connection.
    pub fn check_liveness(&mut self, now: Instant) -> Liveness {
        if self.status == ConnectionStatus::Disconnected {
            return Liveness::Dead;
        }
        let silent_for = now.duration_since(self.last_recv.unwrap_or(self.created_at));
        if silent_for > self.config.dead_timeout {
            return Liveness::Dead;
        }
        if silent_for > self.config.idle_timeout {
            if self.status == ConnectionStatus::Connected {
                warn!(peer = %self.remote_addr, ?silent_for, "peer idle, reconnecting");
                self.status = ConnectionStatus::Connecting;
            }
            return Liveness::Idle;
        }
        Liveness::Alive
    }

    /// Close the connection: every outstanding reliable event, whether
    /// pending or still queued, fires its timeout callback. Idempotent.
    pub fn close(&mut self) {
        if self.status == ConnectionStatus::Disconnected
            && self.pending.is_empty()
            && self.outgoing.is_empty()
        {
            return;
        }
        self.status = ConnectionStatus::Disconnected;
        for (_, package) in self.pending.drain() {
            for pending in package.reliable {
                if let Some(callback) = pending.state.timeout_callback {
                    callback();
                }
            }
        }
        for queued in self.outgoing.drain(..) {
            if let Some(state) = queued.reliable {
                if let Some(callback) = state.timeout_callback {
                    callback();
                }
            }
        }
        debug!(peer = %self.remote_addr, "connection closed");
    }
}
