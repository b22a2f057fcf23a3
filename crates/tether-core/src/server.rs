//! Server façade: one UDP endpoint, many per-client connections.
//!
//! The server owns the connection map. Its routing loop reads datagrams
//! off the shared socket and forwards each to the connection actor for the
//! sending address, creating a new actor for unknown peers. The first peer
//! to connect becomes the *host client*: the one address allowed to
//! trigger shutdown with the reserved [`SHUTDOWN_EVENT`].
//!
//! Each connection actor multiplexes four concerns over a `select!` loop:
//! inbound datagrams, dispatch commands from the façade, the send tick
//! (rate chosen by link quality), and a slower supervision tick for
//! retries and liveness. Received events are handled by the server-side
//! registry and forwarded over the event wire into the simulation.
//!
//! Shutdown is idempotent: it flips a watch channel every actor listens
//! on; actors close their engines (firing outstanding timeout callbacks)
//! and the routing loop drains them before returning.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use tether_proto::{
    ClientPackage, Event, Header, Seq, ServerPackage, MAGIC, MAX_DATAGRAM_SIZE, SHUTDOWN_EVENT,
};

use crate::{
    connection::{check_event_size, Connection, ConnectionConfig, Delivery, Liveness},
    error::{ConnectionError, DispatchError},
    events::{HandlerContext, HandlerResult, UniversalEventHandler},
    machine::EventWire,
    socket::DatagramSocket,
    store::GameStateStore,
};

/// Bytes reserved for body framing when budgeting events around the
/// server's state update.
const SERVER_BODY_RESERVE: usize = 48;

/// Who an event dispatched from the server is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    /// Every connected client.
    All,
    /// One client by address.
    Client(SocketAddr),
}

enum ActorCommand {
    Dispatch { event: Event, delivery: Delivery },
}

struct ConnectionHandle {
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    command_tx: mpsc::UnboundedSender<ActorCommand>,
}

/// Listens to clients and orchestrates the flow of events and state
/// updates. Game logic lives in the state machine; state in the store.
pub struct Server {
    store: GameStateStore,
    config: ConnectionConfig,
    handlers: Arc<RwLock<UniversalEventHandler>>,
    event_wire: Option<Arc<dyn EventWire>>,
    connections: Arc<Mutex<HashMap<SocketAddr, ConnectionHandle>>>,
    host_client: Arc<Mutex<Option<SocketAddr>>>,
    shutdown: Arc<watch::Sender<bool>>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl Server {
    /// Create a server over a state store with default connection tuning.
    #[must_use]
    pub fn new(store: GameStateStore) -> Self {
        Self::with_config(store, ConnectionConfig::default())
    }

    /// Create a server with explicit connection tuning.
    #[must_use]
    pub fn with_config(store: GameStateStore, config: ConnectionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Server {
            store,
            config,
            handlers: Arc::new(RwLock::new(UniversalEventHandler::new())),
            event_wire: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            host_client: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(shutdown),
            local_addr: Arc::new(Mutex::new(None)),
        }
    }

    /// Wire received events into a simulation (typically a
    /// [`MachineHandle`](crate::machine::MachineHandle)).
    pub fn set_event_wire(&mut self, wire: Arc<dyn EventWire>) {
        self.event_wire = Some(wire);
    }

    /// Register a synchronous receive-path handler. These run when an
    /// event arrives, distinct from simulation-loop handlers.
    pub fn register_event_handler(
        &self,
        event_type: impl Into<String>,
        handler: impl Fn(&Event, &HandlerContext) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .expect("event handler registry poisoned")
            .register(event_type, handler);
    }

    /// Register a suspending receive-path handler.
    pub fn register_async_event_handler<F, Fut>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Event, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers
            .write()
            .expect("event handler registry poisoned")
            .register_async(event_type, handler);
    }

    /// Bind a UDP socket and serve until shutdown. Port `0` lets the OS
    /// choose; read the result from [`Server::local_addr`].
    ///
    /// # Errors
    ///
    /// Propagates bind failures.
    pub async fn run_udp(&self, host: &str, port: u16) -> io::Result<()> {
        let socket = crate::socket::bind_udp(host, port).await?;
        self.run(socket).await
    }

    /// Serve on an already bound socket until shutdown.
    ///
    /// # Errors
    ///
    /// Currently infallible after startup; socket receive errors are
    /// logged and retried.
    pub async fn run(&self, socket: Arc<dyn DatagramSocket>) -> io::Result<()> {
        if *self.shutdown.borrow() {
            return Ok(());
        }
        *self.lock_local_addr() = socket.local_addr().ok();
        info!(addr = ?socket.local_addr().ok(), "server listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut actors: JoinSet<()> = JoinSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.route(&buf[..len], from, &socket, &mut actors),
                        Err(error) => warn!(%error, "socket receive failed"),
                    }
                }
                // Reap actors whose peers died.
                Some(_) = actors.join_next(), if !actors.is_empty() => {}
            }
        }

        info!("server shutting down");
        self.lock_connections().clear();
        while actors.join_next().await.is_some() {}
        *self.lock_local_addr() = None;
        Ok(())
    }

    fn route(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        socket: &Arc<dyn DatagramSocket>,
        actors: &mut JoinSet<()>,
    ) {
        if datagram.len() < MAGIC.len() || datagram[..MAGIC.len()] != MAGIC {
            trace!(peer = %from, "dropping foreign datagram");
            return;
        }
        let mut connections = self.lock_connections();
        let handle = connections.entry(from).or_insert_with(|| {
            {
                let mut host = self.host_client.lock().expect("host client mutex poisoned");
                if host.is_none() {
                    info!(peer = %from, "host client assigned");
                    *host = Some(from);
                }
            }
            info!(peer = %from, "new client connection");
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let actor = ServerActor {
                addr: from,
                socket: Arc::clone(socket),
                store: self.store.clone(),
                config: self.config.clone(),
                handlers: Arc::clone(&self.handlers),
                event_wire: self.event_wire.clone(),
                host_client: Arc::clone(&self.host_client),
                connections: Arc::clone(&self.connections),
                shutdown: Arc::clone(&self.shutdown),
            };
            actors.spawn(actor.run(inbound_rx, command_rx));
            ConnectionHandle { inbound_tx, command_tx }
        });
        let _ = handle.inbound_tx.send(datagram.to_vec());
    }

    /// Request shutdown. Idempotent; safe to call from any task.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Address the socket is bound to while the server runs.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.lock_local_addr()
    }

    /// Address of the host client, once one has connected.
    #[must_use]
    pub fn host_client(&self) -> Option<SocketAddr> {
        *self.host_client.lock().expect("host client mutex poisoned")
    }

    /// Number of live client connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Send an event to one or all clients, resent up to `retries` times
    /// on loss. Returns how many connections it was queued on.
    ///
    /// # Errors
    ///
    /// [`DispatchError::SizeOverflow`] for events that can never fit a
    /// datagram; [`DispatchError::UnknownClient`] for an unconnected
    /// target address.
    pub fn dispatch_event(
        &self,
        event: Event,
        target: EventTarget,
        retries: u32,
    ) -> Result<usize, DispatchError> {
        check_event_size(&event)?;
        let connections = self.lock_connections();
        match target {
            EventTarget::All => {
                for handle in connections.values() {
                    let _ = handle.command_tx.send(ActorCommand::Dispatch {
                        event: event.clone(),
                        delivery: Delivery::with_retries(retries),
                    });
                }
                Ok(connections.len())
            }
            EventTarget::Client(addr) => {
                let handle = connections
                    .get(&addr)
                    .ok_or(DispatchError::UnknownClient(addr))?;
                handle
                    .command_tx
                    .send(ActorCommand::Dispatch {
                        event,
                        delivery: Delivery::with_retries(retries),
                    })
                    .map_err(|_| DispatchError::UnknownClient(addr))?;
                Ok(1)
            }
        }
    }

    /// Send an event to one client with full delivery options (ack and
    /// timeout callbacks).
    ///
    /// # Errors
    ///
    /// Same as [`Server::dispatch_event`].
    pub fn dispatch_event_with(
        &self,
        event: Event,
        target: SocketAddr,
        delivery: Delivery,
    ) -> Result<(), DispatchError> {
        check_event_size(&event)?;
        let connections = self.lock_connections();
        let handle = connections
            .get(&target)
            .ok_or(DispatchError::UnknownClient(target))?;
        handle
            .command_tx
            .send(ActorCommand::Dispatch { event, delivery })
            .map_err(|_| DispatchError::UnknownClient(target))
    }

    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, ConnectionHandle>> {
        self.connections.lock().expect("connection map mutex poisoned")
    }

    fn lock_local_addr(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.local_addr.lock().expect("local addr mutex poisoned")
    }
}

/// Per-client connection actor: owns the engine for one peer.
struct ServerActor {
    addr: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    store: GameStateStore,
    config: ConnectionConfig,
    handlers: Arc<RwLock<UniversalEventHandler>>,
    event_wire: Option<Arc<dyn EventWire>>,
    host_client: Arc<Mutex<Option<SocketAddr>>>,
    connections: Arc<Mutex<HashMap<SocketAddr, ConnectionHandle>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerActor {
    async fn run(
        self,
        mut inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut command_rx: mpsc::UnboundedReceiver<ActorCommand>,
    ) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut conn = Connection::new(self.addr, self.config.clone(), Instant::now());
        let mut last_client_time_order = Seq::NEVER;
        let mut next_send = tokio::time::Instant::now() + conn.send_interval();
        let supervise_period = (self.config.event_timeout / 2).min(Duration::from_millis(250));
        let mut supervise = tokio::time::interval(supervise_period);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                maybe = inbound_rx.recv() => {
                    let Some(datagram) = maybe else { break };
                    self.handle_datagram(&mut conn, &datagram, &mut last_client_time_order)
                        .await;
                }
                maybe = command_rx.recv() => {
                    let Some(ActorCommand::Dispatch { event, delivery }) = maybe else { break };
                    if let Err(error) = conn.queue_event(event, delivery) {
                        warn!(peer = %self.addr, %error, "failed to queue event");
                    }
                }
                () = tokio::time::sleep_until(next_send) => {
                    self.send_package(&mut conn, last_client_time_order).await;
                    next_send = tokio::time::Instant::now() + conn.send_interval();
                }
                _ = supervise.tick() => {
                    let now = Instant::now();
                    conn.poll_timeouts(now);
                    if conn.check_liveness(now) == Liveness::Dead {
                        warn!(peer = %self.addr, "peer dead, closing connection");
                        break;
                    }
                }
            }
        }

        conn.close();
        self.connections
            .lock()
            .expect("connection map mutex poisoned")
            .remove(&self.addr);
        debug!(peer = %self.addr, "connection actor finished");
    }

    async fn handle_datagram(
        &self,
        conn: &mut Connection,
        datagram: &[u8],
        last_client_time_order: &mut Seq,
    ) {
        let package = match ClientPackage::from_datagram(datagram) {
            Ok(package) => package,
            Err(error) => {
                warn!(peer = %self.addr, %error, "dropping malformed datagram");
                return;
            }
        };
        match conn.receive(&package.header, Instant::now()) {
            Ok(()) => {
                *last_client_time_order = package.time_order;
                for event in package.events {
                    self.handle_event(event).await;
                }
            }
            Err(ConnectionError::DuplicateSequence | ConnectionError::StaleSequence) => {
                trace!(peer = %self.addr, sequence = %package.header.sequence, "dropping duplicate package");
            }
            Err(error) => {
                warn!(peer = %self.addr, %error, "failed to process package");
            }
        }
    }

    async fn handle_event(&self, event: Event) {
        if event.event_type == SHUTDOWN_EVENT {
            let is_host = {
                *self.host_client.lock().expect("host client mutex poisoned") == Some(self.addr)
            };
            if is_host {
                info!(peer = %self.addr, "shutdown requested by host client");
                let _ = self.shutdown.send(true);
            } else {
                warn!(peer = %self.addr, "shutdown refused: not the host client");
            }
            return;
        }
        if event.is_reserved() {
            warn!(peer = %self.addr, event_type = %event.event_type, "ignoring unknown reserved event");
            return;
        }

        let handler = {
            self.handlers
                .read()
                .expect("event handler registry poisoned")
                .handler(&event.event_type)
        };
        if let Some(handler) = handler {
            let context = HandlerContext {
                game_state: Some(self.store.game_state()),
                client_address: Some(self.addr),
                dt: None,
            };
            if let Err(error) = handler.call(&event, &context).await {
                warn!(peer = %self.addr, event_type = %event.event_type, %error, "server event handler failed");
            }
        } else if self.event_wire.is_none() {
            warn!(event_type = %event.event_type, "no handler registered for event");
        }

        if let Some(wire) = &self.event_wire {
            wire.push_event(event, Some(self.addr));
        }
    }

    async fn send_package(&self, conn: &mut Connection, last_client_time_order: Seq) {
        let update = self.store.updates_since(last_client_time_order);
        let update_len = match update.encoded_len() {
            Ok(len) => len,
            Err(error) => {
                warn!(peer = %self.addr, %error, "failed to size state update");
                return;
            }
        };
        let budget =
            MAX_DATAGRAM_SIZE.saturating_sub(Header::SIZE + update_len + SERVER_BODY_RESERVE);
        let (header, events) = match conn.assemble(Instant::now(), budget) {
            Ok(assembled) => assembled,
            Err(error) => {
                warn!(peer = %self.addr, %error, "failed to assemble package");
                return;
            }
        };
        let package = ServerPackage { header, update, events };
        match package.to_datagram() {
            Ok(bytes) => {
                if let Err(error) = self.socket.send_to(&bytes, self.addr).await {
                    warn!(peer = %self.addr, %error, "failed to send package");
                }
            }
            Err(error) => {
                warn!(peer = %self.addr, %error, "failed to encode package");
            }
        }
    }
}
