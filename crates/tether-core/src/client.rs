//! Client façade: one connection and a local state mirror.
//!
//! A client owns exactly one [`Connection`] to a server plus a mirror
//! [`GameState`] kept in sync by the deltas embedded in received
//! server packages. User code reads the mirror through a scoped accessor
//! that holds the mirror mutex for the guard's lifetime; the connection
//! task will not apply updates while an accessor is live.
//!
//! Outgoing packages carry the mirror's current `time_order`, which is how
//! the server knows which delta this client still needs.

use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tether_proto::{
    ClientPackage, Event, GameState, Header, ServerPackage, MAX_DATAGRAM_SIZE, SHUTDOWN_EVENT,
};

use crate::{
    connection::{
        check_event_size, Connection, ConnectionConfig, ConnectionStatus, Delivery, Liveness,
    },
    error::{ConnectionError, DispatchError},
    events::{HandlerContext, HandlerResult, UniversalEventHandler},
    socket::DatagramSocket,
};

/// Bytes reserved for body framing when budgeting events in a client
/// package.
const CLIENT_BODY_RESERVE: usize = 32;

enum ClientCommand {
    Dispatch { event: Event, delivery: Delivery },
    Close { flush: bool },
}

enum LinkTask {
    /// Actor spawned onto the caller's runtime.
    Spawned(JoinHandle<()>),
    /// Actor driven by a dedicated thread with its own runtime.
    Thread(std::thread::JoinHandle<()>),
}

struct Link {
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    task: LinkTask,
}

#[derive(Clone, Copy)]
struct LinkInfo {
    status: ConnectionStatus,
    latency: Duration,
}

/// Scoped read access to the client's state mirror.
///
/// The mirror mutex is held for the guard's lifetime; drop it promptly.
pub struct GameStateGuard<'a> {
    guard: std::sync::MutexGuard<'a, GameState>,
}

impl Deref for GameStateGuard<'_> {
    type Target = GameState;

    fn deref(&self) -> &GameState {
        &self.guard
    }
}

/// Connects to a server and mirrors its game state.
pub struct Client {
    handlers: Arc<RwLock<UniversalEventHandler>>,
    mirror: Arc<Mutex<GameState>>,
    info: Arc<Mutex<LinkInfo>>,
    link: Option<Link>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    /// A disconnected client with an empty mirror.
    #[must_use]
    pub fn new() -> Self {
        Client {
            handlers: Arc::new(RwLock::new(UniversalEventHandler::new())),
            mirror: Arc::new(Mutex::new(GameState::new())),
            info: Arc::new(Mutex::new(LinkInfo {
                status: ConnectionStatus::Disconnected,
                latency: Duration::ZERO,
            })),
            link: None,
        }
    }

    /// Register a synchronous handler for events arriving from the server.
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

    /// Register a suspending handler for events arriving from the server.
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

    /// Connect to `host:port` over a fresh UDP socket.
    ///
    /// Returns once the connection task is running; the mirror fills in as
    /// soon as the first server package arrives.
    ///
    /// # Errors
    ///
    /// Propagates bind and resolution failures, or an error if already
    /// connected.
    pub async fn connect(&mut self, port: u16, host: &str) -> io::Result<()> {
        let remote = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}:{port}"))
            })?;
        let socket = crate::socket::bind_udp("0.0.0.0", 0).await?;
        self.connect_with_socket(socket, remote, ConnectionConfig::default())
    }

    /// Connect over an explicit socket with explicit tuning. This is the
    /// seam the test harness uses to inject lossy links.
    ///
    /// # Errors
    ///
    /// Fails if the client is already connected.
    pub fn connect_with_socket(
        &mut self,
        socket: Arc<dyn DatagramSocket>,
        remote: SocketAddr,
        config: ConnectionConfig,
    ) -> io::Result<()> {
        if self.link.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already connected"));
        }
        info!(server = %remote, "connecting");
        {
            let mut info = self.lock_info();
            info.status = ConnectionStatus::Connecting;
            info.latency = Duration::ZERO;
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let actor = ClientActor {
            remote,
            socket,
            config,
            handlers: Arc::clone(&self.handlers),
            mirror: Arc::clone(&self.mirror),
            info: Arc::clone(&self.info),
        };
        let task = LinkTask::Spawned(tokio::spawn(actor.run(command_rx)));
        self.link = Some(Link { command_tx, task });
        Ok(())
    }

    /// Connect like [`Client::connect`], but drive the connection from a
    /// dedicated OS thread with its own runtime, so the rest of the
    /// application may use blocking APIs.
    ///
    /// Resolution or bind failures inside the thread surface as a
    /// `Disconnected` status rather than an error.
    ///
    /// # Errors
    ///
    /// Fails if already connected or the thread cannot be spawned.
    pub fn connect_in_thread(&mut self, port: u16, host: &str) -> io::Result<()> {
        if self.link.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already connected"));
        }
        info!(server = %format!("{host}:{port}"), "connecting in thread");
        {
            let mut info = self.lock_info();
            info.status = ConnectionStatus::Connecting;
            info.latency = Duration::ZERO;
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let host = host.to_owned();
        let handlers = Arc::clone(&self.handlers);
        let mirror = Arc::clone(&self.mirror);
        let link_info = Arc::clone(&self.info);
        let thread = std::thread::Builder::new()
            .name("tether-client".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        warn!(%error, "failed to build client runtime");
                        link_info.lock().expect("link info mutex poisoned").status =
                            ConnectionStatus::Disconnected;
                        return;
                    }
                };
                runtime.block_on(async move {
                    let remote = tokio::net::lookup_host((host.as_str(), port))
                        .await
                        .ok()
                        .and_then(|mut addrs| addrs.next());
                    let socket = crate::socket::bind_udp("0.0.0.0", 0).await;
                    let (Some(remote), Ok(socket)) = (remote, socket) else {
                        warn!(%host, port, "failed to reach server");
                        link_info.lock().expect("link info mutex poisoned").status =
                            ConnectionStatus::Disconnected;
                        return;
                    };
                    let actor = ClientActor {
                        remote,
                        socket,
                        config: ConnectionConfig::default(),
                        handlers,
                        mirror,
                        info: link_info,
                    };
                    actor.run(command_rx).await;
                });
            })?;
        self.link = Some(Link { command_tx, task: LinkTask::Thread(thread) });
        Ok(())
    }

    /// Scoped read access to the mirrored game state.
    #[must_use]
    pub fn access_game_state(&self) -> GameStateGuard<'_> {
        GameStateGuard {
            guard: self.mirror.lock().expect("state mirror mutex poisoned"),
        }
    }

    /// Send an event to the server with the given delivery options.
    ///
    /// # Errors
    ///
    /// [`DispatchError::SizeOverflow`] for events that can never fit a
    /// datagram; [`DispatchError::Disconnected`] when not connected.
    pub fn dispatch_event(&self, event: Event, delivery: Delivery) -> Result<(), DispatchError> {
        check_event_size(&event)?;
        let link = self.link.as_ref().ok_or(DispatchError::Disconnected)?;
        link.command_tx
            .send(ClientCommand::Dispatch { event, delivery })
            .map_err(|_| DispatchError::Disconnected)
    }

    /// Current connection status.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.lock_info().status
    }

    /// Smoothed round-trip time to the server.
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.lock_info().latency
    }

    /// Close the connection. With `shutdown_server` the reserved shutdown
    /// event is flushed out first. The server honors it only if this
    /// client is the host. Idempotent.
    pub async fn disconnect(&mut self, shutdown_server: bool) {
        let Some(link) = self.link.take() else { return };
        if shutdown_server {
            let _ = link.command_tx.send(ClientCommand::Dispatch {
                event: Event::new(SHUTDOWN_EVENT),
                delivery: Delivery::unreliable(),
            });
        }
        let _ = link
            .command_tx
            .send(ClientCommand::Close { flush: shutdown_server });
        match link.task {
            LinkTask::Spawned(task) => {
                let _ = task.await;
            }
            LinkTask::Thread(thread) => {
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
            }
        }
        debug!("disconnected");
    }

    fn lock_info(&self) -> std::sync::MutexGuard<'_, LinkInfo> {
        self.info.lock().expect("link info mutex poisoned")
    }
}

/// The client's connection task.
struct ClientActor {
    remote: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    config: ConnectionConfig,
    handlers: Arc<RwLock<UniversalEventHandler>>,
    mirror: Arc<Mutex<GameState>>,
    info: Arc<Mutex<LinkInfo>>,
}

impl ClientActor {
    async fn run(self, mut command_rx: mpsc::UnboundedReceiver<ClientCommand>) {
        let mut conn = Connection::new(self.remote, self.config.clone(), Instant::now());
        let mut next_send = tokio::time::Instant::now() + conn.send_interval();
        let supervise_period = (self.config.event_timeout / 2).min(Duration::from_millis(250));
        let mut supervise = tokio::time::interval(supervise_period);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) if from == self.remote => {
                            self.handle_datagram(&mut conn, &buf[..len]).await;
                        }
                        Ok((_, from)) => {
                            trace!(peer = %from, "ignoring datagram from unknown peer");
                        }
                        Err(error) => warn!(%error, "socket receive failed"),
                    }
                }
                maybe = command_rx.recv() => {
                    match maybe {
                        Some(ClientCommand::Dispatch { event, delivery }) => {
                            if let Err(error) = conn.queue_event(event, delivery) {
                                warn!(%error, "failed to queue event");
                            }
                        }
                        Some(ClientCommand::Close { flush }) => {
                            if flush {
                                self.send_package(&mut conn).await;
                            }
                            break;
                        }
                        None => break,
                    }
                }
                () = tokio::time::sleep_until(next_send) => {
                    self.send_package(&mut conn).await;
                    next_send = tokio::time::Instant::now() + conn.send_interval();
                }
                _ = supervise.tick() => {
                    let now = Instant::now();
                    conn.poll_timeouts(now);
                    if conn.check_liveness(now) == Liveness::Dead {
                        warn!(server = %self.remote, "server unreachable, closing");
                        break;
                    }
                }
            }
            self.publish(&conn);
        }

        conn.close();
        self.publish(&conn);
        debug!(server = %self.remote, "connection task finished");
    }

    async fn handle_datagram(&self, conn: &mut Connection, datagram: &[u8]) {
        let package = match ServerPackage::from_datagram(datagram) {
            Ok(package) => package,
            Err(error) => {
                warn!(%error, "dropping malformed datagram");
                return;
            }
        };
        match conn.receive(&package.header, Instant::now()) {
            Ok(()) => {
                let snapshot = {
                    let mut mirror = self.mirror.lock().expect("state mirror mutex poisoned");
                    mirror.apply(&package.update);
                    mirror.clone()
                };
                for event in package.events {
                    self.handle_event(event, &snapshot).await;
                }
            }
            Err(ConnectionError::DuplicateSequence | ConnectionError::StaleSequence) => {
                trace!(sequence = %package.header.sequence, "dropping duplicate package");
            }
            Err(error) => warn!(%error, "failed to process package"),
        }
    }

    async fn handle_event(&self, event: Event, snapshot: &GameState) {
        let handler = {
            self.handlers
                .read()
                .expect("event handler registry poisoned")
                .handler(&event.event_type)
        };
        let Some(handler) = handler else {
            warn!(event_type = %event.event_type, "no handler registered for event");
            return;
        };
        let context = HandlerContext {
            game_state: Some(snapshot.clone()),
            client_address: None,
            dt: None,
        };
        if let Err(error) = handler.call(&event, &context).await {
            warn!(event_type = %event.event_type, %error, "event handler failed");
        }
    }

    async fn send_package(&self, conn: &mut Connection) {
        let time_order = {
            self.mirror
                .lock()
                .expect("state mirror mutex poisoned")
                .time_order
        };
        let budget = MAX_DATAGRAM_SIZE.saturating_sub(Header::SIZE + CLIENT_BODY_RESERVE);
        let (header, events) = match conn.assemble(Instant::now(), budget) {
            Ok(assembled) => assembled,
            Err(error) => {
                warn!(%error, "failed to assemble package");
                return;
            }
        };
        let package = ClientPackage { header, time_order, events };
        match package.to_datagram() {
            Ok(bytes) => {
                if let Err(error) = self.socket.send_to(&bytes, self.remote).await {
                    warn!(%error, "failed to send package");
                }
            }
            Err(error) => warn!(%error, "failed to encode package"),
        }
    }

    fn publish(&self, conn: &Connection) {
        let mut info = self.info.lock().expect("link info mutex poisoned");
        info.status = conn.status();
        info.latency = conn.latency();
    }
}
