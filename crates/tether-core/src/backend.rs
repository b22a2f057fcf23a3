//! One-stop assembly of store, state machine, and server.
//!
//! `Backend` is the entry point for game backends: give it an initial
//! state and a `time_step` closure, register event handlers, and run. It
//! wires the server's event wire into the machine, runs both, and tears
//! both down on shutdown.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use tether_proto::{GameState, StateChanges};

use crate::{
    machine::{GameStateMachine, MachineHandle, DEFAULT_STEP_INTERVAL},
    server::Server,
    socket::DatagramSocket,
    store::GameStateStore,
};

/// How long shutdown waits for the simulation loop to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// A complete game backend: authoritative store, simulation loop, and
/// server.
pub struct Backend {
    store: GameStateStore,
    server: Arc<Server>,
    machine: Mutex<Option<GameStateMachine>>,
    machine_handle: MachineHandle,
    step_interval: Duration,
}

impl Backend {
    /// Build a backend around an initial state and the simulation's
    /// `time_step` function.
    #[must_use]
    pub fn new(
        initial_state: GameState,
        time_step: impl FnMut(&GameState, f64) -> StateChanges + Send + Sync + 'static,
    ) -> Self {
        let store = GameStateStore::new(initial_state);
        let machine = GameStateMachine::new(store.clone(), time_step);
        let machine_handle = machine.handle();
        let mut server = Server::new(store.clone());
        server.set_event_wire(Arc::new(machine_handle.clone()));
        Backend {
            store,
            server: Arc::new(server),
            machine: Mutex::new(Some(machine)),
            machine_handle,
            step_interval: DEFAULT_STEP_INTERVAL,
        }
    }

    /// Override the simulation step interval (default 20 ms).
    #[must_use]
    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    /// The authoritative state store.
    #[must_use]
    pub fn store(&self) -> &GameStateStore {
        &self.store
    }

    /// The server façade, for dispatching events to clients and
    /// registering receive-path handlers.
    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// The state machine handle, for registering simulation-loop event
    /// handlers.
    #[must_use]
    pub fn machine(&self) -> &MachineHandle {
        &self.machine_handle
    }

    /// Bind UDP on `host:port` and run the simulation loop and server
    /// until shutdown. Port `0` asks the OS for one; read it from
    /// `backend.server().local_addr()`.
    ///
    /// # Errors
    ///
    /// Bind failures, or calling `run` twice.
    pub async fn run(&self, host: &str, port: u16) -> io::Result<()> {
        let socket = crate::socket::bind_udp(host, port).await?;
        self.run_with_socket(socket).await
    }

    /// Run on an already bound socket until shutdown.
    ///
    /// # Errors
    ///
    /// Fails if the backend was already run.
    pub async fn run_with_socket(&self, socket: Arc<dyn DatagramSocket>) -> io::Result<()> {
        let mut machine = self
            .machine
            .lock()
            .expect("machine slot mutex poisoned")
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "backend already ran"))?;

        let interval = self.step_interval;
        let simulation = tokio::spawn(async move {
            machine.run_game_loop(interval).await;
        });

        let result = self.server.run(socket).await;

        self.machine_handle.stop(STOP_TIMEOUT).await;
        let _ = simulation.await;
        debug!("backend finished");
        result
    }

    /// Run in a dedicated OS thread with its own runtime, so callers may
    /// use blocking APIs elsewhere.
    pub fn run_in_thread(
        self: &Arc<Self>,
        host: String,
        port: u16,
    ) -> std::thread::JoinHandle<io::Result<()>> {
        let backend = Arc::clone(self);
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(backend.run(&host, port))
        })
    }

    /// Stop the server and the simulation loop. Idempotent.
    pub async fn shutdown(&self) {
        self.server.shutdown();
        self.machine_handle.stop(STOP_TIMEOUT).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backend_starts_and_shuts_down() {
        let mut initial = GameState::new();
        initial.set("hp", 100i64);
        let backend = Arc::new(Backend::new(initial, |_, _| StateChanges::new()));

        let runner = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run("127.0.0.1", 0).await })
        };

        // Wait until the socket is bound and the simulation is stepping.
        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.server().local_addr().is_none()
            || !backend.machine().is_running()
            || backend.store().game_state().is_paused()
        {
            assert!(Instant::now() < deadline, "backend did not start");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!backend.store().game_state().is_paused());

        backend.shutdown().await;
        runner.await.unwrap().unwrap();
        assert!(backend.store().game_state().is_paused());
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let backend = Backend::new(GameState::new(), |_, _| StateChanges::new());
        backend.server().shutdown();
        // First run returns immediately (already shut down)...
        backend.run("127.0.0.1", 0).await.unwrap();
        // ...and the machine slot is consumed.
        assert!(backend.run("127.0.0.1", 0).await.is_err());
    }
}
