//! The simulation loop driving the authoritative state forward.
//!
//! A [`GameStateMachine`] owns a store handle and the user's `time_step`
//! closure. Each iteration drains the events the server wired over,
//! dispatches them to registered handlers, invokes `time_step`, merges the
//! resulting patches (later patches win per key) and pushes them as one
//! [`StateUpdate`] with the next time order.
//!
//! The machine is fed through the [`EventWire`] trait, a one-way channel
//! the server pushes received events into, so the server never holds a
//! reference back into the simulation.
//!
//! `game_status` is `Active` while the loop runs and `Paused` while it is
//! stopped. Stopping is cooperative: [`MachineHandle::stop`] pushes a
//! `Paused` update, and the loop exits at the end of the iteration that
//! observes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_proto::{
    merge_changes, Event, GameState, GameStatus, StateChanges, StateUpdate, Value,
};

use crate::{
    events::{HandlerContext, HandlerResult, UniversalEventHandler},
    store::GameStateStore,
};

/// Default interval between simulation steps (50 Hz).
pub const DEFAULT_STEP_INTERVAL: Duration = Duration::from_millis(20);

/// Fraction of the step interval the event drain may consume before the
/// remaining events are deferred to the next iteration.
const EVENT_DRAIN_BUDGET: f64 = 0.95;

/// The user's simulation function: `(state, dt) -> patch`.
pub type TimeStepFn = Box<dyn FnMut(&GameState, f64) -> StateChanges + Send + Sync>;

/// An event on its way into the simulation, tagged with its sender.
pub struct WiredEvent {
    /// The received event.
    pub event: Event,
    /// Address of the client that sent it, if it came over the network.
    pub sender: Option<SocketAddr>,
}

/// One-way channel by which a server feeds received events into the
/// simulation.
pub trait EventWire: Send + Sync {
    /// Enqueue an event for the next simulation iteration.
    fn push_event(&self, event: Event, sender: Option<SocketAddr>);
}

/// Runs the simulation loop.
pub struct GameStateMachine {
    store: GameStateStore,
    handlers: Arc<RwLock<UniversalEventHandler>>,
    time_step: TimeStepFn,
    queue_tx: mpsc::UnboundedSender<WiredEvent>,
    queue_rx: mpsc::UnboundedReceiver<WiredEvent>,
    running: Arc<AtomicBool>,
    /// Accumulated simulated time in seconds.
    game_time: f64,
}

/// Cloneable handle for controlling a machine from outside its loop task:
/// stop it, register handlers, or wire events in.
#[derive(Clone)]
pub struct MachineHandle {
    store: GameStateStore,
    handlers: Arc<RwLock<UniversalEventHandler>>,
    queue_tx: mpsc::UnboundedSender<WiredEvent>,
    running: Arc<AtomicBool>,
}

impl GameStateMachine {
    /// Create a machine over a store with the user's `time_step`.
    #[must_use]
    pub fn new(
        store: GameStateStore,
        time_step: impl FnMut(&GameState, f64) -> StateChanges + Send + Sync + 'static,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        GameStateMachine {
            store,
            handlers: Arc::new(RwLock::new(UniversalEventHandler::new())),
            time_step: Box::new(time_step),
            queue_tx,
            queue_rx,
            running: Arc::new(AtomicBool::new(false)),
            game_time: 0.0,
        }
    }

    /// A control handle usable while (and after) the loop runs.
    #[must_use]
    pub fn handle(&self) -> MachineHandle {
        MachineHandle {
            store: self.store.clone(),
            handlers: Arc::clone(&self.handlers),
            queue_tx: self.queue_tx.clone(),
            running: Arc::clone(&self.running),
        }
    }

    /// Register a synchronous handler for simulation-loop events.
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

    /// Accumulated simulated time in seconds.
    #[must_use]
    pub fn game_time(&self) -> f64 {
        self.game_time
    }

    /// Run the simulation loop at `interval` until the state is paused.
    ///
    /// Starting an already running machine is a no-op. The first iteration
    /// pushes `game_status = Active`; the loop exits after observing
    /// `Paused` (pushed by [`MachineHandle::stop`]).
    pub async fn run_game_loop(&mut self, interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("simulation loop already running");
            return;
        }
        info!(interval = ?interval, "simulation loop starting");

        let state = self.store.game_state();
        if state.is_paused() {
            let mut changes = StateChanges::new();
            changes.insert(
                "game_status".into(),
                Value::Int(GameStatus::Active.as_int()),
            );
            self.store
                .push_update(StateUpdate::with_changes(state.time_order.incremented(), changes));
        }

        let mut game_state = self.store.game_state();
        let mut dt = interval.as_secs_f64();
        while game_state.game_status == GameStatus::Active {
            let step_started = Instant::now();
            let mut combined = StateChanges::new();

            // Dispatch queued events first; their patches are merged in
            // arrival order. Defer the rest once the drain threatens the
            // step budget.
            while let Ok(wired) = self.queue_rx.try_recv() {
                self.dispatch(wired, &game_state, dt, &mut combined).await;
                if step_started.elapsed() > interval.mul_f64(EVENT_DRAIN_BUDGET) {
                    break;
                }
            }

            // The simulation's own patch lands last and wins per key.
            let step_patch = (self.time_step)(&game_state, dt);
            merge_changes(&mut combined, step_patch);

            self.store.push_update(StateUpdate::with_changes(
                game_state.time_order.incremented(),
                combined,
            ));
            game_state = self.store.game_state();

            let elapsed = step_started.elapsed();
            dt = elapsed.as_secs_f64().max(interval.as_secs_f64());
            self.game_time += dt;
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(game_time = self.game_time, "simulation loop stopped");
    }

    async fn dispatch(
        &self,
        wired: WiredEvent,
        game_state: &GameState,
        dt: f64,
        combined: &mut StateChanges,
    ) {
        let handler = {
            self.handlers
                .read()
                .expect("event handler registry poisoned")
                .handler(&wired.event.event_type)
        };
        let Some(handler) = handler else {
            warn!(event_type = %wired.event.event_type, "no handler registered for event");
            return;
        };
        let context = HandlerContext {
            game_state: Some(game_state.clone()),
            client_address: wired.sender,
            dt: Some(dt),
        };
        match handler.call(&wired.event, &context).await {
            Ok(patch) => merge_changes(combined, patch),
            Err(error) => {
                warn!(event_type = %wired.event.event_type, %error, "event handler failed");
            }
        }
    }
}

impl MachineHandle {
    /// Register a synchronous handler for simulation-loop events.
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

    /// Register a suspending handler for simulation-loop events.
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

    /// Whether the simulation loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pause the simulation: push `game_status = Paused` and wait up to
    /// `timeout` for the loop to exit its current iteration.
    ///
    /// Returns whether the loop actually stopped. Stopping a stopped
    /// machine is a no-op that reports success.
    pub async fn stop(&self, timeout: Duration) -> bool {
        debug!("requesting simulation stop");
        let deadline = Instant::now() + timeout;
        loop {
            // Re-issue the pause until it sticks: a simulation step pushed
            // concurrently can carry the same time order and win, in which
            // case the state stays Active and we try again one order later.
            let state = self.store.game_state();
            if !state.is_paused() {
                let mut changes = StateChanges::new();
                changes.insert(
                    "game_status".into(),
                    Value::Int(GameStatus::Paused.as_int()),
                );
                self.store.push_update(StateUpdate::with_changes(
                    state.time_order.incremented(),
                    changes,
                ));
            }
            if !self.running.load(Ordering::SeqCst) {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("simulation loop did not stop within {timeout:?}");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl EventWire for MachineHandle {
    fn push_event(&self, event: Event, sender: Option<SocketAddr>) {
        // Send only fails when the machine is gone; events are best-effort
        // at that point.
        let _ = self.queue_tx.send(WiredEvent { event, sender });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial_state() -> GameState {
        let mut state = GameState::new();
        state.set("hp", 100i64);
        state
    }

    #[tokio::test]
    async fn loop_activates_steps_and_stops() {
        let store = GameStateStore::new(initial_state());
        let mut machine = GameStateMachine::new(store.clone(), |state, _dt| {
            let ticks = state.get("ticks").and_then(Value::as_int).unwrap_or(0);
            let mut changes = StateChanges::new();
            changes.insert("ticks".into(), Value::Int(ticks + 1));
            changes
        });
        let handle = machine.handle();

        let task = tokio::spawn(async move {
            machine.run_game_loop(Duration::from_millis(5)).await;
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_running());
        let state = store.game_state();
        assert_eq!(state.game_status, GameStatus::Active);
        let ticks = state.get("ticks").and_then(Value::as_int).unwrap_or(0);
        assert!(ticks >= 3, "expected a few steps, got {ticks}");

        assert!(handle.stop(Duration::from_secs(1)).await);
        task.await.unwrap();
        assert!(store.game_state().is_paused());
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn wired_events_reach_handlers_and_patch_state() {
        let store = GameStateStore::new(initial_state());
        let mut machine = GameStateMachine::new(store.clone(), |_, _| StateChanges::new());
        machine.register_event_handler("ATTACK", |event, context| {
            let state = context.game_state.as_ref().expect("snapshot injected");
            let hp = state.get("hp").and_then(Value::as_int).unwrap_or(0);
            let damage = event.kwargs.get("damage").and_then(Value::as_int).unwrap_or(0);
            let mut changes = StateChanges::new();
            changes.insert("hp".into(), Value::Int(hp - damage));
            Ok(changes)
        });
        let handle = machine.handle();

        let task = tokio::spawn(async move {
            machine.run_game_loop(Duration::from_millis(5)).await;
        });

        handle.push_event(Event::new("ATTACK").with_kwarg("damage", 10i64), None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            store.game_state().get("hp"),
            Some(&Value::Int(90))
        );

        handle.stop(Duration::from_secs(1)).await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_event_types_are_ignored() {
        let store = GameStateStore::new(initial_state());
        let mut machine = GameStateMachine::new(store.clone(), |_, _| StateChanges::new());
        let handle = machine.handle();

        let task = tokio::spawn(async move {
            machine.run_game_loop(Duration::from_millis(5)).await;
        });

        handle.push_event(Event::new("NOBODY_HOME"), None);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Still alive and still stepping.
        assert!(handle.is_running());
        handle.stop(Duration::from_secs(1)).await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn handler_errors_do_not_kill_the_loop() {
        let store = GameStateStore::new(initial_state());
        let mut machine = GameStateMachine::new(store.clone(), |_, _| StateChanges::new());
        machine.register_event_handler("BOOM", |_, _| Err("handler exploded".into()));
        let handle = machine.handle();

        let task = tokio::spawn(async move {
            machine.run_game_loop(Duration::from_millis(5)).await;
        });

        handle.push_event(Event::new("BOOM"), None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_running());

        handle.stop(Duration::from_secs(1)).await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stopping_a_stopped_machine_is_a_noop() {
        let store = GameStateStore::new(initial_state());
        let machine = GameStateMachine::new(store, |_, _| StateChanges::new());
        let handle = machine.handle();
        assert!(handle.stop(Duration::from_millis(50)).await);
        assert!(handle.stop(Duration::from_millis(50)).await);
    }
}
