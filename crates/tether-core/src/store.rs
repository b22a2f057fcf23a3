//! Thread-safe repository for the authoritative game state.
//!
//! The store owns the current [`GameState`] and a bounded ring of recent
//! [`StateUpdate`]s keyed by time order. The game state machine is the
//! only writer; server connections and user code read concurrently through
//! cheap clone-to-share handles. The internal lock is held only for the
//! duration of a store operation, never across user code.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::trace;

use tether_proto::{GameState, Seq, StateUpdate};

/// Default number of recent updates kept for delta synchronization.
pub const DEFAULT_UPDATE_CACHE_SIZE: usize = 100;

/// Shared handle to the game state and its update cache.
#[derive(Clone)]
pub struct GameStateStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    state: GameState,
    cache: VecDeque<StateUpdate>,
    capacity: usize,
}

impl GameStateStore {
    /// Create a store around an initial state, with the default cache
    /// capacity.
    #[must_use]
    pub fn new(initial_state: GameState) -> Self {
        Self::with_capacity(initial_state, DEFAULT_UPDATE_CACHE_SIZE)
    }

    /// Create a store with an explicit update-cache capacity.
    #[must_use]
    pub fn with_capacity(initial_state: GameState, capacity: usize) -> Self {
        GameStateStore {
            inner: Arc::new(Mutex::new(StoreInner {
                state: initial_state,
                cache: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn game_state(&self) -> GameState {
        self.lock().state.clone()
    }

    /// Apply an update to the state and remember it in the cache, evicting
    /// the oldest entry when full.
    ///
    /// Callers must push updates with strictly increasing time orders;
    /// afterwards `state.time_order` equals the newest cached time order.
    pub fn push_update(&self, update: StateUpdate) {
        let mut inner = self.lock();
        inner.state.apply(&update);
        trace!(time_order = %update.time_order, changes = update.changes.len(), "state update pushed");
        inner.cache.push_back(update);
        while inner.cache.len() > inner.capacity {
            inner.cache.pop_front();
        }
    }

    /// The composed update that takes a client from `client_time_order` to
    /// the current state.
    ///
    /// A client outside the cache window, including one that has never
    /// received anything (`time_order` 0), gets a synthetic full-state
    /// update so it can resynchronize exactly.
    #[must_use]
    pub fn updates_since(&self, client_time_order: Seq) -> StateUpdate {
        let inner = self.lock();
        let cache_miss = client_time_order.is_never()
            || inner
                .cache
                .front()
                .map_or(true, |oldest| oldest.time_order.dist(client_time_order) > 1);
        if cache_miss {
            return inner.state.as_full_update();
        }
        inner
            .cache
            .iter()
            .filter(|update| update.time_order.newer_than(client_time_order))
            .fold(StateUpdate::new(client_time_order), |acc, update| {
                acc.merged(update.clone())
            })
    }

    /// Number of cached updates.
    #[must_use]
    pub fn cached_updates(&self) -> usize {
        self.lock().cache.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("game state store mutex poisoned")
    }
}
