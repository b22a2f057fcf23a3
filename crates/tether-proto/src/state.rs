//! Replicated game state and the sparse deltas that evolve it.
//!
//! The backend holds one authoritative [`GameState`]; clients hold a mirror.
//! State never crosses the wire whole during normal play; peers exchange
//! [`StateUpdate`]s, sparse deltas tagged with a monotone `time_order`
//! sequence number.
//!
//! # Laws
//!
//! - Composition: for updates with increasing time orders,
//!   `u1.merged(u2)` takes each key from `u2` when present, else `u1`;
//!   nested maps merge recursively; [`Value::Delete`] propagates; the
//!   result carries the newer `time_order`. Composition is associative.
//! - Application: `state.apply(&u)` is a no-op unless `u` is newer; when it
//!   applies, keys are overwritten (deletes remove them, nested maps merge)
//!   and `state.time_order` becomes `u.time_order`. Applying a composed
//!   update equals applying its parts in order.

use std::collections::BTreeMap;

use ciborium::value::Value as CborValue;

use crate::{
    errors::{ProtocolError, Result},
    seq::Seq,
    value::Value,
};

/// Attribute-change map used by updates and simulation patches.
pub type StateChanges = BTreeMap<String, Value>;

/// Reserved attribute key carrying the time order.
const KEY_TIME_ORDER: &str = "time_order";

/// Reserved attribute key carrying the game status.
const KEY_GAME_STATUS: &str = "game_status";

/// Lifecycle status of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    /// The simulation loop is not running.
    Paused,
    /// The simulation loop is running.
    Active,
}

impl GameStatus {
    /// Wire representation.
    #[must_use]
    pub const fn as_int(self) -> i64 {
        match self {
            GameStatus::Paused => 0,
            GameStatus::Active => 1,
        }
    }

    /// Decode the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidGameStatus`] for unknown values.
    pub fn from_int(value: i64) -> Result<Self> {
        match value {
            0 => Ok(GameStatus::Paused),
            1 => Ok(GameStatus::Active),
            other => Err(ProtocolError::InvalidGameStatus(other)),
        }
    }
}

/// A snapshot of the replicated game state.
///
/// Two attributes are mandatory and typed (`time_order`, `game_status`);
/// everything else lives in an open attribute map of [`Value`]s. The
/// reserved keys cannot be set through [`GameState::set`].
#[derive(Debug, Clone, PartialEq)]
pub struct GameState {
    /// Time order of the last update applied to this state.
    pub time_order: Seq,
    /// Whether the simulation producing this state is running.
    pub game_status: GameStatus,
    attrs: StateChanges,
}

impl Default for GameState {
    fn default() -> Self {
        GameState::new()
    }
}

impl GameState {
    /// A paused, empty state at time order zero.
    #[must_use]
    pub fn new() -> Self {
        GameState {
            time_order: Seq::NEVER,
            game_status: GameStatus::Paused,
            attrs: BTreeMap::new(),
        }
    }

    /// Whether the simulation is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.game_status == GameStatus::Paused
    }

    /// Read a user attribute.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Set a user attribute. Reserved keys are ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key == KEY_TIME_ORDER || key == KEY_GAME_STATUS {
            return;
        }
        self.attrs.insert(key, value.into());
    }

    /// Iterate over the user attributes.
    pub fn attrs(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.attrs.iter()
    }

    /// Apply an update, respecting delete markers and nested maps.
    ///
    /// No-op unless the update is newer than this state; afterwards
    /// `self.time_order == update.time_order`.
    pub fn apply(&mut self, update: &StateUpdate) {
        if !update.time_order.newer_than(self.time_order) {
            return;
        }
        for (key, value) in &update.changes {
            if key == KEY_GAME_STATUS {
                if let Some(status) = value.as_int().and_then(|n| GameStatus::from_int(n).ok()) {
                    self.game_status = status;
                }
                continue;
            }
            apply_change(&mut self.attrs, key, value);
        }
        self.time_order = update.time_order;
    }

    /// A full-state update equivalent to this snapshot, used to
    /// resynchronize clients that fell outside the update cache window.
    #[must_use]
    pub fn as_full_update(&self) -> StateUpdate {
        let mut changes = self.attrs.clone();
        changes.insert(KEY_GAME_STATUS.into(), Value::Int(self.game_status.as_int()));
        StateUpdate { time_order: self.time_order, changes }
    }

    /// Convert into the CBOR data model (a flat map; the mandatory fields
    /// occupy reserved keys alongside the user attributes).
    #[must_use]
    pub fn to_cbor(&self) -> CborValue {
        let mut entries = vec![
            (
                CborValue::Text(KEY_TIME_ORDER.into()),
                Value::Seq(self.time_order).to_cbor(),
            ),
            (
                CborValue::Text(KEY_GAME_STATUS.into()),
                CborValue::Integer(self.game_status.as_int().into()),
            ),
        ];
        for (key, value) in &self.attrs {
            entries.push((CborValue::Text(key.clone()), value.to_cbor()));
        }
        CborValue::Map(entries)
    }

    /// Convert from the CBOR data model.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the mandatory fields are missing or
    /// malformed.
    pub fn from_cbor(cbor: CborValue) -> Result<Self> {
        let mut changes = decode_changes(cbor)?;
        let time_order = take_time_order(&mut changes)?;
        let game_status = match changes.remove(KEY_GAME_STATUS) {
            Some(Value::Int(n)) => GameStatus::from_int(n)?,
            Some(other) => {
                return Err(ProtocolError::Decode(format!(
                    "game_status must be an integer, got {other:?}"
                )))
            }
            None => return Err(ProtocolError::Decode("state is missing game_status".into())),
        };
        Ok(GameState { time_order, game_status, attrs: changes })
    }
}

/// A sparse, time-ordered delta between two game states.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    /// Position of this update in the time order.
    pub time_order: Seq,
    /// Changed attributes. May address `game_status`; [`Value::Delete`]
    /// marks keys for removal.
    pub changes: StateChanges,
}

impl StateUpdate {
    /// An empty update at the given time order.
    #[must_use]
    pub fn new(time_order: Seq) -> Self {
        StateUpdate { time_order, changes: BTreeMap::new() }
    }

    /// An update carrying the given changes.
    #[must_use]
    pub fn with_changes(time_order: Seq, changes: StateChanges) -> Self {
        StateUpdate { time_order, changes }
    }

    /// Compose with another update; the newer side wins per key.
    ///
    /// The result is equally or more current than either input and carries
    /// the union of their changes.
    #[must_use]
    pub fn merged(self, other: StateUpdate) -> StateUpdate {
        let (mut base, newer) = if other.time_order.newer_than(self.time_order) {
            (self, other)
        } else {
            (other, self)
        };
        merge_changes(&mut base.changes, newer.changes);
        base.time_order = newer.time_order;
        StateUpdate { time_order: base.time_order, changes: base.changes }
    }

    /// Convert into the CBOR data model (flat: changes plus the reserved
    /// `time_order` key).
    #[must_use]
    pub fn to_cbor(&self) -> CborValue {
        let mut entries = vec![(
            CborValue::Text(KEY_TIME_ORDER.into()),
            Value::Seq(self.time_order).to_cbor(),
        )];
        for (key, value) in &self.changes {
            entries.push((CborValue::Text(key.clone()), value.to_cbor()));
        }
        CborValue::Map(entries)
    }

    /// Convert from the CBOR data model.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the item is not an update map.
    pub fn from_cbor(cbor: CborValue) -> Result<Self> {
        let mut changes = decode_changes(cbor)?;
        let time_order = take_time_order(&mut changes)?;
        Ok(StateUpdate { time_order, changes })
    }

    /// Size of this update when encoded standalone, in bytes. Used by the
    /// server's package assembler to budget the rest of the datagram.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encoded_len(&self) -> Result<usize> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.to_cbor(), &mut buf)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf.len())
    }
}

fn decode_changes(cbor: CborValue) -> Result<StateChanges> {
    match Value::from_cbor(cbor)? {
        Value::Map(entries) => Ok(entries),
        other => Err(ProtocolError::Decode(format!(
            "expected a state map, got {other:?}"
        ))),
    }
}

fn take_time_order(changes: &mut StateChanges) -> Result<Seq> {
    match changes.remove(KEY_TIME_ORDER) {
        Some(Value::Seq(seq)) => Ok(seq),
        Some(other) => Err(ProtocolError::Decode(format!(
            "time_order must be a sequence number, got {other:?}"
        ))),
        None => Err(ProtocolError::Decode("missing time_order".into())),
    }
}

/// Merge one change set over another: the newer side wins per key, nested
/// maps merge recursively, and delete markers are kept for a later
/// application to a state.
pub fn merge_changes(base: &mut StateChanges, newer: StateChanges) {
    for (key, value) in newer {
        match (base.get_mut(&key), value) {
            (Some(Value::Map(existing)), Value::Map(incoming)) => {
                merge_changes(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

// Update-over-state application: deletes remove keys, nested maps merge,
// everything else overwrites.
fn apply_change(target: &mut StateChanges, key: &str, value: &Value) {
    match value {
        Value::Delete => {
            target.remove(key);
        }
        Value::Map(incoming) => match target.get_mut(key) {
            Some(Value::Map(existing)) => {
                for (k, v) in incoming {
                    apply_change(existing, k, v);
                }
            }
            _ => {
                let mut fresh = BTreeMap::new();
                for (k, v) in incoming {
                    apply_change(&mut fresh, k, v);
                }
                target.insert(key.to_owned(), Value::Map(fresh));
            }
        },
        other => {
            target.insert(key.to_owned(), other.clone());
        }
    }
}
