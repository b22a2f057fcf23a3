//! Named, data-carrying messages exchanged between peers.
//!
//! Events are the application-level message unit: a type string plus
//! positional and keyword data, dispatched to a registered handler on the
//! receiving side. Events have no identity of their own on the wire; for
//! acknowledgement purposes they are tracked by the sequence number of the
//! package that carries them.

use std::collections::BTreeMap;

use ciborium::value::Value as CborValue;

use crate::{
    errors::{ProtocolError, Result},
    value::Value,
};

/// Reserved event type requesting server shutdown. Only honored when
/// dispatched by the host client.
pub const SHUTDOWN_EVENT: &str = "__shutdown__";

/// Prefix of reserved event type names.
pub const RESERVED_PREFIX: &str = "__";

/// A named event with attached data.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Identifies the event and links it to a handler on the receiving side.
    pub event_type: String,
    /// Positional handler arguments.
    pub args: Vec<Value>,
    /// Keyword handler arguments.
    pub kwargs: BTreeMap<String, Value>,
}

impl Event {
    /// Create an event with no attached data.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Event {
            event_type: event_type.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Insert a keyword argument.
    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Whether the event type name is reserved for protocol use.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.event_type.starts_with(RESERVED_PREFIX)
    }

    /// Convert into the CBOR data model.
    #[must_use]
    pub fn to_cbor(&self) -> CborValue {
        CborValue::Map(vec![
            (
                CborValue::Text("type".into()),
                CborValue::Text(self.event_type.clone()),
            ),
            (
                CborValue::Text("args".into()),
                Value::Array(self.args.clone()).to_cbor(),
            ),
            (
                CborValue::Text("kwargs".into()),
                Value::Map(self.kwargs.clone()).to_cbor(),
            ),
        ])
    }

    /// Convert from the CBOR data model.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] if the item is not an event map.
    pub fn from_cbor(cbor: CborValue) -> Result<Self> {
        let CborValue::Map(entries) = cbor else {
            return Err(ProtocolError::Decode("event must be a map".into()));
        };
        let mut event_type = None;
        let mut args = Vec::new();
        let mut kwargs = BTreeMap::new();
        for (key, value) in entries {
            let CborValue::Text(key) = key else {
                return Err(ProtocolError::Decode("event keys must be strings".into()));
            };
            match key.as_str() {
                "type" => match value {
                    CborValue::Text(t) => event_type = Some(t),
                    other => {
                        return Err(ProtocolError::Decode(format!(
                            "event type must be a string, got {other:?}"
                        )))
                    }
                },
                "args" => match Value::from_cbor(value)? {
                    Value::Array(items) => args = items,
                    other => {
                        return Err(ProtocolError::Decode(format!(
                            "event args must be an array, got {other:?}"
                        )))
                    }
                },
                "kwargs" => match Value::from_cbor(value)? {
                    Value::Map(entries) => kwargs = entries,
                    other => {
                        return Err(ProtocolError::Decode(format!(
                            "event kwargs must be a map, got {other:?}"
                        )))
                    }
                },
                unknown => {
                    return Err(ProtocolError::Decode(format!(
                        "unknown event field {unknown:?}"
                    )))
                }
            }
        }
        let event_type = event_type
            .ok_or_else(|| ProtocolError::Decode("event is missing its type".into()))?;
        Ok(Event { event_type, args, kwargs })
    }

    /// Size of this event when encoded standalone, in bytes.
    ///
    /// Used by the package assembler to decide how many queued events fit
    /// the datagram budget.
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
