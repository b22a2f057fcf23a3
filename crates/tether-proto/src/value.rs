//! The serializable value model for state attributes and event data.
//!
//! Game state attributes and event arguments are schemaless: the wire model
//! is a small set of primitives plus nested arrays and string-keyed maps,
//! encoded as CBOR. Anything a user attaches to an event or a state must be
//! expressible as a [`Value`].
//!
//! # Encoding
//!
//! Values map onto plain CBOR items one-to-one, with two custom tags:
//!
//! - [`TAG_SEQ`] wraps a 2-byte string so sequence numbers round-trip
//!   width-exact instead of collapsing into ordinary integers.
//! - [`TAG_DELETE`] wraps null and marks a state key for removal when a
//!   [`StateUpdate`](crate::StateUpdate) is applied.
//!
//! Maps are string-keyed only; a non-text key is a decode error.

use std::collections::BTreeMap;

use ciborium::value::{Integer, Value as CborValue};

use crate::{
    errors::{ProtocolError, Result},
    seq::Seq,
};

/// CBOR tag wrapping a width-exact sequence number.
pub const TAG_SEQ: u64 = 0xD0FA;

/// CBOR tag marking a state key for deletion.
pub const TAG_DELETE: u64 = 0xD0FB;

/// A value from the serializable primitive set.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Width-exact sequence number.
    Seq(Seq),
    /// Ordered array of values.
    Array(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
    /// Reserved sentinel: remove this key when the update is applied.
    Delete,
}

impl Value {
    /// Convert into the CBOR data model.
    #[must_use]
    pub fn to_cbor(&self) -> CborValue {
        match self {
            Value::Nil => CborValue::Null,
            Value::Bool(b) => CborValue::Bool(*b),
            Value::Int(n) => CborValue::Integer(Integer::from(*n)),
            Value::Float(f) => CborValue::Float(*f),
            Value::Str(s) => CborValue::Text(s.clone()),
            Value::Bytes(b) => CborValue::Bytes(b.clone()),
            Value::Seq(s) => {
                CborValue::Tag(TAG_SEQ, Box::new(CborValue::Bytes(s.to_be_bytes().to_vec())))
            }
            Value::Array(items) => {
                CborValue::Array(items.iter().map(Value::to_cbor).collect())
            }
            Value::Map(entries) => CborValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (CborValue::Text(k.clone()), v.to_cbor()))
                    .collect(),
            ),
            Value::Delete => CborValue::Tag(TAG_DELETE, Box::new(CborValue::Null)),
        }
    }

    /// Convert from the CBOR data model.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for items outside the primitive set:
    /// unknown tags, non-text map keys, or out-of-range integers.
    pub fn from_cbor(cbor: CborValue) -> Result<Self> {
        match cbor {
            CborValue::Null => Ok(Value::Nil),
            CborValue::Bool(b) => Ok(Value::Bool(b)),
            CborValue::Integer(n) => {
                let n = i64::try_from(n)
                    .map_err(|_| ProtocolError::Decode("integer out of i64 range".into()))?;
                Ok(Value::Int(n))
            }
            CborValue::Float(f) => Ok(Value::Float(f)),
            CborValue::Text(s) => Ok(Value::Str(s)),
            CborValue::Bytes(b) => Ok(Value::Bytes(b)),
            CborValue::Tag(TAG_SEQ, inner) => match *inner {
                CborValue::Bytes(b) => Ok(Value::Seq(Seq::from_be_bytes(&b)?)),
                other => Err(ProtocolError::Decode(format!(
                    "sequence tag must wrap a byte string, got {other:?}"
                ))),
            },
            CborValue::Tag(TAG_DELETE, _) => Ok(Value::Delete),
            CborValue::Tag(tag, _) => {
                Err(ProtocolError::Decode(format!("unknown CBOR tag {tag}")))
            }
            CborValue::Array(items) => Ok(Value::Array(
                items.into_iter().map(Value::from_cbor).collect::<Result<_>>()?,
            )),
            CborValue::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let CborValue::Text(key) = key else {
                        return Err(ProtocolError::Decode(
                            "map keys must be strings".into(),
                        ));
                    };
                    map.insert(key, Value::from_cbor(value)?);
                }
                Ok(Value::Map(map))
            }
            other => Err(ProtocolError::Decode(format!(
                "unsupported CBOR item {other:?}"
            ))),
        }
    }

    /// Encode to a standalone CBOR byte string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.to_cbor(), &mut buf)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from a standalone CBOR byte string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let cbor: CborValue = ciborium::de::from_reader(bytes)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Value::from_cbor(cbor)
    }

    /// Whether this is the delete sentinel.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, Value::Delete)
    }

    /// The integer payload, if this is an [`Value::Int`].
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The float payload, if this is a [`Value::Float`].
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The string payload, if this is a [`Value::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The nested map, if this is a [`Value::Map`].
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Seq> for Value {
    fn from(v: Seq) -> Self {
        Value::Seq(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arbitrary_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Nil),
            Just(Value::Delete),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_filter("NaN breaks equality", |f| !f.is_nan())
                .prop_map(Value::Float),
            ".{0,12}".prop_map(Value::Str),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
            (0u16..=u16::MAX).prop_map(|n| Value::Seq(Seq::new(n))),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map(".{0,8}", inner, 0..4).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn value_round_trip(value in arbitrary_value()) {
            let bytes = value.encode().expect("should encode");
            let decoded = Value::decode(&bytes).expect("should decode");
            prop_assert_eq!(value, decoded);
        }
    }

    #[test]
    fn seq_width_preserved() {
        let value = Value::Seq(Seq::new(7));
        let decoded = Value::decode(&value.encode().unwrap()).unwrap();
        assert_eq!(decoded, Value::Seq(Seq::new(7)));
        // Not an ordinary integer on the wire.
        assert_ne!(decoded, Value::Int(7));
    }

    #[test]
    fn delete_sentinel_round_trip() {
        let decoded = Value::decode(&Value::Delete.encode().unwrap()).unwrap();
        assert!(decoded.is_delete());
    }

    #[test]
    fn reject_non_string_map_keys() {
        let cbor = CborValue::Map(vec![(
            CborValue::Integer(Integer::from(1)),
            CborValue::Null,
        )]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&cbor, &mut buf).unwrap();
        assert!(matches!(Value::decode(&buf), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn reject_unknown_tag() {
        let cbor = CborValue::Tag(0xBEEF, Box::new(CborValue::Null));
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&cbor, &mut buf).unwrap();
        assert!(matches!(Value::decode(&buf), Err(ProtocolError::Decode(_))));
    }
}
