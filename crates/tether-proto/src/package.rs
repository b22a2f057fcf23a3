//! Datagram encoding: header plus a CBOR body.
//!
//! A datagram is `Header(12) || body`, capped at [`MAX_DATAGRAM_SIZE`]
//! bytes. The body is a CBOR map whose shape depends on who sent it; the
//! codec does not tag the variant, each side simply decodes the shape it
//! expects from its peer:
//!
//! - [`Package`] (plain): `{events}`, the minimal form.
//! - [`ClientPackage`]: `{time_order, events}`, carrying the time order of
//!   the client's last applied update.
//! - [`ServerPackage`]: `{update, events}`, carrying the delta catching the
//!   client up.
//!
//! Encoding a package that would exceed the size cap is an error surfaced
//! to the caller; nothing is sent and the connection is unaffected.

use bytes::Bytes;
use ciborium::value::Value as CborValue;

use crate::{
    errors::{ProtocolError, Result},
    event::Event,
    header::Header,
    seq::Seq,
    state::StateUpdate,
    value::Value,
};

/// Maximum size of an encoded datagram in bytes.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// The minimal package: header and events only.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    /// Fixed wire header.
    pub header: Header,
    /// Events attached to this package, in dispatch order.
    pub events: Vec<Event>,
}

/// Client-to-server package; additionally reports the mirror's time order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPackage {
    /// Fixed wire header.
    pub header: Header,
    /// Time order of the last update the client has applied.
    pub time_order: Seq,
    /// Events attached to this package, in dispatch order.
    pub events: Vec<Event>,
}

/// Server-to-client package; additionally carries a state delta.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerPackage {
    /// Fixed wire header.
    pub header: Header,
    /// Delta that takes the client from its reported time order to the
    /// current authoritative state.
    pub update: StateUpdate,
    /// Events attached to this package, in dispatch order.
    pub events: Vec<Event>,
}

fn events_to_cbor(events: &[Event]) -> CborValue {
    CborValue::Array(events.iter().map(Event::to_cbor).collect())
}

fn events_from_cbor(cbor: CborValue) -> Result<Vec<Event>> {
    let CborValue::Array(items) = cbor else {
        return Err(ProtocolError::Decode("events must be an array".into()));
    };
    items.into_iter().map(Event::from_cbor).collect()
}

fn encode_datagram(header: &Header, body: &CborValue) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(Header::SIZE + 64);
    buf.extend_from_slice(&header.encode());
    ciborium::ser::into_writer(body, &mut buf)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::SizeOverflow {
            size: buf.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    Ok(Bytes::from(buf))
}

fn decode_body(datagram: &[u8]) -> Result<Vec<(CborValue, CborValue)>> {
    let body = &datagram[Header::SIZE..];
    let cbor: CborValue = ciborium::de::from_reader(body)
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let CborValue::Map(entries) = cbor else {
        return Err(ProtocolError::Decode("package body must be a map".into()));
    };
    Ok(entries)
}

fn field_name(key: CborValue) -> Result<String> {
    match key {
        CborValue::Text(name) => Ok(name),
        other => Err(ProtocolError::Decode(format!(
            "body keys must be strings, got {other:?}"
        ))),
    }
}

impl Package {
    /// Encode into a datagram.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SizeOverflow`] if the result would exceed
    /// [`MAX_DATAGRAM_SIZE`]; [`ProtocolError::Encode`] on serializer
    /// failure.
    pub fn to_datagram(&self) -> Result<Bytes> {
        let body = CborValue::Map(vec![(
            CborValue::Text("events".into()),
            events_to_cbor(&self.events),
        )]);
        encode_datagram(&self.header, &body)
    }

    /// Decode a plain package from a datagram.
    ///
    /// # Errors
    ///
    /// Propagates header errors ([`ProtocolError::ProtocolMismatch`],
    /// [`ProtocolError::HeaderTooShort`]) and body decode errors.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self> {
        let header = Header::decode(datagram)?;
        let mut events = Vec::new();
        for (key, value) in decode_body(datagram)? {
            match field_name(key)?.as_str() {
                "events" => events = events_from_cbor(value)?,
                unknown => {
                    return Err(ProtocolError::Decode(format!(
                        "unknown package field {unknown:?}"
                    )))
                }
            }
        }
        Ok(Package { header, events })
    }
}

impl ClientPackage {
    /// Encode into a datagram.
    ///
    /// # Errors
    ///
    /// Same as [`Package::to_datagram`].
    pub fn to_datagram(&self) -> Result<Bytes> {
        let body = CborValue::Map(vec![
            (
                CborValue::Text("time_order".into()),
                Value::Seq(self.time_order).to_cbor(),
            ),
            (
                CborValue::Text("events".into()),
                events_to_cbor(&self.events),
            ),
        ]);
        encode_datagram(&self.header, &body)
    }

    /// Decode a client-shaped package from a datagram.
    ///
    /// # Errors
    ///
    /// Same as [`Package::from_datagram`], plus a decode error if the
    /// `time_order` field is missing or malformed.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self> {
        let header = Header::decode(datagram)?;
        let mut time_order = None;
        let mut events = Vec::new();
        for (key, value) in decode_body(datagram)? {
            match field_name(key)?.as_str() {
                "time_order" => match Value::from_cbor(value)? {
                    Value::Seq(seq) => time_order = Some(seq),
                    other => {
                        return Err(ProtocolError::Decode(format!(
                            "time_order must be a sequence number, got {other:?}"
                        )))
                    }
                },
                "events" => events = events_from_cbor(value)?,
                unknown => {
                    return Err(ProtocolError::Decode(format!(
                        "unknown package field {unknown:?}"
                    )))
                }
            }
        }
        let time_order = time_order
            .ok_or_else(|| ProtocolError::Decode("client package missing time_order".into()))?;
        Ok(ClientPackage { header, time_order, events })
    }
}

impl ServerPackage {
    /// Encode into a datagram.
    ///
    /// # Errors
    ///
    /// Same as [`Package::to_datagram`].
    pub fn to_datagram(&self) -> Result<Bytes> {
        let body = CborValue::Map(vec![
            (CborValue::Text("update".into()), self.update.to_cbor()),
            (
                CborValue::Text("events".into()),
                events_to_cbor(&self.events),
            ),
        ]);
        encode_datagram(&self.header, &body)
    }

    /// Decode a server-shaped package from a datagram.
    ///
    /// # Errors
    ///
    /// Same as [`Package::from_datagram`], plus a decode error if the
    /// `update` field is missing or malformed.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self> {
        let header = Header::decode(datagram)?;
        let mut update = None;
        let mut events = Vec::new();
        for (key, value) in decode_body(datagram)? {
            match field_name(key)?.as_str() {
                "update" => update = Some(StateUpdate::from_cbor(value)?),
                "events" => events = events_from_cbor(value)?,
                unknown => {
                    return Err(ProtocolError::Decode(format!(
                        "unknown package field {unknown:?}"
                    )))
                }
            }
        }
        let update = update
            .ok_or_else(|| ProtocolError::Decode("server package missing update".into()))?;
        Ok(ServerPackage { header, update, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::AckBitfield;

    fn header() -> Header {
        Header {
            sequence: Seq::new(10),
            ack: Seq::new(7),
            ack_bitfield: AckBitfield::EMPTY.with(0).with(2),
        }
    }

    #[test]
    fn plain_round_trip() {
        let package = Package {
            header: header(),
            events: vec![Event::new("PING"), Event::new("PONG").with_arg(1i64)],
        };
        let datagram = package.to_datagram().expect("should encode");
        let decoded = Package::from_datagram(&datagram).expect("should decode");
        assert_eq!(package, decoded);
    }

    #[test]
    fn client_round_trip() {
        let package = ClientPackage {
            header: header(),
            time_order: Seq::new(55),
            events: vec![Event::new("MOVE").with_kwarg("dx", 0.5f64)],
        };
        let datagram = package.to_datagram().expect("should encode");
        let decoded = ClientPackage::from_datagram(&datagram).expect("should decode");
        assert_eq!(package, decoded);
    }

    #[test]
    fn server_round_trip() {
        let mut update = StateUpdate::new(Seq::new(56));
        update.changes.insert("hp".into(), Value::Int(90));
        update.changes.insert("dead_key".into(), Value::Delete);

        let package = ServerPackage {
            header: header(),
            update,
            events: vec![],
        };
        let datagram = package.to_datagram().expect("should encode");
        let decoded = ServerPackage::from_datagram(&datagram).expect("should decode");
        assert_eq!(package, decoded);
    }

    #[test]
    fn empty_events_round_trip() {
        let package = Package { header: header(), events: vec![] };
        let decoded = Package::from_datagram(&package.to_datagram().unwrap()).unwrap();
        assert!(decoded.events.is_empty());
    }

    #[test]
    fn oversize_package_is_an_encode_error() {
        let package = Package {
            header: header(),
            events: vec![Event::new("BLOB")
                .with_kwarg("data", Value::Bytes(vec![0u8; MAX_DATAGRAM_SIZE]))],
        };
        assert!(matches!(
            package.to_datagram(),
            Err(ProtocolError::SizeOverflow { .. })
        ));
    }

    #[test]
    fn foreign_datagram_is_a_protocol_mismatch() {
        let garbage = b"not a tether datagram at all";
        assert_eq!(
            Package::from_datagram(garbage),
            Err(ProtocolError::ProtocolMismatch)
        );
    }

    #[test]
    fn truncated_body_is_a_decode_error() {
        let package = ClientPackage {
            header: header(),
            time_order: Seq::new(3),
            events: vec![Event::new("X")],
        };
        let datagram = package.to_datagram().unwrap();
        let truncated = &datagram[..datagram.len() - 2];
        assert!(matches!(
            ClientPackage::from_datagram(truncated),
            Err(ProtocolError::Decode(_))
        ));
    }
}
