//! Fixed wire header and acknowledgement bitfield.
//!
//! Every datagram starts with 12 bytes, big endian throughout:
//!
//! ```text
//! offset 0: 4 bytes  magic (0xFFD0FAB9)
//! offset 4: 2 bytes  sequence
//! offset 6: 2 bytes  ack            (newest sequence seen from the peer)
//! offset 8: 4 bytes  ack bitfield   (the 32 sequences preceding ack)
//! ```
//!
//! The bitfield is indexed newest-first: bit 0 (the most significant bit of
//! the encoded word) acknowledges `ack - 1`, bit 1 acknowledges `ack - 2`,
//! and so on. Receivers drop any datagram whose magic does not match.

use crate::{
    errors::{ProtocolError, Result},
    seq::Seq,
};

/// Unique 4-byte identifier of tether datagrams.
pub const MAGIC: [u8; 4] = [0xFF, 0xD0, 0xFA, 0xB9];

/// Acknowledgement status of the 32 sequence numbers preceding `ack`.
///
/// Index `i` refers to sequence `ack - (i + 1)`; index 0 is the packet
/// immediately before `ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckBitfield(u32);

impl AckBitfield {
    /// Number of sequences the bitfield covers.
    pub const LEN: u16 = 32;

    /// All bits clear.
    pub const EMPTY: AckBitfield = AckBitfield(0);

    /// Wrap a raw bitfield word.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        AckBitfield(bits)
    }

    /// The raw bitfield word.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether the bit at `index` is set. Out-of-range indices read as
    /// unset.
    #[must_use]
    pub const fn is_set(self, index: u16) -> bool {
        index < Self::LEN && self.0 & (1 << (31 - index)) != 0
    }

    /// A copy with the bit at `index` set. Out-of-range indices are
    /// ignored.
    #[must_use]
    pub const fn with(self, index: u16) -> Self {
        if index < Self::LEN {
            AckBitfield(self.0 | 1 << (31 - index))
        } else {
            self
        }
    }

    /// Slide the window forward by `gap` sequences, inserting a set bit for
    /// the previous newest sequence.
    ///
    /// Called when a package `gap` ahead of the current `remote_seq`
    /// arrives: old bit `i` moves to `i + gap`, bits that fall off the far
    /// end are forgotten, and bit `gap - 1` (the old `remote_seq` itself)
    /// is set.
    #[must_use]
    pub const fn advanced(self, gap: u16) -> Self {
        if gap == 0 {
            return self;
        }
        let shifted = if gap >= Self::LEN { 0 } else { self.0 >> gap };
        AckBitfield(shifted).with(gap - 1)
    }
}

/// The decoded fixed header of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of this package on the sender's side.
    pub sequence: Seq,
    /// Newest sequence number the sender has received from us.
    pub ack: Seq,
    /// Receipt status of the 32 sequences preceding `ack`.
    pub ack_bitfield: AckBitfield,
}

impl Header {
    /// Encoded size, including the magic.
    pub const SIZE: usize = 12;

    /// Encode to the 12-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4..6].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.ack.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_bitfield.bits().to_be_bytes());
        bytes
    }

    /// Decode from the front of a datagram.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::HeaderTooShort`] if fewer than 12 bytes are given.
    /// - [`ProtocolError::ProtocolMismatch`] if the magic does not match;
    ///   such datagrams are not tether traffic and must be dropped without
    ///   touching connection state.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(ProtocolError::ProtocolMismatch);
        }
        let sequence = Seq::from_be_bytes(&bytes[4..6])?;
        let ack = Seq::from_be_bytes(&bytes[6..8])?;
        let bits = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        Ok(Header {
            sequence,
            ack,
            ack_bitfield: AckBitfield::from_bits(bits),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encoded_size_is_twelve_bytes() {
        let header = Header {
            sequence: Seq::new(1),
            ack: Seq::NEVER,
            ack_bitfield: AckBitfield::EMPTY,
        };
        assert_eq!(header.encode().len(), Header::SIZE);
    }

    proptest! {
        #[test]
        fn header_round_trip(sequence in 0u16..=u16::MAX, ack in 0u16..=u16::MAX, bits in any::<u32>()) {
            let header = Header {
                sequence: Seq::new(sequence),
                ack: Seq::new(ack),
                ack_bitfield: AckBitfield::from_bits(bits),
            };
            let decoded = Header::decode(&header.encode()).expect("should decode");
            prop_assert_eq!(header, decoded);
        }
    }

    #[test]
    fn reject_short_buffer() {
        let result = Header::decode(&[0xFF, 0xD0, 0xFA]);
        assert_eq!(
            result,
            Err(ProtocolError::HeaderTooShort { expected: 12, actual: 3 })
        );
    }

    #[test]
    fn reject_foreign_magic() {
        let mut bytes = [0u8; Header::SIZE];
        bytes[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(Header::decode(&bytes), Err(ProtocolError::ProtocolMismatch));
    }

    #[test]
    fn bitfield_indexing_is_newest_first() {
        let bf = AckBitfield::EMPTY.with(0);
        assert_eq!(bf.bits(), 0x8000_0000);
        assert!(bf.is_set(0));
        assert!(!bf.is_set(1));

        let bf = bf.with(31);
        assert!(bf.is_set(31));
        assert!(!bf.is_set(32));
    }

    #[test]
    fn advance_by_one_remembers_previous_newest() {
        let bf = AckBitfield::EMPTY.with(0).advanced(1);
        // Old bit 0 slides to bit 1; bit 0 now marks the previous newest.
        assert!(bf.is_set(0));
        assert!(bf.is_set(1));
        assert!(!bf.is_set(2));
    }

    #[test]
    fn advance_by_gap_leaves_holes() {
        let bf = AckBitfield::EMPTY.advanced(3);
        assert!(!bf.is_set(0));
        assert!(!bf.is_set(1));
        assert!(bf.is_set(2));
    }

    #[test]
    fn advance_past_window_forgets_everything() {
        let bf = AckBitfield::from_bits(u32::MAX).advanced(33);
        assert_eq!(bf, AckBitfield::EMPTY);

        let bf = AckBitfield::from_bits(u32::MAX).advanced(32);
        // Only the previous newest survives, at the last index.
        assert_eq!(bf, AckBitfield::EMPTY.with(31));
    }
}
