//! Cyclically wrapping sequence numbers.
//!
//! Every package carries a [`Seq`] identifying it within one direction of a
//! connection. The value `0` is reserved as "never" (no package has been
//! sent or received yet); live values occupy the ring `1..=65535`, and
//! incrementing past the maximum wraps back to `1`, never to `0`.
//!
//! # Ordering
//!
//! Two live sequence numbers are compared by cyclic distance: `a` is newer
//! than `b` iff `(a - b) mod MAX` lies in `(0, MAX/2]`. This keeps ordering
//! correct across wrap-around, as long as the two numbers are less than half
//! the ring apart. There is intentionally no `Ord` implementation; cyclic
//! ordering is not transitive over the whole ring.

use crate::errors::{ProtocolError, Result};

/// A wrapping 16-bit sequence number.
///
/// `Seq(0)` means "never"; the live ring is `1..=Seq::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(u16);

impl Seq {
    /// The reserved "nothing sent/received yet" value.
    pub const NEVER: Seq = Seq(0);

    /// Largest live sequence number; incrementing it wraps to `1`.
    pub const MAX: u16 = u16::MAX;

    /// Encoded width in bytes. This is a protocol constant, not a runtime
    /// setting: changing it is a wire-format break.
    pub const WIDTH: usize = 2;

    /// Wrap a raw value. All `u16` values are valid (`0` means "never").
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Seq(value)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Whether this is the reserved "never" value.
    #[must_use]
    pub const fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Modular addition on the live ring.
    ///
    /// For any live `s`: `s.plus(Seq::MAX) == s` and `s.plus(0) == s`.
    /// Adding to `Seq::NEVER` enters the ring (`NEVER.plus(1) == Seq(1)`).
    #[must_use]
    pub fn plus(self, n: u16) -> Seq {
        let max = u32::from(Self::MAX);
        let mut v = u32::from(self.0) + u32::from(n);
        if v > max {
            v -= max;
        }
        // v <= u16::MAX by construction
        #[allow(clippy::cast_possible_truncation)]
        let wrapped = v as u16;
        Seq(wrapped)
    }

    /// The next sequence number, honoring wrap-around (`MAX` -> `1`).
    #[must_use]
    pub fn incremented(self) -> Seq {
        self.plus(1)
    }

    /// Signed cyclic distance `self - other`, normalized into
    /// `(-MAX/2, MAX/2]`.
    ///
    /// Positive means `self` is newer than `other`.
    #[must_use]
    pub fn dist(self, other: Seq) -> i32 {
        let max = i32::from(Self::MAX);
        let threshold = (max - 1) / 2;
        let mut d = i32::from(self.0) - i32::from(other.0);
        if d > threshold {
            d -= max;
        } else if d < -threshold {
            d += max;
        }
        d
    }

    /// Cyclic-distance ordering between two live sequence numbers.
    #[must_use]
    pub fn newer_than(self, other: Seq) -> bool {
        self.dist(other) > 0
    }

    /// Big-endian wire encoding, exactly [`Seq::WIDTH`] bytes.
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; Self::WIDTH] {
        self.0.to_be_bytes()
    }

    /// Decode from exactly [`Seq::WIDTH`] big-endian bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] if `bytes` has the wrong length.
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; Self::WIDTH] = bytes
            .try_into()
            .map_err(|_| ProtocolError::Decode(format!(
                "sequence number must be {} bytes, got {}",
                Self::WIDTH,
                bytes.len()
            )))?;
        Ok(Seq(u16::from_be_bytes(arr)))
    }
}

impl From<u16> for Seq {
    fn from(value: u16) -> Self {
        Seq(value)
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn zero_is_never() {
        assert!(Seq::NEVER.is_never());
        assert!(!Seq::new(1).is_never());
        assert_eq!(Seq::default(), Seq::NEVER);
    }

    #[test]
    fn increment_wraps_to_one() {
        assert_eq!(Seq::new(Seq::MAX).incremented(), Seq::new(1));
        assert_eq!(Seq::new(1).incremented(), Seq::new(2));
        assert_eq!(Seq::NEVER.incremented(), Seq::new(1));
    }

    #[test]
    fn dist_across_wrap() {
        assert_eq!(Seq::new(1).dist(Seq::new(Seq::MAX)), 1);
        assert_eq!(Seq::new(Seq::MAX).dist(Seq::new(1)), -1);
        assert_eq!(Seq::new(5).dist(Seq::new(2)), 3);
        assert_eq!(Seq::new(2).dist(Seq::new(5)), -3);
    }

    #[test]
    fn newer_than_across_wrap() {
        assert!(Seq::new(1).newer_than(Seq::new(Seq::MAX)));
        assert!(!Seq::new(Seq::MAX).newer_than(Seq::new(1)));
        assert!(Seq::new(300).newer_than(Seq::new(299)));
    }

    proptest! {
        #[test]
        fn byte_round_trip(raw in 0u16..=u16::MAX) {
            let seq = Seq::new(raw);
            let decoded = Seq::from_be_bytes(&seq.to_be_bytes()).expect("should decode");
            prop_assert_eq!(seq, decoded);
        }

        #[test]
        fn plus_identity_laws(raw in 1u16..=u16::MAX) {
            let seq = Seq::new(raw);
            prop_assert_eq!(seq.plus(0), seq);
            prop_assert_eq!(seq.plus(Seq::MAX), seq);
        }

        #[test]
        fn increment_is_newer(raw in 1u16..=u16::MAX) {
            let seq = Seq::new(raw);
            prop_assert!(seq.incremented().newer_than(seq));
            prop_assert!(!seq.newer_than(seq));
        }
    }

    #[test]
    fn reject_wrong_width() {
        assert!(Seq::from_be_bytes(&[1]).is_err());
        assert!(Seq::from_be_bytes(&[1, 2, 3]).is_err());
    }
}
