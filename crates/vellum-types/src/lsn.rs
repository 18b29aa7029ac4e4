//! Log sequence numbers.

use std::fmt;

/// Number of low bits holding the per-namespace counter.
const COUNTER_BITS: u32 = 53;
const COUNTER_MASK: i64 = (1 << COUNTER_BITS) - 1;

/// Highest server id that fits in the upper bits.
pub const MAX_SERVER_ID: i16 = 1023;

/// A WAL position: `(counter, server_id)` packed into 64 bits, counter in
/// the low 53 bits, server id above it. Counters are strictly monotonic
/// per namespace; the server id tags the origin of the mutation.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(i64);

impl Lsn {
    /// Sentinel for "no LSN": an item never written, an empty upstream.
    pub const EMPTY: Self = Self(-1);

    #[must_use]
    pub fn new(counter: i64, server_id: i16) -> Self {
        debug_assert!(counter >= 0 && counter <= COUNTER_MASK);
        debug_assert!((0..=MAX_SERVER_ID).contains(&server_id));
        Self((i64::from(server_id) << COUNTER_BITS) | (counter & COUNTER_MASK))
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 < 0
    }

    /// The monotonic counter part.
    #[must_use]
    pub fn counter(self) -> i64 {
        if self.is_empty() {
            -1
        } else {
            self.0 & COUNTER_MASK
        }
    }

    /// The originating server id.
    #[must_use]
    pub fn server_id(self) -> i16 {
        if self.is_empty() {
            0
        } else {
            (self.0 >> COUNTER_BITS) as i16
        }
    }

    /// Raw packed representation (for storage records).
    #[must_use]
    pub const fn into_raw(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Lsn(empty)")
        } else {
            write!(f, "Lsn({}:{})", self.server_id(), self.counter())
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id(), self.counter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack() {
        let lsn = Lsn::new(123_456_789, 77);
        assert_eq!(lsn.counter(), 123_456_789);
        assert_eq!(lsn.server_id(), 77);
    }

    #[test]
    fn server_id_lives_in_high_bits() {
        let a = Lsn::new(5, 0);
        let b = Lsn::new(5, 1);
        assert!(b.into_raw() > a.into_raw());
        assert_eq!(b.into_raw() - a.into_raw(), 1i64 << 53);
    }

    #[test]
    fn empty_sentinel() {
        assert!(Lsn::EMPTY.is_empty());
        assert_eq!(Lsn::EMPTY.counter(), -1);
        assert!(!Lsn::new(0, 0).is_empty());
    }

    #[test]
    fn ordering_by_counter_within_server() {
        assert!(Lsn::new(10, 3) < Lsn::new(11, 3));
    }
}
