//! Identifier newtypes.
//!
//! `TxnId` and `Lsn` are sequence numbers: zero is reserved as the
//! invalid sentinel and real values start at one. `TableId` and `RowKey`
//! name the resources that locks and version chains hang off.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a `u64` sequence newtype with a zero sentinel.
macro_rules! sequence_id {
    ($(#[$meta:meta])* $name:ident, first = $first:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Sentinel for "none".
            pub const INVALID: Self = Self(0);

            /// Smallest valid value.
            pub const $first: Self = Self(1);

            /// Wraps a raw value.
            #[inline]
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Returns the following value.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                Self(self.0.saturating_add(1))
            }

            /// Returns false for [`Self::INVALID`].
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                } else {
                    f.write_str(concat!(stringify!($name), "(INVALID)"))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

sequence_id! {
    /// Transaction identifier.
    ///
    /// Allocated in increasing order, so a larger id always belongs to a
    /// transaction that began later. Deadlock victim selection uses this to
    /// break ties between transactions with the same start time.
    ///
    /// ```rust
    /// use txcore_common::types::TxnId;
    ///
    /// assert!(TxnId::MIN.is_valid());
    /// assert!(TxnId::MIN < TxnId::MIN.next());
    /// ```
    TxnId, first = MIN
}

sequence_id! {
    /// Log sequence number.
    ///
    /// The WAL assigns one per record in strictly increasing order.
    /// Flushing up to an LSN makes every record at or below it durable.
    Lsn, first = FIRST
}

/// Table identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(u64);

impl TableId {
    /// Wraps a raw table id.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw table id.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A row: its table plus a row number within that table.
///
/// Row keys address version chains in the version store and row locks in
/// the lock manager. Ordering is by table first.
///
/// ```rust
/// use txcore_common::types::{RowKey, TableId};
///
/// let key = RowKey::new(TableId::new(1), 42);
/// assert_eq!(key.to_string(), "1:42");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    /// Owning table.
    pub table: TableId,
    /// Row number within the table.
    pub row: u64,
}

impl RowKey {
    /// Width of [`RowKey::to_le_bytes`].
    pub const ENCODED_SIZE: usize = 16;

    /// Creates a row key.
    #[inline]
    #[must_use]
    pub const fn new(table: TableId, row: u64) -> Self {
        Self { table, row }
    }

    /// Table id then row number, both little-endian.
    #[must_use]
    pub fn to_le_bytes(self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        let (table, row) = out.split_at_mut(8);
        table.copy_from_slice(&self.table.0.to_le_bytes());
        row.copy_from_slice(&self.row.to_le_bytes());
        out
    }

    /// Inverse of [`RowKey::to_le_bytes`].
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; Self::ENCODED_SIZE]) -> Self {
        let (table, row) = bytes.split_at(8);
        let word = |half: &[u8]| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(half);
            u64::from_le_bytes(raw)
        };
        Self::new(TableId(word(table)), word(row))
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({self})")
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table.0, self.row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_ids() {
        assert!(!TxnId::INVALID.is_valid());
        assert_eq!(TxnId::new(100).next(), TxnId::new(101));
        assert_eq!(format!("{:?}", TxnId::INVALID), "TxnId(INVALID)");
        assert_eq!(format!("{:?}", Lsn::new(7)), "Lsn(7)");
        assert_eq!(Lsn::FIRST.next(), Lsn::new(2));
        assert_eq!(Lsn::new(u64::MAX).next(), Lsn::new(u64::MAX));
    }

    #[test]
    fn test_serde_is_transparent() {
        assert_eq!(serde_json::to_string(&TxnId::new(9)).unwrap(), "9");
        let key: RowKey = serde_json::from_str(r#"{"table":3,"row":4}"#).unwrap();
        assert_eq!(key, RowKey::new(TableId::new(3), 4));
    }

    #[test]
    fn test_row_key_bytes() {
        let key = RowKey::new(TableId::new(7), u64::MAX - 3);
        assert_eq!(RowKey::from_le_bytes(key.to_le_bytes()), key);
        assert_eq!(format!("{key:?}"), format!("RowKey(7:{})", u64::MAX - 3));
    }

    #[test]
    fn test_row_keys_order_by_table_first() {
        assert!(RowKey::new(TableId::new(1), 9) < RowKey::new(TableId::new(2), 0));
    }
}
