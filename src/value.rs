use std::sync::Arc;

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserValue = Arc<[u8]>;

/// Value type (regular value or tombstone)
///
/// A tombstone shadows any older version of the same key in older runs.
/// Tombstones are dropped lazily, once a compaction writes into the
/// bottommost level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,
}

/// Represents an item in the engine
///
/// `key` and `value` are arbitrary user-defined byte arrays.
///
/// There are no sequence numbers: within the memtable a key exists at most
/// once, and across sorted runs versions are disambiguated by run recency
/// (the newer run wins).
#[derive(Clone, PartialEq, Eq)]
pub struct Value {
    /// User-defined key - an arbitrary byte array
    ///
    /// Supports up to 2^16 bytes
    pub key: UserKey,

    /// User-defined value - an arbitrary byte array
    ///
    /// Supports up to 2^32 bytes
    pub value: UserValue,

    /// Tombstone marker - if this is [`ValueType::Tombstone`], the value has been deleted
    pub value_type: ValueType,
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{} => {:?}",
            self.key,
            match self.value_type {
                ValueType::Value => "V",
                ValueType::Tombstone => "T",
            },
            self.value
        )
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by user key only; recency between equal keys is decided by
// which run an item came from, not by the item itself
impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl Value {
    /// Creates a new [`Value`].
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16, or the value length is greater than 2^32
    pub fn new<K: Into<UserKey>, V: Into<UserValue>>(
        key: K,
        value: V,
        value_type: ValueType,
    ) -> Self {
        let k = key.into();
        let v = value.into();

        assert!(!k.is_empty());
        assert!(k.len() <= u16::MAX.into());
        assert!(u32::try_from(v.len()).is_ok());

        Self {
            key: k,
            value: v,
            value_type,
        }
    }

    /// Creates a new tombstone marker for the given key.
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16
    pub fn new_tombstone<K: Into<UserKey>>(key: K) -> Self {
        Self::new(key, vec![], ValueType::Tombstone)
    }

    /// Size of the item, as counted against the write buffer
    #[doc(hidden)]
    #[must_use]
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }

    #[doc(hidden)]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Tombstone
    }
}
