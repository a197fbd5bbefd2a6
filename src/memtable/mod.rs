use crate::skiplist::SkipList;
use crate::value::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// The memtable serves as an intermediary storage for new items
///
/// It wraps the concurrent [`SkipList`]: the skiplist itself rejects
/// duplicate keys, so overwrites are routed through the node's swappable
/// value pointer, which keeps the memtable at most one entry per key.
#[derive(Default)]
pub struct MemTable {
    pub(crate) items: SkipList,

    /// Approximate active memtable size
    ///
    /// If this grows too large, a flush is triggered
    approximate_size: AtomicU64,
}

impl MemTable {
    /// Returns the item by key if it exists
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Value> {
        self.items.get(key)
    }

    /// Get approximate size of the memtable in bytes
    pub fn size(&self) -> u64 {
        self.approximate_size.load(Ordering::Acquire)
    }

    /// Counts the amount of items in the memtable
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the memtable is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts an item into the memtable, overwriting an existing value.
    ///
    /// Returns the added item's size and the new size of the memtable; on
    /// overwrite, only the byte delta between old and new value is
    /// accounted.
    pub fn insert(&self, item: Value) -> (u64, u64) {
        let item_size = item.size() as u64;

        let size_after = if self.items.insert_item(item.clone()) {
            self.approximate_size.fetch_add(item_size, Ordering::AcqRel) + item_size
        } else {
            let displaced = self
                .items
                .replace(&item.key, &item.value, item.value_type)
                .map_or(0, |value| value.len() as u64);

            let new_len = item.value.len() as u64;

            if new_len >= displaced {
                let delta = new_len - displaced;
                self.approximate_size.fetch_add(delta, Ordering::AcqRel) + delta
            } else {
                let delta = displaced - new_len;
                self.approximate_size.fetch_sub(delta, Ordering::AcqRel) - delta
            }
        };

        (item_size, size_after)
    }

    /// Iterates over all items in key order
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use test_log::test;

    #[test]
    fn test_memtable_get() {
        let memtable = MemTable::default();

        let item = Value::new(b"abc".to_vec(), b"abc".to_vec(), ValueType::Value);
        memtable.insert(item.clone());

        assert_eq!(Some(item), memtable.get("abc"));
    }

    #[test]
    fn test_memtable_overwrite() {
        let memtable = MemTable::default();

        memtable.insert(Value::new(b"abc".to_vec(), b"old".to_vec(), ValueType::Value));
        memtable.insert(Value::new(b"abc".to_vec(), b"new".to_vec(), ValueType::Value));

        let item = memtable.get("abc").expect("should exist");
        assert_eq!(b"new", &*item.value);
        assert_eq!(1, memtable.len());
    }

    #[test]
    fn test_memtable_delete_shadows_value() {
        let memtable = MemTable::default();

        memtable.insert(Value::new(b"abc".to_vec(), b"abc".to_vec(), ValueType::Value));
        memtable.insert(Value::new_tombstone(b"abc".to_vec()));

        let item = memtable.get("abc").expect("should exist");
        assert!(item.is_tombstone());
    }

    #[test]
    fn test_memtable_size_accounting() {
        let memtable = MemTable::default();

        let (item_size, size_after) =
            memtable.insert(Value::new(b"key".to_vec(), b"value".to_vec(), ValueType::Value));
        assert_eq!(8, item_size);
        assert_eq!(8, size_after);

        // Growing the value accounts the delta only
        let (_, size_after) = memtable.insert(Value::new(
            b"key".to_vec(),
            b"valuevalue".to_vec(),
            ValueType::Value,
        ));
        assert_eq!(13, size_after);

        // Shrinking accounts a negative delta
        let (_, size_after) =
            memtable.insert(Value::new(b"key".to_vec(), b"v".to_vec(), ValueType::Value));
        assert_eq!(4, size_after);

        assert_eq!(4, memtable.size());
    }

    #[test]
    fn test_memtable_iter_is_sorted() {
        let memtable = MemTable::default();

        for key in ["qq", "aa", "zz", "mm"] {
            memtable.insert(Value::new(
                key.as_bytes().to_vec(),
                b"x".to_vec(),
                ValueType::Value,
            ));
        }

        let keys = memtable.iter().map(|item| item.key).collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();

        assert_eq!(sorted, keys);
    }
}
