mod node;
mod splice;

pub use splice::Splice;

use crate::value::{UserKey, UserValue, Value, ValueType};
use node::{Node, ValueCell};
use rand::Rng;
use std::{
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

/// Maximum node height
pub(crate) const MAX_HEIGHT: usize = 16;

/// Branching probability is 1/4 per level
const BRANCHING: u32 = 4;

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;

    while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
        height += 1;
    }

    height
}

/// A lock-free concurrent skiplist.
///
/// This is the ordered index backing the write buffer. It supports
/// concurrent inserts and point/range reads; readers never block.
///
/// Keys are unique: inserting an already-present key fails and leaves the
/// first value in place. The engine layers value replacement on top of this
/// (see [`crate::MemTable`]), which is why nodes carry their value behind a
/// swappable atomic pointer.
///
/// Nodes are linked bottom-up and published with release stores; a node is
/// visible to readers once its level-0 link is in place. Nodes are never
/// unlinked - all memory is reclaimed when the list is dropped, which keeps
/// the lock-free paths free of any reclamation protocol.
///
/// # Examples
///
/// ```
/// use skred::{SkipList, ValueType};
///
/// let list = SkipList::default();
///
/// assert!(list.insert("a", "1", ValueType::Value));
/// assert!(!list.insert("a", "2", ValueType::Value));
///
/// let item = list.get(b"a").expect("should exist");
/// assert_eq!(b"1", &*item.value);
/// ```
pub struct SkipList {
    head: *mut Node,
    max_height: AtomicUsize,
    len: AtomicUsize,

    /// Value cells displaced by a replace.
    ///
    /// Readers may still hold references into a displaced cell, so cells
    /// are parked here and freed when the list drops.
    retired: Mutex<Vec<*mut ValueCell>>,
}

// SAFETY: all shared mutation goes through atomics; nodes and value cells
// are only freed while holding exclusive access (drop)
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    /// Creates an empty skiplist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: Box::into_raw(Node::head(MAX_HEIGHT)),
            max_height: AtomicUsize::new(1),
            len: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Amount of items in the list
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if the list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        // SAFETY: nodes are never freed while the list is alive
        node != self.head && unsafe { &*(*node).key } < key
    }

    /// Finds, at `level`, the last node with a key less than `key`,
    /// starting from `before` (which must be head or precede `key`)
    fn find_splice_for_level(
        &self,
        key: &[u8],
        mut before: *mut Node,
        level: usize,
    ) -> (*mut Node, *mut Node) {
        loop {
            // SAFETY: `before` is head or a published node; see type invariant
            let next = unsafe { (*before).next(level) };

            if next.is_null() || !self.key_is_after_node(key, next) {
                return (before, next);
            }

            before = next;
        }
    }

    /// Computes all splice levels from scratch.
    ///
    /// The per-level predecessors are the nodes visited at the moment of
    /// descent; levels at and above the current list height point at head.
    fn find_splice(&self, key: &[u8], splice: &mut Splice) {
        let list_height = self.max_height.load(Ordering::Acquire);

        for level in list_height..=MAX_HEIGHT {
            splice.prev[level] = self.head;
            splice.next[level] = ptr::null_mut();
        }

        for level in (0..list_height).rev() {
            let (prev, next) = self.find_splice_for_level(key, splice.prev[level + 1], level);
            splice.prev[level] = prev;
            splice.next[level] = next;
        }

        splice.height = list_height;
    }

    /// Checks whether a cached splice level still brackets `key`
    fn splice_is_valid_at(&self, splice: &Splice, key: &[u8], level: usize) -> bool {
        let prev = splice.prev[level];
        let next = splice.next[level];

        if prev.is_null() {
            return false;
        }

        // SAFETY: nodes are never freed while the list is alive
        let prev_ok = prev == self.head || unsafe { &*(*prev).key } < key;
        let next_ok = next.is_null() || unsafe { &*(*next).key } > key;

        prev_ok && next_ok
    }

    /// Inserts an item.
    ///
    /// Returns `false` if the key is already present; the first value
    /// survives. There are no update semantics here - the engine layer
    /// handles overwrites.
    ///
    /// Thread-safe for concurrent inserts and reads.
    pub fn insert<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        value_type: ValueType,
    ) -> bool {
        let mut splice = Splice::new();
        self.insert_internal(
            key.as_ref().into(),
            value.as_ref().into(),
            value_type,
            &mut splice,
            false,
        )
    }

    /// Inserts an item, using and refreshing a cached [`Splice`].
    ///
    /// The splice is validated per level; only levels that went stale are
    /// recomputed, starting from the highest still-valid predecessor. The
    /// splice must have been produced by inserts into *this* list and must
    /// stay on the calling thread (the type is `!Send`, which enforces the
    /// latter).
    pub fn insert_with_hint<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        value_type: ValueType,
        splice: &mut Splice,
    ) -> bool {
        self.insert_internal(
            key.as_ref().into(),
            value.as_ref().into(),
            value_type,
            splice,
            true,
        )
    }

    fn insert_internal(
        &self,
        key: UserKey,
        value: UserValue,
        value_type: ValueType,
        splice: &mut Splice,
        use_hint: bool,
    ) -> bool {
        let height = random_height();

        // Bump the list height first so concurrent inserts at the new
        // levels see a consistent ceiling
        let mut list_height = self.max_height.load(Ordering::Acquire);
        while height > list_height {
            match self.max_height.compare_exchange_weak(
                list_height,
                height,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => list_height = observed,
            }
        }

        if use_hint && splice.height >= height {
            // Validate top-down; everything below the first stale level is
            // recomputed from the level above it
            let mut recompute_from = 0;

            for level in (0..height).rev() {
                if !self.splice_is_valid_at(splice, &key, level) {
                    recompute_from = level + 1;
                    break;
                }
            }

            if recompute_from == height {
                // Even the top cached level is stale
                splice.prev[height] = self.head;
                splice.next[height] = ptr::null_mut();
            }

            for level in (0..recompute_from).rev() {
                let (prev, next) = self.find_splice_for_level(&key, splice.prev[level + 1], level);
                splice.prev[level] = prev;
                splice.next[level] = next;
            }
        } else {
            self.find_splice(&key, splice);
        }

        // Duplicate check under freshly computed level-0 predecessors,
        // before anything is allocated or published
        let next0 = splice.next[0];
        // SAFETY: nodes are never freed while the list is alive
        if !next0.is_null() && unsafe { &*(*next0).key } == &*key {
            return false;
        }

        let node = Box::into_raw(Node::new(key, ValueCell { value, value_type }, height));
        // SAFETY: `node` is exclusively ours until its level-0 CAS succeeds
        let key = unsafe { &(*node).key };

        for level in 0..height {
            unsafe {
                (*node).set_next_relaxed(level, splice.next[level]);
            }

            loop {
                let expected = unsafe { (*node).next_relaxed(level) };

                // SAFETY: predecessors are published nodes (or head)
                if unsafe { (*splice.prev[level]).cas_next(level, expected, node) } {
                    break;
                }

                // Lost the race at this level; re-scan from the last stable
                // predecessor instead of restarting from the top
                let (prev, next) = self.find_splice_for_level(key, splice.prev[level], level);

                if level == 0 && !next.is_null() && unsafe { &*(*next).key } == &**key {
                    // A concurrent insert won with the same key. The node
                    // was never published, so it can be taken back.
                    // SAFETY: no link to `node` exists
                    drop(unsafe { Box::from_raw(node) });
                    return false;
                }

                splice.prev[level] = prev;
                splice.next[level] = next;

                unsafe {
                    (*node).set_next_relaxed(level, next);
                }
            }
        }

        if use_hint {
            // The new node is now the best predecessor for a following,
            // larger key
            for level in 0..height {
                splice.prev[level] = node;
            }
        }

        self.len.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Inserts an item without re-allocating its key and value bytes
    pub(crate) fn insert_item(&self, item: Value) -> bool {
        let mut splice = Splice::new();
        self.insert_internal(item.key, item.value, item.value_type, &mut splice, false)
    }

    /// Swaps the value of an existing key, returning the displaced value.
    ///
    /// This is the engine's overwrite path; it leaves the node structure
    /// untouched, so it never contends with concurrent link updates.
    pub(crate) fn replace<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        value_type: ValueType,
    ) -> Option<UserValue> {
        let node = self.find_greater_or_equal(key.as_ref());

        if node.is_null() {
            return None;
        }

        // SAFETY: nodes are never freed while the list is alive
        let node = unsafe { &*node };

        if &*node.key != key.as_ref() {
            return None;
        }

        let displaced = node.replace_cell(ValueCell {
            value: value.as_ref().into(),
            value_type,
        });

        // SAFETY: `displaced` came out of this list's value slot and is
        // parked until drop; reading it here is fine
        let old_value = unsafe { (*displaced).value.clone() };

        self.retired
            .lock()
            .expect("lock is poisoned")
            .push(displaced);

        Some(old_value)
    }

    fn find_greater_or_equal(&self, key: &[u8]) -> *mut Node {
        let mut current = self.head;
        let list_height = self.max_height.load(Ordering::Acquire);

        for level in (0..list_height).rev() {
            // SAFETY: nodes are never freed while the list is alive
            let mut next = unsafe { (*current).next(level) };

            while !next.is_null() && self.key_is_after_node(key, next) {
                current = next;
                next = unsafe { (*current).next(level) };
            }
        }

        // SAFETY: see above
        unsafe { (*current).next(0) }
    }

    /// Returns the item by key, if it exists
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Value> {
        let key = key.as_ref();
        let node = self.find_greater_or_equal(key);

        if node.is_null() {
            return None;
        }

        // SAFETY: nodes are never freed while the list is alive
        let node = unsafe { &*node };

        if &*node.key != key {
            return None;
        }

        let cell = node.cell()?;

        Some(Value {
            key: node.key.clone(),
            value: cell.value.clone(),
            value_type: cell.value_type,
        })
    }

    /// Returns `true` if the list contains the key
    pub fn contains<K: AsRef<[u8]>>(&self, key: K) -> bool {
        let key = key.as_ref();
        let node = self.find_greater_or_equal(key);

        // SAFETY: nodes are never freed while the list is alive
        !node.is_null() && unsafe { &*(*node).key } == key
    }

    /// Iterates over all items in key order (the level-0 chain)
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            _list: self,
            // SAFETY: head is valid for the lifetime of the list
            current: unsafe { (*self.head).next(0) },
        }
    }

    /// Iterates over items with keys greater than or equal to `key`
    pub fn range_from<K: AsRef<[u8]>>(&self, key: K) -> Iter<'_> {
        Iter {
            _list: self,
            current: self.find_greater_or_equal(key.as_ref()),
        }
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        // The level-0 chain contains every node exactly once
        //
        // SAFETY: we have exclusive access; nothing can observe the nodes
        // or cells being freed
        unsafe {
            let head = Box::from_raw(self.head);
            let mut current = head.next_relaxed(0);

            while !current.is_null() {
                let node = Box::from_raw(current);
                current = node.next_relaxed(0);
                drop(node);
            }
        }

        for cell in self
            .retired
            .get_mut()
            .expect("lock is poisoned")
            .drain(..)
        {
            // SAFETY: displaced cells are owned by the retired set
            drop(unsafe { Box::from_raw(cell) });
        }
    }
}

/// Forward iterator over the level-0 chain
pub struct Iter<'a> {
    _list: &'a SkipList,
    current: *mut Node,
}

impl Iterator for Iter<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }

        // SAFETY: nodes are never freed while the list is alive, and the
        // iterator borrows the list
        let node = unsafe { &*self.current };
        self.current = node.next(0);

        let cell = node.cell()?;

        Some(Value {
            key: node.key.clone(),
            value: cell.value.clone(),
            value_type: cell.value_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn test_skiplist_insert_duplicate() {
        let list = SkipList::new();

        assert!(list.insert("a", "1", ValueType::Value));
        assert!(list.insert("b", "2", ValueType::Value));
        assert!(!list.insert("a", "3", ValueType::Value));

        let item = list.get("a").expect("should exist");
        assert_eq!(b"1", &*item.value);
        assert_eq!(2, list.len());
    }

    #[test]
    fn test_skiplist_ordering() {
        let list = SkipList::new();

        for key in ["delta", "alpha", "echo", "bravo", "charlie"] {
            assert!(list.insert(key, "x", ValueType::Value));
        }

        let keys = list.iter().map(|item| item.key).collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();

        assert_eq!(sorted, keys);
        assert_eq!(5, keys.len());
    }

    #[test]
    fn test_skiplist_range_from() {
        let list = SkipList::new();

        for key in ["a", "b", "c", "d", "e"] {
            assert!(list.insert(key, "x", ValueType::Value));
        }

        let keys = list
            .range_from("c")
            .map(|item| item.key)
            .collect::<Vec<_>>();

        assert_eq!(3, keys.len());
        assert_eq!(b"c", &*keys[0]);
        assert_eq!(b"e", &*keys[2]);
    }

    #[test]
    fn test_skiplist_replace() {
        let list = SkipList::new();

        assert!(list.insert("a", "old", ValueType::Value));

        let displaced = list.replace("a", "new", ValueType::Value);
        assert_eq!(b"old", &*displaced.expect("key should exist"));

        let item = list.get("a").expect("should exist");
        assert_eq!(b"new", &*item.value);

        assert!(list.replace("missing", "x", ValueType::Value).is_none());
    }

    #[test]
    fn test_skiplist_tombstone_roundtrip() {
        let list = SkipList::new();

        assert!(list.insert("a", "", ValueType::Tombstone));

        let item = list.get("a").expect("should exist");
        assert!(item.is_tombstone());
    }

    #[test]
    fn test_skiplist_hinted_bulk_insert() {
        let list = SkipList::new();
        let mut splice = Splice::new();

        for idx in 0u32..1_000 {
            let key = idx.to_be_bytes().to_vec();
            assert!(list.insert_with_hint(key, "x", ValueType::Value, &mut splice));
        }

        assert_eq!(1_000, list.len());

        let keys = list.iter().map(|item| item.key).collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(sorted, keys);
    }

    #[test]
    fn test_skiplist_hint_with_non_monotonic_keys() {
        let list = SkipList::new();
        let mut splice = Splice::new();

        // Descending order invalidates the cached splice every time
        for idx in (0u32..100).rev() {
            let key = idx.to_be_bytes().to_vec();
            assert!(list.insert_with_hint(key, "x", ValueType::Value, &mut splice));
        }

        for idx in 0u32..100 {
            assert!(!list.insert_with_hint(
                idx.to_be_bytes().to_vec(),
                "y",
                ValueType::Value,
                &mut splice
            ));
        }

        assert_eq!(100, list.len());
    }

    #[test]
    fn test_skiplist_concurrent_distinct_inserts() {
        let list = Arc::new(SkipList::new());

        let threads = (0u64..8)
            .map(|thread_no| {
                let list = list.clone();

                std::thread::spawn(move || {
                    for idx in 0u64..1_000 {
                        let key = (thread_no * 1_000 + idx).to_be_bytes().to_vec();
                        assert!(list.insert(key, "x", ValueType::Value));
                    }
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().expect("should join");
        }

        assert_eq!(8_000, list.len());

        let keys = list.iter().map(|item| item.key).collect::<Vec<_>>();
        assert_eq!(8_000, keys.len());

        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, keys);
    }

    #[test]
    fn test_skiplist_concurrent_same_key() {
        let list = Arc::new(SkipList::new());

        let threads = (0u64..8)
            .map(|thread_no| {
                let list = list.clone();

                std::thread::spawn(move || {
                    let mut won = 0;

                    for idx in 0u64..500 {
                        let key = idx.to_be_bytes().to_vec();
                        if list.insert(key, thread_no.to_be_bytes().to_vec(), ValueType::Value) {
                            won += 1;
                        }
                    }

                    won
                })
            })
            .collect::<Vec<_>>();

        let total_wins: u64 = threads
            .into_iter()
            .map(|thread| thread.join().expect("should join"))
            .sum();

        // Exactly one insert per key may win
        assert_eq!(500, total_wins);
        assert_eq!(500, list.len());
    }

    #[test]
    fn test_skiplist_reader_sees_writer() {
        let list = Arc::new(SkipList::new());
        let writer_list = list.clone();

        let writer = std::thread::spawn(move || {
            for idx in 0u64..1_000 {
                assert!(writer_list.insert(
                    idx.to_be_bytes().to_vec(),
                    "x",
                    ValueType::Value
                ));
            }
        });

        writer.join().expect("should join");

        // Everything the writer published must be visible now
        for idx in 0u64..1_000 {
            assert!(list.contains(idx.to_be_bytes().to_vec()));
        }
    }
}
