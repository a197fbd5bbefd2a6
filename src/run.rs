use crate::value::{UserKey, Value};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Process-unique ID of a sorted run
pub type RunId = u64;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(0);

fn next_run_id() -> RunId {
    NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed)
}

/// An immutable sorted run of items.
///
/// Runs are created by flushing a memtable or by merging other runs during
/// compaction, and are registered in exactly one level. A run's key range
/// and byte size are cached at construction.
pub struct SortedRun {
    id: RunId,
    items: Vec<Value>,
    first_key: UserKey,
    last_key: UserKey,
    size_in_bytes: u64,
    marked_for_compaction: AtomicBool,
}

impl std::fmt::Debug for SortedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SortedRun#{} [{:?}..{:?}] ({} items, {} B)",
            self.id,
            self.first_key,
            self.last_key,
            self.items.len(),
            self.size_in_bytes,
        )
    }
}

impl SortedRun {
    /// Creates a run from a sorted item sequence.
    ///
    /// Returns `None` for an empty sequence (a merge can consume all of its
    /// input, e.g. when everything was shadowed by tombstones).
    pub(crate) fn new(items: Vec<Value>) -> Option<Self> {
        let first_key = items.first()?.key.clone();
        let last_key = items.last()?.key.clone();

        debug_assert!(
            items.windows(2).all(|pair| pair[0].key < pair[1].key),
            "runs must be strictly sorted by key",
        );

        let size_in_bytes = items.iter().map(|item| item.size() as u64).sum();

        Some(Self {
            id: next_run_id(),
            items,
            first_key,
            last_key,
            size_in_bytes,
            marked_for_compaction: AtomicBool::new(false),
        })
    }

    /// The run's ID
    #[must_use]
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Returns the item by key if it exists
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Value> {
        let key = key.as_ref();

        self.items
            .binary_search_by(|item| (*item.key).cmp(key))
            .ok()
            .map(|index| self.items[index].clone())
    }

    /// Smallest key in the run
    #[must_use]
    pub fn first_key(&self) -> &UserKey {
        &self.first_key
    }

    /// Largest key in the run
    #[must_use]
    pub fn last_key(&self) -> &UserKey {
        &self.last_key
    }

    /// Byte size of the run
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size_in_bytes
    }

    /// Amount of items in the run
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the run holds no items (never true for registered runs)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates over the run's items in key order
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.items.iter().cloned()
    }

    pub(crate) fn check_key_range_overlap(&self, min: &[u8], max: &[u8]) -> bool {
        !(max < &*self.first_key || min > &*self.last_key)
    }

    pub(crate) fn mark_for_compaction(&self) {
        self.marked_for_compaction.store(true, Ordering::Release);
    }

    pub(crate) fn is_marked_for_compaction(&self) -> bool {
        self.marked_for_compaction.load(Ordering::Acquire)
    }
}

/// Owning iterator over a shared run, used by point-in-time scans
pub(crate) struct RunStream {
    run: Arc<SortedRun>,
    index: usize,
}

impl RunStream {
    pub fn new(run: Arc<SortedRun>) -> Self {
        Self { run, index: 0 }
    }
}

impl Iterator for RunStream {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.run.items.get(self.index)?.clone();
        self.index += 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use test_log::test;

    fn run(items: &[(&str, &str)]) -> SortedRun {
        SortedRun::new(
            items
                .iter()
                .map(|(key, value)| {
                    Value::new(key.as_bytes().to_vec(), value.as_bytes().to_vec(), ValueType::Value)
                })
                .collect(),
        )
        .expect("items should not be empty")
    }

    #[test]
    fn test_run_get() {
        let run = run(&[("a", "1"), ("c", "3"), ("e", "5")]);

        assert_eq!(b"1", &*run.get("a").expect("should exist").value);
        assert_eq!(b"5", &*run.get("e").expect("should exist").value);
        assert!(run.get("b").is_none());
        assert!(run.get("z").is_none());
    }

    #[test]
    fn test_run_metadata() {
        let run = run(&[("a", "1"), ("c", "3"), ("e", "5")]);

        assert_eq!(b"a", &**run.first_key());
        assert_eq!(b"e", &**run.last_key());
        assert_eq!(3, run.len());
        assert_eq!(6, run.size());
        assert!(!run.is_empty());
    }

    #[test]
    fn test_run_overlap() {
        let run = run(&[("c", "3"), ("k", "11")]);

        assert!(run.check_key_range_overlap(b"a", b"d"));
        assert!(run.check_key_range_overlap(b"d", b"j"));
        assert!(run.check_key_range_overlap(b"k", b"z"));
        assert!(!run.check_key_range_overlap(b"a", b"b"));
        assert!(!run.check_key_range_overlap(b"l", b"z"));
    }

    #[test]
    fn test_empty_run_is_rejected() {
        assert!(SortedRun::new(vec![]).is_none());
    }
}
