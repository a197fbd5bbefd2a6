use crate::run::{RunStream, SortedRun};
use crate::Value;
use min_max_heap::MinMaxHeap;
use std::sync::Arc;

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = Value> + 'a>;

type IteratorIndex = usize;

#[derive(Debug)]
struct IteratorValue((IteratorIndex, Value));

impl std::ops::Deref for IteratorValue {
    type Target = Value;

    fn deref(&self) -> &Self::Target {
        &self.0 .1
    }
}

impl PartialEq for IteratorValue {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for IteratorValue {}

impl PartialOrd for IteratorValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by user key, THEN by input rank
//
// Inputs are ordered newest first, so for equal keys the freshest version
// has the lowest rank and is popped first
impl Ord for IteratorValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.0 .1.key, self.0 .0).cmp(&(&other.0 .1.key, other.0 .0))
    }
}

/// This iterator can iterate through N iterators simultaneously in order
///
/// This is achieved by advancing the iterators that yield the lowest item
/// and merging using a simple k-way merge algorithm.
///
/// The output contains at most one entry per key: if multiple inputs yield
/// the same key, the entry from the input with the lowest rank (= the
/// newest source) wins, and the older versions are skipped.
#[allow(clippy::module_name_repetitions)]
pub struct MergeIterator<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: MinMaxHeap<IteratorValue>,
    evict_tombstones: bool,
    initialized: bool,
}

impl<'a> MergeIterator<'a> {
    /// Initializes a new merge iterator.
    ///
    /// Inputs must be ordered newest first; the input's position is its
    /// recency rank.
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        Self {
            iterators,
            heap: MinMaxHeap::new(),
            evict_tombstones: false,
            initialized: false,
        }
    }

    /// Drops tombstone winners from the output.
    ///
    /// Only valid when no older version of any merged key can exist outside
    /// the merge - the compaction picker asserts this by only setting it
    /// when the merge writes into the bottommost level.
    pub fn evict_tombstones(mut self, v: bool) -> Self {
        self.evict_tombstones = v;
        self
    }

    /// Builds a merge iterator over whole runs, newest run first
    pub fn from_runs(runs: &[Arc<SortedRun>]) -> MergeIterator<'static> {
        let mut iter_vec: Vec<BoxedIterator<'static>> = Vec::with_capacity(runs.len());

        for run in runs {
            iter_vec.push(Box::new(RunStream::new(run.clone())));
        }

        MergeIterator::new(iter_vec)
    }

    fn advance_iter(&mut self, idx: usize) {
        let iterator = self.iterators.get_mut(idx).expect("iter should exist");

        if let Some(value) = iterator.next() {
            self.heap.push(IteratorValue((idx, value)));
        }
    }

    fn push_next(&mut self) {
        for idx in 0..self.iterators.len() {
            self.advance_iter(idx);
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            self.push_next();
            self.initialized = true;
        }

        while let Some(head) = self.heap.pop_min() {
            let (head_idx, _) = head.0;
            self.advance_iter(head_idx);

            // The winning version for this key has been extracted; advance
            // past the older versions without emitting them
            while let Some(next) = self.heap.pop_min() {
                if next.key == head.key {
                    let (next_idx, _) = next.0;
                    self.advance_iter(next_idx);
                } else {
                    // Reached the next user key now
                    // Push back non-conflicting item and exit
                    self.heap.push(next);
                    break;
                }
            }

            if head.is_tombstone() && self.evict_tombstones {
                continue;
            }

            return Some(head.0 .1);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use test_log::test;

    #[test]
    fn test_non_overlapping() {
        let iter0 = (0u64..5).map(|x| Value::new(x.to_be_bytes(), *b"new", ValueType::Value));
        let iter1 = (5u64..10).map(|x| Value::new(x.to_be_bytes(), *b"old", ValueType::Value));
        let iter2 = (10u64..15).map(|x| Value::new(x.to_be_bytes(), *b"asd", ValueType::Value));

        let iter0 = Box::new(iter0);
        let iter1 = Box::new(iter1);
        let iter2 = Box::new(iter2);

        let merge_iter = MergeIterator::new(vec![iter0, iter1, iter2]);

        for (idx, item) in merge_iter.enumerate() {
            assert_eq!(item.key, (idx as u64).to_be_bytes().into());
        }
    }

    #[test]
    fn test_mixed() {
        let vec0 = vec![
            Value::new(1u64.to_be_bytes(), *b"old", ValueType::Value),
            Value::new(2u64.to_be_bytes(), *b"new", ValueType::Value),
            Value::new(3u64.to_be_bytes(), *b"old", ValueType::Value),
        ];

        let vec1 = vec![
            Value::new(1u64.to_be_bytes(), *b"new", ValueType::Value),
            Value::new(2u64.to_be_bytes(), *b"old", ValueType::Value),
            Value::new(3u64.to_be_bytes(), *b"new", ValueType::Value),
        ];

        // vec0 is the newer source; for key 1 and 3 its values are stale
        // in-universe, but rank decides, so vec0 must win every conflict
        let iter0 = Box::new(vec0.clone().into_iter());
        let iter1 = Box::new(vec1.into_iter());

        let merge_iter = MergeIterator::new(vec![iter0, iter1]);
        let items = merge_iter.collect::<Vec<_>>();

        assert_eq!(items, vec0);
    }

    #[test]
    fn test_rank_tie_break() {
        let newest = vec![Value::new(*b"k", *b"v2", ValueType::Value)];
        let middle = vec![Value::new(*b"k", *b"v1", ValueType::Value)];
        let oldest = vec![Value::new(*b"k", *b"v0", ValueType::Value)];

        let merge_iter = MergeIterator::new(vec![
            Box::new(newest.into_iter()),
            Box::new(middle.into_iter()),
            Box::new(oldest.into_iter()),
        ]);

        let items = merge_iter.collect::<Vec<_>>();

        assert_eq!(1, items.len());
        assert_eq!(b"v2", &*items[0].value);
    }

    #[test]
    fn test_tombstone_shadowing_is_retained() {
        let vec0 = vec![
            Value::new_tombstone(1u64.to_be_bytes()),
            Value::new_tombstone(2u64.to_be_bytes()),
        ];

        let vec1 = vec![
            Value::new(1u64.to_be_bytes(), *b"old", ValueType::Value),
            Value::new(2u64.to_be_bytes(), *b"old", ValueType::Value),
        ];

        let merge_iter = MergeIterator::new(vec![
            Box::new(vec0.clone().into_iter()),
            Box::new(vec1.into_iter()),
        ]);
        let items = merge_iter.collect::<Vec<_>>();

        // Not the bottommost level: tombstones must survive the merge
        assert_eq!(items, vec0);
    }

    #[test]
    fn test_tombstone_eviction() {
        let vec0 = vec![
            Value::new_tombstone(1u64.to_be_bytes()),
            Value::new(2u64.to_be_bytes(), *b"new", ValueType::Value),
        ];

        let vec1 = vec![
            Value::new(1u64.to_be_bytes(), *b"old", ValueType::Value),
            Value::new(2u64.to_be_bytes(), *b"old", ValueType::Value),
        ];

        let merge_iter = MergeIterator::new(vec![
            Box::new(vec0.into_iter()),
            Box::new(vec1.into_iter()),
        ])
        .evict_tombstones(true);

        let items = merge_iter.collect::<Vec<_>>();

        // The deleted key disappears entirely; the old version beneath the
        // tombstone must not resurface
        assert_eq!(1, items.len());
        assert_eq!(2u64.to_be_bytes(), &*items[0].key);
        assert_eq!(b"new", &*items[0].value);
    }

    #[test]
    fn test_merge_from_runs() {
        let newer = Arc::new(
            crate::run::SortedRun::new(vec![
                Value::new(*b"a", *b"2", ValueType::Value),
                Value::new(*b"c", *b"2", ValueType::Value),
            ])
            .expect("should not be empty"),
        );

        let older = Arc::new(
            crate::run::SortedRun::new(vec![
                Value::new(*b"a", *b"1", ValueType::Value),
                Value::new(*b"b", *b"1", ValueType::Value),
            ])
            .expect("should not be empty"),
        );

        let items = MergeIterator::from_runs(&[newer, older]).collect::<Vec<_>>();

        assert_eq!(3, items.len());
        assert_eq!(b"2", &*items[0].value); // "a" from the newer run
        assert_eq!(b"1", &*items[1].value); // "b"
        assert_eq!(b"2", &*items[2].value); // "c"
    }
}
