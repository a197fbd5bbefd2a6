use crate::value::{UserKey, UserValue, ValueType};
use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

/// Payload of a node.
///
/// Overwriting a key swaps the whole cell through the node's atomic value
/// pointer, so readers always observe a fully initialized pair.
pub(super) struct ValueCell {
    pub value: UserValue,
    pub value_type: ValueType,
}

/// A skiplist node.
///
/// The tower holds one forward pointer per level; its length is the node's
/// height, fixed at allocation time. Slot `i` holds the next node at level
/// `i`, or null. Links are published with release stores and read with
/// acquire loads, so a reader that observes a link also observes the
/// pointee's key and value.
pub(super) struct Node {
    pub key: UserKey,
    value: AtomicPtr<ValueCell>,
    tower: Box<[AtomicPtr<Node>]>,
}

fn empty_tower(height: usize) -> Box<[AtomicPtr<Node>]> {
    (0..height)
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

impl Node {
    pub fn new(key: UserKey, cell: ValueCell, height: usize) -> Box<Self> {
        debug_assert!(height >= 1);

        Box::new(Self {
            key,
            value: AtomicPtr::new(Box::into_raw(Box::new(cell))),
            tower: empty_tower(height),
        })
    }

    /// Creates the head sentinel.
    ///
    /// The head carries no value and compares less than every key.
    pub fn head(height: usize) -> Box<Self> {
        Box::new(Self {
            key: vec![].into(),
            value: AtomicPtr::new(ptr::null_mut()),
            tower: empty_tower(height),
        })
    }

    pub fn height(&self) -> usize {
        self.tower.len()
    }

    pub fn next(&self, level: usize) -> *mut Self {
        self.tower[level].load(Ordering::Acquire)
    }

    /// Reads a link of the not-yet-published node itself
    pub fn next_relaxed(&self, level: usize) -> *mut Self {
        self.tower[level].load(Ordering::Relaxed)
    }

    /// Writes a link of the not-yet-published node itself
    pub fn set_next_relaxed(&self, level: usize, node: *mut Self) {
        self.tower[level].store(node, Ordering::Relaxed);
    }

    /// Publishes `node` as the successor at `level`, expecting the slot to
    /// still hold `expected`
    pub fn cas_next(&self, level: usize, expected: *mut Self, node: *mut Self) -> bool {
        self.tower[level]
            .compare_exchange(expected, node, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Returns the node's current value cell.
    ///
    /// Returns `None` only for the head sentinel. The reference stays valid
    /// for the lifetime of the owning list: displaced cells are parked in
    /// the list's retired set and freed when the list drops.
    pub fn cell(&self) -> Option<&ValueCell> {
        let ptr = self.value.load(Ordering::Acquire);

        if ptr.is_null() {
            None
        } else {
            // SAFETY: non-null cells are created from Box::into_raw and are
            // never freed while the list is alive (see retired set)
            Some(unsafe { &*ptr })
        }
    }

    /// Swaps the value cell, returning the displaced one.
    ///
    /// The caller must park the returned pointer in the list's retired set;
    /// concurrent readers may still hold references into it.
    pub fn replace_cell(&self, cell: ValueCell) -> *mut ValueCell {
        let new = Box::into_raw(Box::new(cell));
        self.value.swap(new, Ordering::AcqRel)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let ptr = *self.value.get_mut();

        if !ptr.is_null() {
            // SAFETY: the node is being destroyed by the owning list, so no
            // reader can still observe this cell
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}
