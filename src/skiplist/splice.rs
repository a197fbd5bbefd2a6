use super::{node::Node, MAX_HEIGHT};
use std::ptr;

/// Cached insertion position, used as a hint for subsequent inserts.
///
/// A splice remembers, per level, the predecessor and successor observed by
/// the previous insert on this thread. [`crate::SkipList::insert_with_hint`]
/// validates the cached pairs and only recomputes the levels that went
/// stale, which makes monotonically ordered bulk inserts O(1) amortized
/// per level.
///
/// A splice holds raw node pointers and is therefore neither `Send` nor
/// `Sync`: it is only meaningful on the thread (and for the list) that
/// produced it.
pub struct Splice {
    pub(super) height: usize,
    pub(super) prev: [*mut Node; MAX_HEIGHT + 1],
    pub(super) next: [*mut Node; MAX_HEIGHT + 1],
}

impl Splice {
    /// Creates an empty splice.
    ///
    /// The first insert through an empty splice computes all levels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            height: 0,
            prev: [ptr::null_mut(); MAX_HEIGHT + 1],
            next: [ptr::null_mut(); MAX_HEIGHT + 1],
        }
    }
}

impl Default for Splice {
    fn default() -> Self {
        Self::new()
    }
}
