use crate::run::{RunId, SortedRun};
use std::{ops::DerefMut, sync::Arc};

/// One level of the run hierarchy.
///
/// Age-ordered levels (L0, and every level under tiered compaction) keep
/// their runs newest first; key-ordered levels (L1+ under levelled
/// compaction) keep them sorted by first key with pairwise-disjoint
/// ranges.
pub struct Level(pub(crate) Vec<Arc<SortedRun>>);

impl std::ops::Deref for Level {
    type Target = Vec<Arc<SortedRun>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Level {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Default for Level {
    fn default() -> Self {
        Self(Vec::with_capacity(20))
    }
}

impl Level {
    /// Gets the level size in bytes
    pub fn size(&self) -> u64 {
        self.iter().map(|run| run.size()).sum()
    }

    /// IDs of all runs whose key range intersects `[min, max]`
    pub fn get_overlapping_runs(&self, min: &[u8], max: &[u8]) -> Vec<RunId> {
        self.0
            .iter()
            .filter(|run| run.check_key_range_overlap(min, max))
            .map(|run| run.id())
            .collect()
    }

    pub(crate) fn sort_by_first_key(&mut self) {
        self.0.sort_by(|a, b| a.first_key().cmp(b.first_key()));
    }
}
