mod level;

pub use level::Level;

use crate::run::{RunId, SortedRun};
use std::{collections::HashSet, sync::Arc};

pub type HiddenSet = HashSet<RunId>;

/// Represents the levels of the run hierarchy.
pub struct Levels {
    levels: Vec<Level>,

    /// Set of run IDs that are masked
    ///
    /// While consuming runs (because of compaction) they will not appear in
    /// resolved views, as to not cause conflicts between multiple
    /// compactions picking the same runs
    hidden_set: HiddenSet,
}

impl Levels {
    pub(crate) fn create_new(level_count: usize) -> Self {
        assert!(level_count > 0, "level_count should be >= 1");

        Self {
            levels: (0..level_count).map(|_| Level::default()).collect(),
            hidden_set: HashSet::with_capacity(10),
        }
    }

    pub(crate) fn is_compacting(&self) -> bool {
        !self.hidden_set.is_empty()
    }

    /// Registers a freshly flushed run at the front of L0 (newest first)
    pub(crate) fn add(&mut self, run: Arc<SortedRun>) {
        self.insert_into_level(0, run);
    }

    /// Inserts a run at the front of a level, keeping the level's runs
    /// ordered from newest to oldest.
    ///
    /// Point reads walk age-ordered levels front to back, so the fresher
    /// version of an item is always seen first.
    pub(crate) fn insert_into_level(&mut self, level_no: usize, run: Arc<SortedRun>) {
        let last_level_index = self.last_level_index();
        let index = level_no.clamp(0, last_level_index);

        let level = self.levels.get_mut(index).expect("level should exist");
        level.insert(0, run);
    }

    /// Inserts a run into a key-ordered level, restoring the order of
    /// disjoint key ranges
    pub(crate) fn insert_into_level_key_ordered(&mut self, level_no: usize, run: Arc<SortedRun>) {
        let last_level_index = self.last_level_index();
        let index = level_no.clamp(0, last_level_index);

        let level = self.levels.get_mut(index).expect("level should exist");
        level.push(run);
        level.sort_by_first_key();
    }

    pub(crate) fn remove(&mut self, run_id: RunId) {
        for level in &mut self.levels {
            level.retain(|run| run.id() != run_id);
        }

        self.hidden_set.remove(&run_id);
    }

    /// Returns `true` if there are no runs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the amount of levels in the hierarchy
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Index of the bottommost level
    #[must_use]
    pub fn last_level_index(&self) -> usize {
        self.depth() - 1
    }

    /// Returns the amount of runs, summed over all levels
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.iter().map(|level| level.len()).sum()
    }

    /// Returns the size of all runs in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.levels.iter().map(Level::size).sum()
    }

    /// Amount of runs in the first level
    pub fn first_level_run_count(&self) -> usize {
        self.levels.first().expect("L0 should always exist").len()
    }

    /// Raw view of the levels, including runs that are being compacted
    #[must_use]
    pub fn raw_view(&self) -> &[Level] {
        &self.levels
    }

    /// Indices of levels that have at least one run in a running compaction
    pub fn busy_levels(&self) -> HashSet<usize> {
        let mut output = HashSet::with_capacity(self.levels.len());

        for (idx, level) in self.levels.iter().enumerate() {
            if level.iter().any(|run| self.hidden_set.contains(&run.id())) {
                output.insert(idx);
            }
        }

        output
    }

    /// Returns a view into the levels, hiding all runs that currently are
    /// being compacted
    #[must_use]
    pub fn resolved_view(&self) -> Vec<Level> {
        self.levels
            .iter()
            .map(|level| {
                Level(
                    level
                        .iter()
                        .filter(|run| !self.hidden_set.contains(&run.id()))
                        .cloned()
                        .collect(),
                )
            })
            .collect()
    }

    pub(crate) fn get_run(&self, run_id: RunId) -> Option<Arc<SortedRun>> {
        self.levels
            .iter()
            .flat_map(|level| level.iter())
            .find(|run| run.id() == run_id)
            .cloned()
    }

    pub(crate) fn run_is_busy(&self, run_id: RunId) -> bool {
        self.hidden_set.contains(&run_id)
    }

    pub(crate) fn hide_runs(&mut self, keys: &[RunId]) {
        for key in keys {
            self.hidden_set.insert(*key);
        }
    }

    pub(crate) fn show_runs(&mut self, keys: &[RunId]) {
        for key in keys {
            self.hidden_set.remove(key);
        }
    }
}
