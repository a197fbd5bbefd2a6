use super::{Choice, CompactionStrategy, Input as CompactionInput};
use crate::{config::Tunables, levels::Levels, run::SortedRun};
use std::sync::{Arc, Mutex};

/// Levelled compaction strategy (LCS)
///
/// L0 collects whole flushed memtables; once `max_l0_runs` have amassed,
/// all of L0 is merged with the overlapping part of L1. Every level above
/// L0 keeps runs with pairwise-disjoint key ranges and a byte budget that
/// grows by `fanout` per level; an over-budget level contributes one input
/// run (chosen round-robin) which is merged with the overlapping runs of
/// the next level.
///
/// LCS suffers from high write amplification, but decent read & space
/// amplification.
///
/// More info here: <https://opensource.docs.scylladb.com/stable/cql/compaction.html#leveled-compaction-strategy-lcs>
pub struct Strategy {
    /// When the number of runs in L0 reaches this threshold, they are
    /// merged into L1
    ///
    /// Default = 4
    ///
    /// Same as `level0_file_num_compaction_trigger` in RocksDB
    max_l0_runs: usize,

    /// Size ratio between levels
    fanout: usize,

    /// Live sizing knobs (base level size, run target size); the tuner
    /// rewrites these at runtime
    tunables: Arc<Tunables>,

    /// Per-level round-robin cursors for choosing the next input run
    cursors: Mutex<Vec<usize>>,
}

impl Strategy {
    pub(crate) fn new(
        max_l0_runs: usize,
        fanout: usize,
        level_count: usize,
        tunables: Arc<Tunables>,
    ) -> Self {
        assert!(fanout > 1);

        Self {
            max_l0_runs,
            fanout,
            tunables,
            cursors: Mutex::new(vec![0; level_count]),
        }
    }

    fn desired_level_size_in_bytes(&self, level_index: usize) -> u64 {
        debug_assert!(level_index >= 1);

        // NOTE: The exponent is tiny, fanout^5 or so; this cannot
        // realistically overflow
        #[allow(clippy::cast_possible_truncation)]
        let growth = (self.fanout as u64).pow((level_index - 1) as u32);

        self.tunables.base_level_size() * growth
    }

    /// Deepest level that holds any data.
    ///
    /// The size trigger does not apply to this level: merging the deepest
    /// data into empty space below would only rewrite it without reducing
    /// read amplification.
    fn deepest_populated_level(levels: &Levels) -> Option<usize> {
        levels
            .raw_view()
            .iter()
            .rposition(|level| !level.is_empty())
    }

    fn key_range_of(runs: &[Arc<SortedRun>]) -> (crate::UserKey, crate::UserKey) {
        let mut min = runs
            .first()
            .expect("run list should not be empty")
            .first_key()
            .clone();
        let mut max = runs
            .first()
            .expect("run list should not be empty")
            .last_key()
            .clone();

        for other in runs.iter().skip(1) {
            if other.first_key() < &min {
                min = other.first_key().clone();
            }
            if other.last_key() > &max {
                max = other.last_key().clone();
            }
        }

        (min, max)
    }
}

impl CompactionStrategy for Strategy {
    fn add_run(&self, levels: &mut Levels, run: Arc<SortedRun>) {
        // Freshly flushed runs go to the front of L0 (newest first); their
        // ranges may overlap freely
        levels.add(run);
    }

    fn should_compact(&self, levels: &Levels) -> bool {
        if levels.first_level_run_count() >= self.max_l0_runs {
            return true;
        }

        let last_level_index = levels.last_level_index();
        let deepest = Self::deepest_populated_level(levels).unwrap_or_default();

        levels
            .raw_view()
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(level_index, _)| *level_index < last_level_index && *level_index < deepest)
            .any(|(level_index, level)| level.size() >= self.desired_level_size_in_bytes(level_index))
    }

    fn choose(&self, levels: &Levels) -> Choice {
        let resolved_view = levels.resolved_view();

        // If there are any levels that already have a compactor working on
        // them we can't touch those, because that could cause a race
        // condition violating the levelled compaction invariant of having
        // disjoint runs per level
        let busy_levels = levels.busy_levels();

        let last_level_index = levels.last_level_index();
        let deepest = Self::deepest_populated_level(levels).unwrap_or_default();

        // Check the deeper levels first; L0 is handled below
        for level_index in (1..last_level_index.min(deepest)).rev() {
            let level = &resolved_view[level_index];

            if level.is_empty() {
                continue;
            }

            let next_level_index = level_index + 1;

            if busy_levels.contains(&level_index) || busy_levels.contains(&next_level_index) {
                continue;
            }

            if level.size() < self.desired_level_size_in_bytes(level_index) {
                continue;
            }

            // Rotate through the level's runs so repeated compactions
            // spread across the whole key space
            let pick_index = {
                let mut cursors = self.cursors.lock().expect("lock is poisoned");
                let cursor = cursors.get_mut(level_index).expect("cursor should exist");
                let pick_index = *cursor % level.len();
                *cursor = cursor.wrapping_add(1);
                pick_index
            };

            let run = &level[pick_index];

            let mut run_ids = vec![run.id()];
            run_ids.extend(
                resolved_view[next_level_index]
                    .get_overlapping_runs(run.first_key(), run.last_key()),
            );

            return Choice::Merge(CompactionInput {
                run_ids,
                source_level: level_index,
                dest_level: next_level_index,
                target_size: self.tunables.run_target_size(),
                dest_key_ordered: true,
            });
        }

        {
            let first_level = &resolved_view[0];

            if first_level.len() >= self.max_l0_runs
                && !busy_levels.contains(&0)
                && !busy_levels.contains(&1)
            {
                // L0 ranges may overlap, so all of L0 is the input and the
                // covering range is the union min/max
                let (min, max) = Self::key_range_of(first_level);

                let mut run_ids = first_level
                    .iter()
                    .map(|run| run.id())
                    .collect::<Vec<_>>();

                run_ids.extend(resolved_view[1].get_overlapping_runs(&min, &max));

                return Choice::Merge(CompactionInput {
                    run_ids,
                    source_level: 0,
                    dest_level: 1,
                    target_size: self.tunables.run_target_size(),
                    dest_key_ordered: true,
                });
            }
        }

        Choice::DoNothing
    }

    fn pending_bytes(&self, levels: &Levels) -> u64 {
        let raw_view = levels.raw_view();
        let last_level_index = levels.last_level_index();
        let deepest = Self::deepest_populated_level(levels).unwrap_or_default();

        let mut pending = 0;

        if raw_view[0].len() >= self.max_l0_runs {
            pending += raw_view[0].size();
        }

        for (level_index, level) in raw_view.iter().enumerate().skip(1) {
            if level_index >= last_level_index || level_index >= deepest {
                break;
            }

            pending += level
                .size()
                .saturating_sub(self.desired_level_size_in_bytes(level_index));
        }

        pending
    }
}
