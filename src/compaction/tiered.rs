use super::{Choice, CompactionStrategy, Input as CompactionInput};
use crate::{levels::Levels, run::SortedRun};
use std::sync::Arc;

/// Size-tiered compaction strategy (STCS)
///
/// If a level accumulates `files_per_tier` runs, all of them are merged
/// into a single run in the next level; merges can cascade down the
/// hierarchy. A run explicitly marked for compaction triggers its level as
/// well.
///
/// STCS suffers from high read and temporary space amplification, but
/// decent write amplification.
///
/// More info here: <https://opensource.docs.scylladb.com/stable/cql/compaction.html#size-tiered-compaction-strategy-stcs>
pub struct Strategy {
    /// When the number of runs in a level reaches this threshold, the
    /// level is merged into the next one
    ///
    /// Default = 4
    ///
    /// Same as `files_per_tier` in the tier style of RocksDB forks
    pub files_per_tier: usize,
}

impl Default for Strategy {
    fn default() -> Self {
        Self { files_per_tier: 4 }
    }
}

impl Strategy {
    /// Finds the lowest non-bottom level that satisfies a trigger.
    ///
    /// Levels with a busy run are skipped this cycle: a tiered merge takes
    /// a whole level, so every input must be idle.
    fn find_triggered_level(&self, levels: &Levels) -> Option<usize> {
        let last_level_index = levels.last_level_index();

        for (level_index, level) in levels.raw_view().iter().enumerate() {
            if level_index == last_level_index || level.is_empty() {
                continue;
            }

            let triggered_by_size = level.len() >= self.files_per_tier;

            let triggered_by_mark = level
                .iter()
                .any(|run| run.is_marked_for_compaction() && !levels.run_is_busy(run.id()));

            if !(triggered_by_size || triggered_by_mark) {
                continue;
            }

            if level.iter().any(|run| levels.run_is_busy(run.id())) {
                continue;
            }

            return Some(level_index);
        }

        None
    }
}

impl CompactionStrategy for Strategy {
    fn add_run(&self, levels: &mut Levels, run: Arc<SortedRun>) {
        levels.add(run);
    }

    fn should_compact(&self, levels: &Levels) -> bool {
        let last_level_index = levels.last_level_index();

        levels
            .raw_view()
            .iter()
            .enumerate()
            .filter(|(level_index, _)| *level_index < last_level_index)
            .any(|(_, level)| {
                let has_idle_run = level.iter().any(|run| !levels.run_is_busy(run.id()));

                let triggered_by_size = level.len() >= self.files_per_tier && has_idle_run;

                let triggered_by_mark = level
                    .iter()
                    .any(|run| run.is_marked_for_compaction() && !levels.run_is_busy(run.id()));

                triggered_by_size || triggered_by_mark
            })
    }

    fn choose(&self, levels: &Levels) -> Choice {
        let Some(level_index) = self.find_triggered_level(levels) else {
            return Choice::DoNothing;
        };

        let level = &levels.raw_view()[level_index];

        Choice::Merge(CompactionInput {
            // The level is stored newest first, which is exactly the merge
            // rank order
            run_ids: level.iter().map(|run| run.id()).collect(),
            source_level: level_index,
            dest_level: level_index + 1,
            target_size: u64::MAX,
            dest_key_ordered: false,
        })
    }

    fn pending_bytes(&self, levels: &Levels) -> u64 {
        let last_level_index = levels.last_level_index();

        levels
            .raw_view()
            .iter()
            .enumerate()
            .filter(|(level_index, level)| {
                *level_index < last_level_index && level.len() >= self.files_per_tier
            })
            .map(|(_, level)| level.size())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::Strategy;
    use crate::{
        compaction::{Choice, CompactionStrategy, Input as CompactionInput},
        levels::Levels,
        run::SortedRun,
        value::{Value, ValueType},
    };
    use std::sync::Arc;
    use test_log::test;

    fn fixture_run(range: (&str, &str)) -> Arc<SortedRun> {
        Arc::new(
            SortedRun::new(vec![
                Value::new(range.0.as_bytes().to_vec(), b"x".to_vec(), ValueType::Value),
                Value::new(range.1.as_bytes().to_vec(), b"x".to_vec(), ValueType::Value),
            ])
            .expect("should not be empty"),
        )
    }

    #[test]
    fn empty_levels() {
        let compactor = Strategy::default();
        let levels = Levels::create_new(4);

        assert!(!compactor.should_compact(&levels));
        assert_eq!(compactor.choose(&levels), Choice::DoNothing);
    }

    #[test]
    fn default_l0() {
        let compactor = Strategy::default();
        let mut levels = Levels::create_new(4);

        for _ in 0..3 {
            levels.add(fixture_run(("a", "z")));
            assert_eq!(compactor.choose(&levels), Choice::DoNothing);
        }

        let last = fixture_run(("a", "z"));
        levels.add(last.clone());

        assert!(compactor.should_compact(&levels));

        let expected_ids = levels.raw_view()[0]
            .iter()
            .map(|run| run.id())
            .collect::<Vec<_>>();

        assert_eq!(
            compactor.choose(&levels),
            Choice::Merge(CompactionInput {
                run_ids: expected_ids,
                source_level: 0,
                dest_level: 1,
                target_size: u64::MAX,
                dest_key_ordered: false,
            })
        );
    }

    #[test]
    fn busy_level_is_skipped() {
        let compactor = Strategy {
            files_per_tier: 2,
        };
        let mut levels = Levels::create_new(4);

        let run = fixture_run(("a", "m"));
        levels.add(run.clone());
        levels.add(fixture_run(("n", "z")));

        levels.hide_runs(&[run.id()]);
        assert_eq!(compactor.choose(&levels), Choice::DoNothing);

        levels.show_runs(&[run.id()]);
        assert!(matches!(compactor.choose(&levels), Choice::Merge(_)));
    }

    #[test]
    fn deeper_level() {
        let compactor = Strategy {
            files_per_tier: 2,
        };
        let mut levels = Levels::create_new(4);

        levels.insert_into_level(2, fixture_run(("a", "m")));
        levels.insert_into_level(2, fixture_run(("n", "z")));

        let choice = compactor.choose(&levels);

        match choice {
            Choice::Merge(input) => {
                assert_eq!(2, input.source_level);
                assert_eq!(3, input.dest_level);
                assert_eq!(2, input.run_ids.len());
            }
            Choice::DoNothing => panic!("should have chosen a compaction"),
        }
    }

    #[test]
    fn last_level_never_triggers() {
        let compactor = Strategy {
            files_per_tier: 2,
        };
        let mut levels = Levels::create_new(4);

        levels.insert_into_level(3, fixture_run(("a", "m")));
        levels.insert_into_level(3, fixture_run(("n", "z")));

        assert!(!compactor.should_compact(&levels));
        assert_eq!(compactor.choose(&levels), Choice::DoNothing);
    }

    #[test]
    fn marked_run_triggers_level() {
        let compactor = Strategy::default();
        let mut levels = Levels::create_new(4);

        let run = fixture_run(("a", "m"));
        levels.add(run.clone());

        assert!(!compactor.should_compact(&levels));

        run.mark_for_compaction();

        assert!(compactor.should_compact(&levels));
        assert!(matches!(compactor.choose(&levels), Choice::Merge(_)));
    }

    #[test]
    fn lowest_level_wins_tie() {
        let compactor = Strategy {
            files_per_tier: 2,
        };
        let mut levels = Levels::create_new(4);

        levels.insert_into_level(1, fixture_run(("a", "m")));
        levels.insert_into_level(1, fixture_run(("n", "z")));
        levels.insert_into_level(0, fixture_run(("a", "m")));
        levels.insert_into_level(0, fixture_run(("n", "z")));

        match compactor.choose(&levels) {
            Choice::Merge(input) => assert_eq!(0, input.source_level),
            Choice::DoNothing => panic!("should have chosen a compaction"),
        }
    }
}
