//! Contains compaction strategies

pub(crate) mod levelled;
pub(crate) mod tiered;
pub(crate) mod worker;

use crate::{
    levels::Levels,
    run::{RunId, SortedRun},
};
use std::sync::Arc;

/// Input for the compactor.
///
/// The compaction strategy chooses which runs to merge and how.
/// That information is given to the compactor.
#[derive(Debug, Eq, PartialEq)]
pub struct Input {
    /// Runs to merge, ordered newest first.
    ///
    /// The position of a run doubles as its recency rank during the k-way
    /// merge.
    pub run_ids: Vec<RunId>,

    /// Level the inputs were picked from
    pub source_level: usize,

    /// Level to put the merged runs into
    pub dest_level: usize,

    /// Run target size
    ///
    /// If the merged output reaches this size, a new run is started,
    /// resulting in a sorted "run" sequence of runs.
    pub target_size: u64,

    /// Whether the destination level keeps key-ordered, disjoint runs
    /// (levelled compaction above L0)
    pub dest_key_ordered: bool,
}

/// Describes what to do (compact or not)
#[derive(Debug, Eq, PartialEq)]
pub enum Choice {
    /// Just do nothing.
    ///
    /// This is also the outcome when every candidate run is busy in another
    /// compaction: the picker aborts this cycle and reports "no work".
    DoNothing,

    /// Compacts some runs into a level.
    Merge(Input),
}

/// Trait for a compaction strategy
///
/// The strategy receives the levels of the engine as argument
/// and emits a choice on what to do.
#[allow(clippy::module_name_repetitions)]
pub trait CompactionStrategy {
    /// Places a freshly flushed run into the level structure
    fn add_run(&self, levels: &mut Levels, run: Arc<SortedRun>);

    /// Whether any level currently satisfies a compaction trigger
    fn should_compact(&self, levels: &Levels) -> bool;

    /// Decides on what to do based on the current state of the levels
    fn choose(&self, levels: &Levels) -> Choice;

    /// Estimated amount of bytes that compactions still need to rewrite.
    ///
    /// This feeds the adaptive tuner's pending-compaction score.
    fn pending_bytes(&self, levels: &Levels) -> u64;
}

pub use levelled::Strategy as Levelled;
pub use tiered::Strategy as SizeTiered;
