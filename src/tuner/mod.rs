//! The adaptive tuner.
//!
//! A periodic control loop that scores the system from the metrics stream,
//! classifies the bottleneck regime, and emits configuration changes for
//! the memtable size and the background-worker count, following an AIMD
//! discipline (additive increase, multiplicative decrease).

mod score;

pub use score::{ScoreGradient, SystemScores};

use crate::{
    config::{CompactionStyle, Config},
    metrics::{MetricsCollector, WorkerKind},
};
use score::ScoreRing;
use std::sync::Arc;

/// Lower bound of the tuned background-worker count
pub const MIN_BACKGROUND_JOBS: usize = 2;

/// Job count above which the system is considered thread-saturated
const HIGH_JOB_WATERMARK: usize = 6;

/// Fraction of the historical best write rate below which writes count as
/// regressed
const WRITE_REGRESSION_RATIO: f64 = 0.7;

/// Fraction of the historical peak flush count below which flushing counts
/// as decreased
const FLUSH_DECREASE_RATIO: f64 = 0.3;

/// Flush workers are assumed to hold a quarter of the job budget,
/// compaction workers the rest
const FLUSH_JOB_SHARE: f64 = 0.25;

const MIB: f64 = 1_048_576.0;

/// System bottleneck regime related to the background-worker count
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// L0 runs pile up faster than compaction drains them
    L0Overflow,

    /// Pending compaction debt is growing
    RedundancyOverflow,

    /// No bottleneck detected
    GoodCondition,

    /// Compaction workers sit idle most of the window
    Idle,

    /// Flushing cannot keep up although the worker count is already high
    MemtableOverflow,
}

/// System bottleneck regime related to the memtable (batch) size
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchState {
    /// The memtable fills up faster than it can be flushed; a bigger
    /// memtable amortizes flushes better
    TinyMemtable,

    /// No bottleneck detected
    OverflowFree,

    /// Flushes became rare; the memtable is likely oversized
    FlushDecrease,
}

/// A tuning operation following the AIMD discipline
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpType {
    /// Additive increase
    LinearIncrease,

    /// Multiplicative decrease
    Half,

    /// No change
    Keep,
}

/// The combined decision of one tuning round
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TuningOp {
    /// Operation on the memtable size
    pub batch_op: OpType,

    /// Operation on the background-worker count
    pub thread_op: OpType,
}

/// Which engine option a change point targets
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunableOption {
    /// Memtable rollover threshold in bytes
    MemtableBytesThreshold,

    /// Background-worker count
    MaxBackgroundJobs,

    /// Target byte size of compaction output runs
    RunTargetSize,

    /// Target byte size of level 1
    BaseLevelSize,
}

/// Scope of a change point
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeScope {
    /// Applies to the engine as a whole (worker pool)
    Engine,

    /// Applies to the store's write and compaction path (sizing)
    Store,
}

/// A concrete configuration change emitted by a tuning round.
///
/// The engine applies change points before the next write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangePoint {
    /// The option to change
    pub option: TunableOption,

    /// The new value
    pub value: u64,

    /// Scope of the change
    pub scope: ChangeScope,
}

/// Live engine state sampled at the start of a tick
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineSample {
    /// Bytes in the active memtable
    pub active_memtable_bytes: u64,

    /// Bytes across all sealed memtables
    pub sealed_memtable_bytes: u64,

    /// Amount of sealed memtables waiting to flush
    pub sealed_count: usize,

    /// Amount of runs in L0
    pub l0_run_count: usize,

    /// Estimated pending compaction bytes
    pub pending_compaction_bytes: u64,

    /// Engine-lifetime count of bytes written into memtables
    pub total_bytes_written: u64,

    /// Current background-worker count
    pub current_background_jobs: usize,

    /// Current memtable rollover threshold
    pub current_memtable_threshold: u64,
}

/// The periodic scoring and tuning loop.
///
/// One tick consumes the metrics appended since the previous tick, scores
/// the system, classifies the regime against the historical per-field
/// maxima, and emits [`ChangePoint`]s.
pub struct Tuner {
    gap_secs: f64,
    idle_threshold: f64,
    #[allow(dead_code)]
    gap_threshold: f64,
    slow_flush_threshold: f64,
    l0_slowdown_trigger: usize,
    soft_pending_compaction_bytes: u64,
    min_memtable_size: u64,
    max_memtable_size: u64,

    /// Additive step of a memtable-size increase (the configured default
    /// threshold)
    default_memtable_size: u64,

    /// L0 trigger used when deriving the level-1 budget from the memtable
    /// size
    l0_trigger: usize,

    min_merge_width: usize,
    core_count: usize,

    metrics: Arc<MetricsCollector>,

    history: ScoreRing,
    max_scores: SystemScores,

    flush_cursor: usize,
    compaction_cursor: usize,
    flush_idle_cursor: usize,
    compaction_idle_cursor: usize,

    last_total_bytes_written: u64,
}

impl Tuner {
    /// Creates a tuner over the given metrics stream.
    #[must_use]
    pub fn new(config: &Config, metrics: Arc<MetricsCollector>) -> Self {
        let gap_secs = config.tuner_gap.as_secs_f64().max(1.0);

        // Keep ten minutes of history, like the original control loop
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let history_len = ((600.0 / gap_secs) as usize).max(1);

        let l0_trigger = match config.compaction_style {
            CompactionStyle::Tiered => config.files_per_tier,
            CompactionStyle::Levelled => config.max_l0_runs,
        };

        Self {
            gap_secs,
            idle_threshold: config.idle_threshold,
            gap_threshold: config.gap_threshold,
            slow_flush_threshold: config.slow_flush_threshold,
            l0_slowdown_trigger: config.l0_slowdown_trigger,
            soft_pending_compaction_bytes: config.soft_pending_compaction_bytes,
            min_memtable_size: config.min_memtable_size,
            max_memtable_size: config.max_memtable_size,
            default_memtable_size: config.memtable_bytes_threshold,
            l0_trigger,
            min_merge_width: config.min_merge_width,
            core_count: config.core_count,
            metrics,
            history: ScoreRing::new(history_len),
            max_scores: SystemScores::default(),
            flush_cursor: 0,
            compaction_cursor: 0,
            flush_idle_cursor: 0,
            compaction_idle_cursor: 0,
            last_total_bytes_written: 0,
        }
    }

    /// Runs one tuning round: score, classify, vote, emit.
    pub fn tick(&mut self, sample: &EngineSample) -> (SystemScores, Vec<ChangePoint>) {
        let score = self.score_the_system(sample);

        self.max_scores.update_max(&score);
        self.history.push(score);

        let thread_state =
            self.locate_thread_state(&score, &self.max_scores, sample.current_background_jobs);
        let batch_state =
            self.locate_batch_state(&score, &self.max_scores, sample.current_background_jobs);

        let op = Self::vote(thread_state, batch_state);
        let changes = self.fill_change_list(op, sample);

        log::debug!(
            "tuner: thread state {thread_state:?}, batch state {batch_state:?}, op {op:?}, {} change points",
            changes.len(),
        );

        (score, changes)
    }

    /// Gradient between the newest and the oldest snapshot in the bounded
    /// history window
    #[must_use]
    pub fn compare_with_before(&self) -> Option<ScoreGradient> {
        let newest = self.history.newest()?;
        let oldest = self.history.oldest()?;
        Some(*newest - *oldest)
    }

    fn score_the_system(&mut self, sample: &EngineSample) -> SystemScores {
        let mut score = SystemScores::default();

        // Memory component
        let written_delta = sample
            .total_bytes_written
            .saturating_sub(self.last_total_bytes_written);
        self.last_total_bytes_written = sample.total_bytes_written;

        score.memtable_speed = written_delta as f64 / self.gap_secs / MIB;

        let total_memtable_bytes = sample.active_memtable_bytes + sample.sealed_memtable_bytes;
        score.active_size_ratio = if total_memtable_bytes == 0 {
            0.0
        } else {
            sample.active_memtable_bytes as f64 / total_memtable_bytes as f64
        };

        score.immutable_number = sample.sealed_count as f64;

        // Flushing
        let flushes = self.metrics.flushes_since(self.flush_cursor);
        self.flush_cursor += flushes.len();

        score.flush_numbers = flushes.len() as f64;

        let mut disk_bytes = 0u64;

        if !flushes.is_empty() {
            for flush in &flushes {
                score.flush_speed_avg += flush.write_bandwidth / MIB;
                disk_bytes += flush.total_bytes;
            }

            score.flush_speed_avg /= flushes.len() as f64;

            for flush in &flushes {
                let deviation = flush.write_bandwidth / MIB - score.flush_speed_avg;
                score.flush_speed_var += deviation * deviation;
            }

            score.flush_speed_var /= flushes.len() as f64;
        }

        // Compactions
        let compactions = self.metrics.compactions_since(self.compaction_cursor);
        self.compaction_cursor += compactions.len();

        let mut l0_compactions = 0usize;

        for compaction in &compactions {
            if compaction.input_level == 0 {
                score.l0_drop_ratio += compaction.drop_ratio;
                l0_compactions += 1;
            }

            disk_bytes += compaction.total_bytes;
        }

        if l0_compactions > 0 {
            score.l0_drop_ratio /= l0_compactions as f64;
        }

        // LSM shape
        score.l0_occupancy = sample.l0_run_count as f64 / self.l0_slowdown_trigger as f64;
        score.estimate_compaction_bytes =
            sample.pending_compaction_bytes as f64 / self.soft_pending_compaction_bytes as f64;

        score.disk_bandwidth = disk_bytes as f64 / self.gap_secs / MIB;

        // Worker idle time, normalized to each pool's share of the window
        let jobs = sample.current_background_jobs.max(1) as f64;

        let flush_idle = self
            .metrics
            .idle_since(WorkerKind::Flush, self.flush_idle_cursor);
        self.flush_idle_cursor += flush_idle.len();

        let compaction_idle = self
            .metrics
            .idle_since(WorkerKind::Compaction, self.compaction_idle_cursor);
        self.compaction_idle_cursor += compaction_idle.len();

        let flush_idle_secs: f64 = flush_idle.iter().map(std::time::Duration::as_secs_f64).sum();
        let compaction_idle_secs: f64 = compaction_idle
            .iter()
            .map(std::time::Duration::as_secs_f64)
            .sum();

        score.flush_idle_time = flush_idle_secs / (jobs * self.gap_secs * FLUSH_JOB_SHARE);
        score.compaction_idle_time =
            compaction_idle_secs / (jobs * self.gap_secs * (1.0 - FLUSH_JOB_SHARE));

        score
    }

    /// Classifies the worker-count regime of `score` against the
    /// historical maxima.
    #[must_use]
    pub fn locate_thread_state(
        &self,
        score: &SystemScores,
        max: &SystemScores,
        current_jobs: usize,
    ) -> ThreadState {
        if score.memtable_speed < WRITE_REGRESSION_RATIO * max.memtable_speed {
            // Write rate regressed; the stall is behind one of the
            // background stages
            if score.immutable_number >= 1.0
                && score.flush_speed_avg <= self.slow_flush_threshold * max.flush_speed_avg
                && current_jobs > HIGH_JOB_WATERMARK
            {
                ThreadState::MemtableOverflow
            } else if score.immutable_number >= 1.0 && score.l0_occupancy > 0.5 {
                ThreadState::L0Overflow
            } else if score.l0_occupancy > 0.7 {
                ThreadState::L0Overflow
            } else if score.estimate_compaction_bytes > 0.5 {
                ThreadState::RedundancyOverflow
            } else {
                ThreadState::GoodCondition
            }
        } else if score.compaction_idle_time > self.idle_threshold {
            ThreadState::Idle
        } else {
            ThreadState::GoodCondition
        }
    }

    /// Classifies the memtable-size regime of `score` against the
    /// historical maxima.
    #[must_use]
    pub fn locate_batch_state(
        &self,
        score: &SystemScores,
        max: &SystemScores,
        current_jobs: usize,
    ) -> BatchState {
        if score.memtable_speed < WRITE_REGRESSION_RATIO * max.memtable_speed
            && score.flush_speed_avg < self.slow_flush_threshold * max.flush_speed_avg
        {
            if score.active_size_ratio > 0.5 && score.immutable_number >= 1.0 {
                // The active memtable fills up while its predecessor is
                // still not flushed
                BatchState::TinyMemtable
            } else if current_jobs > HIGH_JOB_WATERMARK || score.l0_occupancy > 0.9 {
                BatchState::TinyMemtable
            } else {
                BatchState::OverflowFree
            }
        } else if score.flush_numbers < FLUSH_DECREASE_RATIO * max.flush_numbers {
            BatchState::FlushDecrease
        } else {
            BatchState::OverflowFree
        }
    }

    /// Maps the two classifications onto a tuning operation.
    #[must_use]
    pub fn vote(thread_state: ThreadState, batch_state: BatchState) -> TuningOp {
        let thread_op = match thread_state {
            ThreadState::L0Overflow | ThreadState::RedundancyOverflow => OpType::LinearIncrease,
            ThreadState::GoodCondition => OpType::Keep,
            ThreadState::Idle | ThreadState::MemtableOverflow => OpType::Half,
        };

        let batch_op = match batch_state {
            BatchState::TinyMemtable => OpType::LinearIncrease,
            BatchState::OverflowFree => OpType::Keep,
            BatchState::FlushDecrease => OpType::Half,
        };

        TuningOp {
            batch_op,
            thread_op,
        }
    }

    /// Turns an operation into concrete change points, clamped to the
    /// configured bounds.
    #[must_use]
    pub fn fill_change_list(&self, op: TuningOp, sample: &EngineSample) -> Vec<ChangePoint> {
        let mut change_list = Vec::new();

        match op.batch_op {
            OpType::LinearIncrease => self.set_batch_size(
                &mut change_list,
                sample
                    .current_memtable_threshold
                    .saturating_add(self.default_memtable_size),
            ),
            OpType::Half => {
                self.set_batch_size(&mut change_list, sample.current_memtable_threshold / 2);
            }
            OpType::Keep => {}
        }

        match op.thread_op {
            OpType::LinearIncrease => {
                self.set_thread_num(&mut change_list, sample.current_background_jobs + 2);
            }
            OpType::Half => {
                self.set_thread_num(&mut change_list, sample.current_background_jobs / 2);
            }
            OpType::Keep => {}
        }

        change_list
    }

    fn set_thread_num(&self, change_list: &mut Vec<ChangePoint>, target_value: usize) {
        let target_value = target_value.clamp(MIN_BACKGROUND_JOBS, self.core_count.max(MIN_BACKGROUND_JOBS));

        change_list.push(ChangePoint {
            option: TunableOption::MaxBackgroundJobs,
            value: target_value as u64,
            scope: ChangeScope::Engine,
        });
    }

    fn set_batch_size(&self, change_list: &mut Vec<ChangePoint>, target_value: u64) {
        let target_value = target_value.clamp(self.min_memtable_size, self.max_memtable_size);

        change_list.push(ChangePoint {
            option: TunableOption::MemtableBytesThreshold,
            value: target_value,
            scope: ChangeScope::Store,
        });

        // Output runs should be sized like the memtable
        change_list.push(ChangePoint {
            option: TunableOption::RunTargetSize,
            value: target_value,
            scope: ChangeScope::Store,
        });

        // The level-1 budget tracks the amount of data one full L0 holds
        let l1_size = target_value
            .saturating_mul(self.l0_trigger as u64)
            .saturating_mul(self.min_merge_width as u64);

        change_list.push(ChangePoint {
            option: TunableOption::BaseLevelSize,
            value: l1_size,
            scope: ChangeScope::Store,
        });
    }
}
