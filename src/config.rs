use crate::Engine;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

const DEFAULT_CPU_CORES: usize = 4;

fn queried_core_count() -> usize {
    let queried_cores = std::thread::available_parallelism().map(usize::from);

    // Reserve 1 CPU core if possible
    (queried_cores.unwrap_or(DEFAULT_CPU_CORES) - 1)
        // Should never be 0
        .max(1)
}

/// Compaction strategy to use for background merging
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompactionStyle {
    /// Size-tiered compaction (STCS)
    ///
    /// Runs accumulate inside a level and are merged together into the next
    /// level once their count reaches the fan-in trigger. Decent write
    /// amplification, higher read & space amplification.
    Tiered,

    /// Levelled compaction (LCS)
    ///
    /// Every level above L0 is a sorted set of runs with disjoint key
    /// ranges, sized geometrically. Higher write amplification, decent
    /// read & space amplification.
    Levelled,
}

/// Engine configuration
#[derive(Clone)]
pub struct Config {
    /// Byte count at which the active memtable is sealed and queued for
    /// flushing (the tuner may mutate this at runtime)
    pub(crate) memtable_bytes_threshold: u64,

    /// Lower clamp for the tuned memtable threshold
    pub(crate) min_memtable_size: u64,

    /// Upper clamp for the tuned memtable threshold
    pub(crate) max_memtable_size: u64,

    /// Amount of background worker threads (the tuner may mutate this at
    /// runtime)
    pub(crate) max_background_jobs: usize,

    /// Compaction strategy
    pub(crate) compaction_style: CompactionStyle,

    /// Tiered: fan-in trigger per level
    pub(crate) files_per_tier: usize,

    /// Levelled: amount of L0 runs that triggers a L0 -> L1 compaction
    pub(crate) max_l0_runs: usize,

    /// Levelled: size ratio between levels (growth rate)
    pub(crate) fanout: usize,

    /// Levelled: target byte size of level 1
    pub(crate) base_level_size: u64,

    /// Target byte size of runs written by levelled compactions
    pub(crate) run_target_size: u64,

    /// Amount of levels of the hierarchy (depth)
    pub(crate) level_count: usize,

    /// L0 run count that the tuner scores as "L0 full"
    pub(crate) l0_slowdown_trigger: usize,

    /// Denominator for the tuner's pending-compaction score
    pub(crate) soft_pending_compaction_bytes: u64,

    /// Tick period of the adaptive tuner; zero disables the tuner
    pub(crate) tuner_gap: Duration,

    /// Compaction-idle ratio above which the tuner considers the
    /// background pool idle
    pub(crate) idle_threshold: f64,

    /// Reserved flush-gap classifier threshold
    pub(crate) gap_threshold: f64,

    /// Fraction of the historical best flush bandwidth below which a flush
    /// is considered slow
    pub(crate) slow_flush_threshold: f64,

    /// Sealed-memtable queue length at which foreground writes stall
    pub(crate) immutable_queue_soft_limit: usize,

    /// How long a stalled write retries before surfacing an error
    pub(crate) write_stall_timeout: Duration,

    /// Merge width used when the tuner derives the level-1 target size
    /// from the memtable size
    pub(crate) min_merge_width: usize,

    /// Upper clamp for the tuned worker count
    pub(crate) core_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memtable_bytes_threshold: /* 8 MiB */ 8 * 1_024 * 1_024,
            min_memtable_size: /* 1 MiB */ 1_024 * 1_024,
            max_memtable_size: /* 256 MiB */ 256 * 1_024 * 1_024,
            max_background_jobs: 4,
            compaction_style: CompactionStyle::Levelled,
            files_per_tier: 4,
            max_l0_runs: 4,
            fanout: 8,
            base_level_size: /* 64 MiB */ 64 * 1_024 * 1_024,
            run_target_size: /* 64 MiB */ 64 * 1_024 * 1_024,
            level_count: 7,
            l0_slowdown_trigger: 8,
            soft_pending_compaction_bytes: /* 64 GiB */ 64 * 1_024 * 1_024 * 1_024,
            tuner_gap: Duration::ZERO,
            idle_threshold: 2.5,
            gap_threshold: 1.0,
            slow_flush_threshold: 0.5,
            immutable_queue_soft_limit: 8,
            write_stall_timeout: Duration::from_secs(30),
            min_merge_width: 1,
            core_count: queried_core_count(),
        }
    }
}

impl Config {
    /// Initializes a new config
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the memtable rollover threshold in bytes.
    ///
    /// Defaults to 8 MiB. The adaptive tuner may change the live value at
    /// runtime, clamped to the configured memtable size range.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is 0.
    #[must_use]
    pub fn memtable_bytes_threshold(mut self, bytes: u64) -> Self {
        assert!(bytes > 0);

        self.memtable_bytes_threshold = bytes;
        self
    }

    /// Sets the clamp range for the tuned memtable threshold.
    ///
    /// Defaults to 1 MiB .. 256 MiB.
    ///
    /// # Panics
    ///
    /// Panics if `min` is 0 or greater than `max`.
    #[must_use]
    pub fn memtable_size_range(mut self, min: u64, max: u64) -> Self {
        assert!(min > 0);
        assert!(min <= max);

        self.min_memtable_size = min;
        self.max_memtable_size = max;
        self
    }

    /// Sets the amount of background worker threads.
    ///
    /// Defaults to 4. The adaptive tuner may change the live value at
    /// runtime, clamped to [2, core count].
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn max_background_jobs(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.max_background_jobs = n;
        self
    }

    /// Sets the compaction strategy to use.
    ///
    /// Defaults to [`CompactionStyle::Levelled`].
    #[must_use]
    pub fn compaction_style(mut self, style: CompactionStyle) -> Self {
        self.compaction_style = style;
        self
    }

    /// Sets the tiered strategy's fan-in trigger per level.
    ///
    /// Defaults to 4.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn files_per_tier(mut self, n: usize) -> Self {
        assert!(n > 1);

        self.files_per_tier = n;
        self
    }

    /// Sets the levelled strategy's L0 run count trigger.
    ///
    /// Defaults to 4.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn max_l0_runs(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.max_l0_runs = n;
        self
    }

    /// Sets the size ratio between levels (a.k.a. fanout, growth rate).
    ///
    /// Defaults to 8.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn fanout(mut self, n: usize) -> Self {
        assert!(n > 1);

        self.fanout = n;
        self
    }

    /// Sets the target byte size of level 1 under levelled compaction.
    ///
    /// Deeper levels are sized `base * fanout^(level - 1)`. Defaults to
    /// 64 MiB.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is 0.
    #[must_use]
    pub fn base_level_size(mut self, bytes: u64) -> Self {
        assert!(bytes > 0);

        self.base_level_size = bytes;
        self
    }

    /// Sets the target byte size of runs written by levelled compactions.
    ///
    /// Defaults to 64 MiB.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is 0.
    #[must_use]
    pub fn run_target_size(mut self, bytes: u64) -> Self {
        assert!(bytes > 0);

        self.run_target_size = bytes;
        self
    }

    /// Sets the amount of levels of the hierarchy (depth).
    ///
    /// Defaults to 7, like `LevelDB` and `RocksDB`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn level_count(mut self, n: usize) -> Self {
        assert!(n > 1);

        self.level_count = n;
        self
    }

    /// Sets the L0 run count the tuner scores as "L0 full".
    ///
    /// Defaults to 8.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn l0_slowdown_trigger(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.l0_slowdown_trigger = n;
        self
    }

    /// Sets the soft limit for pending compaction bytes, the denominator
    /// of the tuner's pending-compaction score.
    ///
    /// Defaults to 64 GiB.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is 0.
    #[must_use]
    pub fn soft_pending_compaction_bytes(mut self, bytes: u64) -> Self {
        assert!(bytes > 0);

        self.soft_pending_compaction_bytes = bytes;
        self
    }

    /// Sets the tick period of the adaptive tuner.
    ///
    /// A period of 0 seconds (the default) disables the tuner.
    #[must_use]
    pub fn tuner_gap_seconds(mut self, secs: u64) -> Self {
        self.tuner_gap = Duration::from_secs(secs);
        self
    }

    /// Sets the classifier thresholds of the adaptive tuner:
    /// the compaction-idle ratio considered idle, the reserved flush-gap
    /// threshold, and the slow-flush bandwidth fraction.
    ///
    /// Defaults to (2.5, 1.0, 0.5).
    #[must_use]
    pub fn tuner_thresholds(mut self, idle: f64, gap: f64, slow_flush: f64) -> Self {
        self.idle_threshold = idle;
        self.gap_threshold = gap;
        self.slow_flush_threshold = slow_flush;
        self
    }

    /// Sets the sealed-memtable queue length at which foreground writes
    /// stall.
    ///
    /// Defaults to 8.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn immutable_queue_soft_limit(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.immutable_queue_soft_limit = n;
        self
    }

    /// Sets how long a stalled write retries before surfacing
    /// [`crate::Error::WriteStall`].
    ///
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn write_stall_timeout(mut self, timeout: Duration) -> Self {
        self.write_stall_timeout = timeout;
        self
    }

    /// Sets the core count used as the upper clamp for the tuned worker
    /// count.
    ///
    /// Defaults to the machine's available parallelism, reserving one
    /// core.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn core_count(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.core_count = n;
        self
    }

    /// Opens an engine using the config.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine cannot be started.
    pub fn open(self) -> crate::Result<Engine> {
        Engine::open(self)
    }
}

/// Runtime-mutable engine knobs.
///
/// The tuner writes these; foreground and background code only ever reads
/// them, so plain atomics are enough.
pub(crate) struct Tunables {
    pub memtable_bytes_threshold: AtomicU64,
    pub run_target_size: AtomicU64,
    pub base_level_size: AtomicU64,
}

impl Tunables {
    pub fn from_config(config: &Config) -> Self {
        Self {
            memtable_bytes_threshold: AtomicU64::new(config.memtable_bytes_threshold),
            run_target_size: AtomicU64::new(config.run_target_size),
            base_level_size: AtomicU64::new(config.base_level_size),
        }
    }

    pub fn memtable_bytes_threshold(&self) -> u64 {
        self.memtable_bytes_threshold.load(Ordering::Acquire)
    }

    pub fn run_target_size(&self) -> u64 {
        self.run_target_size.load(Ordering::Acquire)
    }

    pub fn base_level_size(&self) -> u64 {
        self.base_level_size.load(Ordering::Acquire)
    }
}
