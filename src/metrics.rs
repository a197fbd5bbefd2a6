use std::sync::Mutex;
use std::time::Duration;

/// Unix timestamp of "now", used to stamp flush events
pub(crate) fn unix_timestamp() -> Duration {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
}

/// Performance data of a single memtable flush
#[derive(Clone, Debug)]
pub struct FlushMetrics {
    /// Bytes written by the flush
    pub total_bytes: u64,

    /// Write bandwidth of the flush in bytes per second
    pub write_bandwidth: f64,

    /// Unix timestamp at which the flush started
    pub start_time: Duration,

    /// Amount of L0 runs right after the flushed run was registered
    pub l0_run_count: usize,
}

/// Fine-grained I/O latencies of a background job.
///
/// Phases without an analogue in this in-memory engine record zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoLatency {
    /// Time spent preparing the merge inputs
    pub prepare_nanos: u64,

    /// Time spent producing the output
    pub file_write_nanos: u64,

    /// Time spent in range sync
    pub range_sync_nanos: u64,

    /// Time spent in fsync
    pub fsync_nanos: u64,
}

/// Performance data of a single compaction
#[derive(Clone, Debug)]
pub struct CompactionMetrics {
    /// Level the inputs were taken from
    pub input_level: usize,

    /// Level the merged output was installed into
    pub output_level: usize,

    /// Records dropped, divided by records read
    pub drop_ratio: f64,

    /// Read bandwidth in bytes per second
    pub read_bandwidth: f64,

    /// Write bandwidth in bytes per second
    pub write_bandwidth: f64,

    /// Bytes written, divided by the bytes that entered from the source
    /// level
    pub write_amplification: f64,

    /// Total bytes moved (read + written)
    pub total_bytes: u64,

    /// Estimated pending compaction bytes when the compaction started
    pub pending_compaction_bytes: u64,

    /// Depth of the sealed-memtable queue when the compaction started
    pub immutable_queue_len: usize,

    /// Fine-grained latencies
    pub io: IoLatency,
}

/// Which kind of background work a worker just performed
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerKind {
    /// Memtable flush
    Flush,

    /// Run compaction
    Compaction,
}

/// Append-only collection of background-work events.
///
/// Consumers (the adaptive tuner) keep monotonic indices into each series
/// and read only what was appended since their last visit.
#[derive(Default)]
pub struct MetricsCollector {
    flushes: Mutex<Vec<FlushMetrics>>,
    compactions: Mutex<Vec<CompactionMetrics>>,

    /// Idle gaps between consecutive tasks, per worker kind
    flush_idle: Mutex<Vec<Duration>>,
    compaction_idle: Mutex<Vec<Duration>>,
}

impl MetricsCollector {
    pub(crate) fn record_flush(&self, metrics: FlushMetrics) {
        self.flushes
            .lock()
            .expect("lock is poisoned")
            .push(metrics);
    }

    pub(crate) fn record_compaction(&self, metrics: CompactionMetrics) {
        self.compactions
            .lock()
            .expect("lock is poisoned")
            .push(metrics);
    }

    pub(crate) fn record_idle(&self, kind: WorkerKind, idle: Duration) {
        let series = match kind {
            WorkerKind::Flush => &self.flush_idle,
            WorkerKind::Compaction => &self.compaction_idle,
        };

        series.lock().expect("lock is poisoned").push(idle);
    }

    /// Amount of recorded flushes
    pub fn flush_count(&self) -> usize {
        self.flushes.lock().expect("lock is poisoned").len()
    }

    /// Amount of recorded compactions
    pub fn compaction_count(&self) -> usize {
        self.compactions.lock().expect("lock is poisoned").len()
    }

    /// Flush events appended at or after `index`
    pub fn flushes_since(&self, index: usize) -> Vec<FlushMetrics> {
        let flushes = self.flushes.lock().expect("lock is poisoned");
        flushes.get(index..).unwrap_or_default().to_vec()
    }

    /// Compaction events appended at or after `index`
    pub fn compactions_since(&self, index: usize) -> Vec<CompactionMetrics> {
        let compactions = self.compactions.lock().expect("lock is poisoned");
        compactions.get(index..).unwrap_or_default().to_vec()
    }

    /// Idle gaps of the given worker kind appended at or after `index`
    pub fn idle_since(&self, kind: WorkerKind, index: usize) -> Vec<Duration> {
        let series = match kind {
            WorkerKind::Flush => &self.flush_idle,
            WorkerKind::Compaction => &self.compaction_idle,
        };

        let series = series.lock().expect("lock is poisoned");
        series.get(index..).unwrap_or_default().to_vec()
    }

    /// Length of the idle series of the given worker kind
    pub fn idle_count(&self, kind: WorkerKind) -> usize {
        let series = match kind {
            WorkerKind::Flush => &self.flush_idle,
            WorkerKind::Compaction => &self.compaction_idle,
        };

        series.lock().expect("lock is poisoned").len()
    }
}
