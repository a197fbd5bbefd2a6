use crate::{
    compaction::{self, CompactionStrategy},
    config::{CompactionStyle, Config, Tunables},
    levels::Levels,
    memtable::MemTable,
    metrics::MetricsCollector,
    pool::ThreadPool,
    shutdown::Shutdown,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

pub type SealedMemtables = VecDeque<Arc<MemTable>>;

pub struct EngineInner {
    /// Active memtable that is being written to
    pub(crate) active_memtable: RwLock<Arc<MemTable>>,

    /// Sealed memtables that are waiting to be flushed, oldest first
    pub(crate) sealed_memtables: Mutex<SealedMemtables>,

    /// Gauge mirroring the sealed-queue depth, readable without the lock
    pub(crate) sealed_count: Arc<AtomicUsize>,

    /// Serializes flush tasks so runs enter L0 in seal order
    pub(crate) flush_lock: Mutex<()>,

    /// Level structure
    pub(crate) levels: Arc<RwLock<Levels>>,

    /// Compaction strategy
    pub(crate) strategy: Arc<dyn CompactionStrategy + Send + Sync>,

    /// Background worker pool shared by flush and compaction tasks
    pub(crate) pool: Arc<ThreadPool>,

    /// Append-only stream of background-work events
    pub(crate) metrics: Arc<MetricsCollector>,

    /// Runtime-mutable knobs, rewritten by the tuner
    pub(crate) tunables: Arc<Tunables>,

    /// Engine configuration
    pub config: Config,

    /// Engine-lifetime count of bytes written into memtables
    pub(crate) bytes_written: AtomicU64,

    /// Shutdown coordination: the one-way stop flag plus the release
    /// signal for writers stalled on the sealed queue
    pub(crate) shutdown: Arc<Shutdown>,

    pub(crate) tuner_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    pub(crate) fn create_new(config: Config) -> Self {
        let metrics = Arc::new(MetricsCollector::default());
        let tunables = Arc::new(Tunables::from_config(&config));

        let strategy: Arc<dyn CompactionStrategy + Send + Sync> = match config.compaction_style {
            CompactionStyle::Tiered => Arc::new(compaction::SizeTiered {
                files_per_tier: config.files_per_tier,
            }),
            CompactionStyle::Levelled => Arc::new(compaction::Levelled::new(
                config.max_l0_runs,
                config.fanout,
                config.level_count,
                tunables.clone(),
            )),
        };

        let pool = Arc::new(ThreadPool::new(config.max_background_jobs, metrics.clone()));

        Self {
            active_memtable: RwLock::new(Arc::new(MemTable::default())),
            sealed_memtables: Mutex::new(VecDeque::new()),
            sealed_count: Arc::new(AtomicUsize::new(0)),
            flush_lock: Mutex::new(()),
            levels: Arc::new(RwLock::new(Levels::create_new(config.level_count))),
            strategy,
            pool,
            metrics,
            tunables,
            config,
            bytes_written: AtomicU64::new(0),
            shutdown: Arc::new(Shutdown::default()),
            tuner_thread: Mutex::new(None),
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        log::debug!("Dropping EngineInner");

        log::trace!("Beginning shutdown, stopping background workers");
        self.shutdown.begin();

        self.pool.shutdown();

        if let Some(handle) = self
            .tuner_thread
            .lock()
            .expect("lock is poisoned")
            .take()
        {
            // The drop can run on the tuner thread itself, if its tick
            // held the last strong reference; it exits on the stop signal
            if handle.thread().id() == std::thread::current().id() {
                return;
            }

            if handle.join().is_err() {
                log::error!("tuner thread panicked during shutdown");
            }
        }
    }
}
