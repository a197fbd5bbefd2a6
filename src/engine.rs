use crate::{
    compaction::worker::{do_compaction, Options as CompactionOptions},
    config::{CompactionStyle, Config},
    engine_inner::EngineInner,
    error::{Error, Result},
    flush::flush_to_run,
    memtable::MemTable,
    merge::{BoxedIterator, MergeIterator},
    metrics::{unix_timestamp, FlushMetrics, MetricsCollector, WorkerKind},
    run::RunStream,
    tuner::{ChangePoint, EngineSample, TunableOption, Tuner},
    UserKey, UserValue, Value, ValueType,
};
use std::{
    sync::{
        atomic::Ordering,
        Arc,
    },
    time::{Duration, Instant},
};

fn ignore_tombstone_value(item: Value) -> Option<Value> {
    if item.is_tombstone() {
        None
    } else {
        Some(item)
    }
}

/// A log-structured merge storage engine.
///
/// Writes land in an in-memory write buffer (a concurrent skiplist) which
/// is sealed and flushed to a L0 run once it crosses a size threshold.
/// Background workers merge runs down the level hierarchy using the
/// configured compaction strategy, and an optional adaptive tuner reshapes
/// the memtable size and the worker count from observed performance.
///
/// The handle is cheap to clone and can be shared across threads.
///
/// # Examples
///
/// ```
/// use skred::Config;
///
/// let engine = Config::new().open()?;
///
/// engine.put("my_key", "my_value")?;
///
/// let item = engine.get("my_key")?;
/// assert_eq!(Some("my_value".as_bytes().into()), item);
///
/// engine.delete("my_key")?;
/// assert_eq!(None, engine.get("my_key")?);
///
/// engine.close();
/// #
/// # Ok::<(), skred::Error>(())
/// ```
#[derive(Clone)]
pub struct Engine(pub(crate) Arc<EngineInner>);

impl std::ops::Deref for Engine {
    type Target = EngineInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Engine {
    /// Starts an engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine cannot be started.
    pub fn open(config: Config) -> Result<Self> {
        log::debug!(
            "Opening engine ({:?} compaction, {} B memtable threshold)",
            config.compaction_style,
            config.memtable_bytes_threshold,
        );

        let engine = Self(Arc::new(EngineInner::create_new(config)));

        if !engine.config.tuner_gap.is_zero() {
            let handle = spawn_tuner_thread(&engine);
            *engine.tuner_thread.lock().expect("lock is poisoned") = Some(handle);
        }

        Ok(engine)
    }

    fn check_stopped(&self) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            Err(Error::Stopped)
        } else {
            Ok(())
        }
    }

    /// Inserts a key-value pair into the engine.
    ///
    /// If the key already exists, the value will be overwritten.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine has been closed, or if the write
    /// stalled for longer than the configured timeout.
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) -> Result<()> {
        self.append_entry(Value::new(key.as_ref(), value.as_ref(), ValueType::Value))
    }

    /// Removes a key from the engine by writing a tombstone.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine has been closed, or if the write
    /// stalled for longer than the configured timeout.
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<()> {
        self.append_entry(Value::new_tombstone(key.as_ref()))
    }

    /// Retrieves an item from the engine.
    ///
    /// The search order is: active memtable, sealed memtables (newest
    /// first), then the runs level by level. The first version found wins;
    /// a tombstone reads as "not found".
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine has been closed.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<UserValue>> {
        self.check_stopped()?;

        Ok(self
            .get_internal_entry(key.as_ref())
            .and_then(ignore_tombstone_value)
            .map(|item| item.value))
    }

    /// Returns `true` if the engine contains the specified key.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine has been closed.
    pub fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> Result<bool> {
        self.get(key).map(|item| item.is_some())
    }

    fn get_internal_entry(&self, key: &[u8]) -> Option<Value> {
        {
            let memtable = self.active_memtable.read().expect("lock is poisoned");

            if let Some(item) = memtable.get(key) {
                return Some(item);
            }
        }

        // Now look in the sealed memtables, newest first
        let sealed = {
            let queue = self.sealed_memtables.lock().expect("lock is poisoned");
            queue.iter().rev().cloned().collect::<Vec<_>>()
        };

        for memtable in sealed {
            if let Some(item) = memtable.get(key) {
                return Some(item);
            }
        }

        // Now look in the runs
        let levels = self.levels.read().expect("lock is poisoned");

        for (level_index, level) in levels.raw_view().iter().enumerate() {
            if level.is_empty() {
                continue;
            }

            if level_index == 0 || self.config.compaction_style == CompactionStyle::Tiered {
                // Age-ordered level; runs may overlap, so probe newest
                // first and stop at the first hit
                for run in level.iter() {
                    if !run.check_key_range_overlap(key, key) {
                        continue;
                    }

                    if let Some(item) = run.get(key) {
                        return Some(item);
                    }
                }
            } else {
                // Key-ordered level with disjoint ranges; binary search by
                // last key and probe the single candidate run
                let index = level.partition_point(|run| run.last_key().as_ref() < key);

                if let Some(run) = level.get(index) {
                    if run.first_key().as_ref() <= key {
                        if let Some(item) = run.get(key) {
                            return Some(item);
                        }
                    }
                }
            }
        }

        None
    }

    fn append_entry(&self, item: Value) -> Result<()> {
        self.check_stopped()?;
        self.wait_for_queue_room()?;

        let item_size = item.size() as u64;

        let size_after = {
            let memtable = self.active_memtable.read().expect("lock is poisoned");
            let (_, size_after) = memtable.insert(item);
            size_after
        };

        self.bytes_written.fetch_add(item_size, Ordering::Relaxed);

        if size_after >= self.tunables.memtable_bytes_threshold() {
            self.rotate_memtable(false);
        }

        Ok(())
    }

    /// Blocks while the sealed-memtable queue exceeds its soft limit
    fn wait_for_queue_room(&self) -> Result<()> {
        let soft_limit = self.config.immutable_queue_soft_limit;
        let timeout = self.config.write_stall_timeout;

        let mut queue = self.sealed_memtables.lock().expect("lock is poisoned");

        if queue.len() < soft_limit {
            return Ok(());
        }

        log::warn!("write stall: sealed memtable queue is over its soft limit");
        let start = Instant::now();

        while queue.len() >= soft_limit {
            if self.shutdown.is_shutting_down() {
                return Err(Error::Stopped);
            }

            let waited = start.elapsed();

            if waited >= timeout {
                return Err(Error::WriteStall { waited });
            }

            queue = self
                .shutdown
                .park_writer(queue, Duration::from_millis(10));
        }

        Ok(())
    }

    /// Seals the active memtable, queues it for flushing and installs a
    /// fresh one.
    ///
    /// Without `force`, rotation is skipped when another writer already
    /// rotated (the fresh memtable is below the threshold again).
    pub(crate) fn rotate_memtable(&self, force: bool) -> Option<Arc<MemTable>> {
        let sealed = {
            let mut active = self.active_memtable.write().expect("lock is poisoned");

            if active.is_empty() {
                return None;
            }

            if !force && active.size() < self.tunables.memtable_bytes_threshold() {
                return None;
            }

            std::mem::replace(&mut *active, Arc::new(MemTable::default()))
        };

        log::trace!("rotate: sealed memtable with {} B", sealed.size());

        {
            let mut queue = self.sealed_memtables.lock().expect("lock is poisoned");
            queue.push_back(sealed.clone());
            self.sealed_count.store(queue.len(), Ordering::Release);
        }

        self.submit_flush();

        Some(sealed)
    }

    fn submit_flush(&self) {
        let engine = self.clone();

        let submitted = self.pool.submit(
            WorkerKind::Flush,
            Box::new(move || engine.run_flush_task()),
        );

        if !submitted {
            log::warn!("flush task rejected: pool is shut down");
        }
    }

    /// Flushes the oldest sealed memtable into a L0 run and registers it.
    ///
    /// Tasks are serialized by the flush lock so runs enter L0 in seal
    /// order, preserving per-key recency across the memtable -> L0
    /// transition.
    fn run_flush_task(&self) {
        let _guard = self.flush_lock.lock().expect("lock is poisoned");

        let Some(memtable) = ({
            let queue = self.sealed_memtables.lock().expect("lock is poisoned");
            queue.front().cloned()
        }) else {
            return;
        };

        let start_time = unix_timestamp();
        let start = Instant::now();

        if let Some(run) = flush_to_run(&memtable).map(Arc::new) {
            let total_bytes = run.size();

            let l0_run_count = {
                let mut levels = self.levels.write().expect("lock is poisoned");
                self.strategy.add_run(&mut levels, run);
                levels.first_level_run_count()
            };

            let elapsed_secs = start.elapsed().as_secs_f64().max(f64::EPSILON);

            self.metrics.record_flush(FlushMetrics {
                total_bytes,
                write_bandwidth: total_bytes as f64 / elapsed_secs,
                start_time,
                l0_run_count,
            });

            log::debug!("flush: registered run, L0 now has {l0_run_count} runs");
        }

        {
            let mut queue = self.sealed_memtables.lock().expect("lock is poisoned");

            if let Some(position) = queue.iter().position(|other| Arc::ptr_eq(other, &memtable)) {
                queue.remove(position);
            }

            self.sealed_count.store(queue.len(), Ordering::Release);
        }

        // A slot freed up; unblock stalled writers
        self.shutdown.release_writers();

        let should_compact = {
            let levels = self.levels.read().expect("lock is poisoned");
            self.strategy.should_compact(&levels)
        };

        if should_compact {
            self.submit_compaction();
        }
    }

    fn submit_compaction(&self) {
        let engine = self.clone();

        let submitted = self.pool.submit(
            WorkerKind::Compaction,
            Box::new(move || {
                let options = CompactionOptions {
                    levels: engine.levels.clone(),
                    strategy: engine.strategy.clone(),
                    shutdown: engine.shutdown.clone(),
                    metrics: engine.metrics.clone(),
                    sealed_queue_len: engine.sealed_count.clone(),
                };

                do_compaction(&options);
            }),
        );

        if !submitted {
            log::warn!("compaction task rejected: pool is shut down");
        }
    }

    /// Forces a memtable rollover, queueing the sealed memtable for a
    /// background flush.
    ///
    /// Does nothing if the memtable is empty.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine has been closed.
    pub fn flush(&self) -> Result<()> {
        self.check_stopped()?;
        self.rotate_memtable(true);
        Ok(())
    }

    /// Returns a point-in-time snapshot of all live key-value pairs, in
    /// key order.
    ///
    /// Old versions and deleted keys are resolved away through a k-way
    /// merge over the memtables and all runs.
    ///
    /// ###### Caution
    ///
    /// This materializes the whole keyspace: O(n) complexity!
    ///
    /// # Errors
    ///
    /// Will return `Err` if the engine has been closed.
    pub fn scan(&self) -> Result<Vec<(UserKey, UserValue)>> {
        self.check_stopped()?;

        let mut iters: Vec<BoxedIterator<'static>> = Vec::new();

        {
            let memtable = self.active_memtable.read().expect("lock is poisoned");
            iters.push(Box::new(memtable.iter().collect::<Vec<_>>().into_iter()));
        }

        {
            let queue = self.sealed_memtables.lock().expect("lock is poisoned");

            for memtable in queue.iter().rev() {
                iters.push(Box::new(memtable.iter().collect::<Vec<_>>().into_iter()));
            }
        }

        {
            let levels = self.levels.read().expect("lock is poisoned");

            for level in levels.raw_view() {
                for run in level.iter() {
                    iters.push(Box::new(RunStream::new(run.clone())));
                }
            }
        }

        let items = MergeIterator::new(iters)
            .evict_tombstones(true)
            .map(|item| (item.key, item.value))
            .collect();

        Ok(items)
    }

    /// Amount of runs in the first level
    #[must_use]
    pub fn l0_run_count(&self) -> usize {
        self.levels
            .read()
            .expect("lock is poisoned")
            .first_level_run_count()
    }

    /// Amount of runs across all levels
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.levels.read().expect("lock is poisoned").len()
    }

    /// Run counts per level, top to bottom
    #[must_use]
    pub fn level_run_counts(&self) -> Vec<usize> {
        self.levels
            .read()
            .expect("lock is poisoned")
            .raw_view()
            .iter()
            .map(|level| level.len())
            .collect()
    }

    /// Key ranges of all runs, per level, top to bottom
    #[doc(hidden)]
    #[must_use]
    pub fn level_run_ranges(&self) -> Vec<Vec<(UserKey, UserKey)>> {
        self.levels
            .read()
            .expect("lock is poisoned")
            .raw_view()
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|run| (run.first_key().clone(), run.last_key().clone()))
                    .collect()
            })
            .collect()
    }

    /// Approximate byte size of the active memtable
    #[must_use]
    pub fn approximate_memtable_size(&self) -> u64 {
        self.active_memtable
            .read()
            .expect("lock is poisoned")
            .size()
    }

    /// Amount of sealed memtables waiting to flush
    #[must_use]
    pub fn sealed_memtable_count(&self) -> usize {
        self.sealed_count.load(Ordering::Acquire)
    }

    /// Returns `true` if some runs are currently being compacted
    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.levels.read().expect("lock is poisoned").is_compacting()
    }

    /// Handle to the engine's metrics stream
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.0.metrics.clone()
    }

    /// Blocks until all queued background work has settled, or the timeout
    /// elapsed.
    ///
    /// Returns `true` if the engine became idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        loop {
            let idle = self.pool.pending_tasks() == 0
                && self.sealed_count.load(Ordering::Acquire) == 0
                && !self.is_compacting();

            if idle {
                return true;
            }

            if start.elapsed() >= timeout {
                return false;
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Applies configuration changes emitted by the tuner.
    ///
    /// Sizing changes take effect before the next write; worker-count
    /// changes resize the background pool.
    pub fn apply_change_points(&self, change_list: &[ChangePoint]) {
        for change in change_list {
            match change.option {
                TunableOption::MemtableBytesThreshold => {
                    self.tunables
                        .memtable_bytes_threshold
                        .store(change.value, Ordering::Release);
                }
                TunableOption::RunTargetSize => {
                    self.tunables
                        .run_target_size
                        .store(change.value, Ordering::Release);
                }
                TunableOption::BaseLevelSize => {
                    self.tunables
                        .base_level_size
                        .store(change.value, Ordering::Release);
                }
                TunableOption::MaxBackgroundJobs => {
                    let target = usize::try_from(change.value)
                        .unwrap_or(crate::tuner::MIN_BACKGROUND_JOBS);
                    self.pool.set_worker_count(target);
                }
            }

            log::debug!("tuner: applied change point {change:?}");
        }
    }

    /// Current memtable rollover threshold (the tuner may move it)
    #[must_use]
    pub fn memtable_bytes_threshold(&self) -> u64 {
        self.tunables.memtable_bytes_threshold()
    }

    /// Current background-worker count (the tuner may move it)
    #[must_use]
    pub fn background_worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub(crate) fn tuner_sample(&self) -> EngineSample {
        let active_memtable_bytes = self.approximate_memtable_size();

        let (sealed_memtable_bytes, sealed_count) = {
            let queue = self.sealed_memtables.lock().expect("lock is poisoned");
            (
                queue.iter().map(|memtable| memtable.size()).sum(),
                queue.len(),
            )
        };

        let (l0_run_count, pending_compaction_bytes) = {
            let levels = self.levels.read().expect("lock is poisoned");
            (
                levels.first_level_run_count(),
                self.strategy.pending_bytes(&levels),
            )
        };

        EngineSample {
            active_memtable_bytes,
            sealed_memtable_bytes,
            sealed_count,
            l0_run_count,
            pending_compaction_bytes,
            total_bytes_written: self.bytes_written.load(Ordering::Relaxed),
            current_background_jobs: self.pool.worker_count(),
            current_memtable_threshold: self.tunables.memtable_bytes_threshold(),
        }
    }

    /// Gracefully shuts the engine down.
    ///
    /// Background workers drain their pending tasks, then exit. After
    /// close begins, every user operation fails with
    /// [`Error::Stopped`]. Idempotent.
    pub fn close(&self) {
        log::debug!("Closing engine");

        // Also wakes stalled writers so they fail fast
        self.shutdown.begin();

        self.pool.shutdown();

        if let Some(handle) = self
            .tuner_thread
            .lock()
            .expect("lock is poisoned")
            .take()
        {
            if handle.join().is_err() {
                log::error!("tuner thread panicked during shutdown");
            }
        }
    }
}


/// Spawns the periodic tuner thread.
///
/// The thread holds only a weak reference to the engine, so dropping the
/// last user handle ends the loop even without an explicit close.
fn spawn_tuner_thread(engine: &Engine) -> std::thread::JoinHandle<()> {
    let weak = Arc::downgrade(&engine.0);
    let shutdown = engine.shutdown.clone();
    let gap = engine.config.tuner_gap;
    let mut tuner = Tuner::new(&engine.config, engine.metrics.clone());

    std::thread::Builder::new()
        .name("skred:tuner".into())
        .spawn(move || loop {
            // Sleep in small slices so shutdown stays prompt
            let mut slept = Duration::ZERO;

            while slept < gap {
                if shutdown.is_shutting_down() {
                    log::trace!("tuner: exiting because engine is closing");
                    return;
                }

                let slice = (gap - slept).min(Duration::from_millis(50));
                std::thread::sleep(slice);
                slept += slice;
            }

            if shutdown.is_shutting_down() {
                return;
            }

            let Some(inner) = weak.upgrade() else {
                log::trace!("tuner: exiting because engine is dropping");
                return;
            };

            let engine = Engine(inner);
            let sample = engine.tuner_sample();
            let (score, change_list) = tuner.tick(&sample);

            log::trace!("tuner: scored {score:?}");

            engine.apply_change_points(&change_list);
        })
        .expect("should spawn thread")
}
