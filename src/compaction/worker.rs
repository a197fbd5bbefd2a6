use super::{Choice, CompactionStrategy, Input as CompactionPayload};
use crate::{
    levels::Levels,
    merge::MergeIterator,
    metrics::{CompactionMetrics, IoLatency, MetricsCollector},
    run::SortedRun,
    shutdown::Shutdown,
    Value,
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::Instant,
};

/// Compaction options
pub struct Options {
    /// Level structure.
    pub levels: Arc<RwLock<Levels>>,

    /// Compaction strategy.
    pub strategy: Arc<dyn CompactionStrategy + Send + Sync>,

    /// Compaction may take a while; engine shutdown interrupts the
    /// compaction and kills the worker.
    pub shutdown: Arc<Shutdown>,

    /// Metrics sink.
    pub metrics: Arc<MetricsCollector>,

    /// Gauge mirroring the sealed-memtable queue depth.
    pub sealed_queue_len: Arc<AtomicUsize>,
}

/// Runs one unit of compaction work, cascading as long as the strategy
/// finds triggered levels.
///
/// Inputs are hidden while the merge runs outside the levels lock; the
/// output is installed atomically, so a merge that aborts mid-way during
/// shutdown leaves all inputs intact.
pub fn do_compaction(opts: &Options) {
    loop {
        if opts.shutdown.is_shutting_down() {
            log::debug!("compactor: stopping before compaction because engine is closing");
            return;
        }

        let Some(job) = pick_job(opts) else {
            log::trace!("compactor chose to do nothing");
            return;
        };

        if !merge_runs(opts, job) {
            return;
        }

        // Re-check triggers; tiered merges especially tend to cascade
    }
}

struct Job {
    payload: CompactionPayload,
    inputs: Vec<Arc<SortedRun>>,
    source_bytes: u64,
    pending_bytes: u64,
    dest_is_bottom: bool,
}

fn pick_job(opts: &Options) -> Option<Job> {
    log::trace!("compactor: acquiring levels write lock");
    let mut levels = opts.levels.write().expect("lock is poisoned");

    log::trace!("compactor: consulting compaction strategy");
    let Choice::Merge(payload) = opts.strategy.choose(&levels) else {
        return None;
    };

    let inputs = payload
        .run_ids
        .iter()
        .map(|&id| levels.get_run(id))
        .collect::<Option<Vec<_>>>()?;

    let source_ids = levels.raw_view()[payload.source_level]
        .iter()
        .map(|run| run.id())
        .collect::<HashSet<_>>();

    let source_bytes = inputs
        .iter()
        .filter(|run| source_ids.contains(&run.id()))
        .map(|run| run.size())
        .sum();

    let pending_bytes = opts.strategy.pending_bytes(&levels);
    let dest_is_bottom = payload.dest_level == levels.last_level_index();

    levels.hide_runs(&payload.run_ids);

    Some(Job {
        payload,
        inputs,
        source_bytes,
        pending_bytes,
        dest_is_bottom,
    })
}

/// Merges the job's inputs and installs the result; returns `false` if the
/// merge was aborted by the stop signal
fn merge_runs(opts: &Options, job: Job) -> bool {
    let Job {
        payload,
        inputs,
        source_bytes,
        pending_bytes,
        dest_is_bottom,
    } = job;

    log::debug!(
        "compactor: chosen {} runs to compact into level {}",
        payload.run_ids.len(),
        payload.dest_level,
    );

    let input_bytes = inputs.iter().map(|run| run.size()).sum::<u64>();
    let input_records = inputs.iter().map(|run| run.len()).sum::<usize>();

    let start = Instant::now();

    // NOTE: Only evict tombstones when writing into the last level,
    // that way we don't resurrect data beneath the tombstone
    let merge_iter = MergeIterator::from_runs(&inputs).evict_tombstones(dest_is_bottom);

    let prepare_nanos = nanos_since(start);

    let write_start = Instant::now();

    let mut outputs: Vec<Vec<Value>> = vec![];
    let mut current: Vec<Value> = vec![];
    let mut current_bytes: u64 = 0;

    for (idx, item) in merge_iter.enumerate() {
        if idx % 100_000 == 0 && opts.shutdown.is_shutting_down() {
            log::debug!("compactor: stopping amidst compaction because engine is closing");

            let mut levels = opts.levels.write().expect("lock is poisoned");
            levels.show_runs(&payload.run_ids);

            return false;
        }

        current_bytes += item.size() as u64;
        current.push(item);

        if current_bytes >= payload.target_size {
            outputs.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
    }

    if !current.is_empty() {
        outputs.push(current);
    }

    let write_nanos = nanos_since(write_start);

    let output_bytes = outputs
        .iter()
        .flatten()
        .map(|item| item.size() as u64)
        .sum::<u64>();
    let output_records = outputs.iter().map(Vec::len).sum::<usize>();

    let mut created_runs = 0;

    {
        log::trace!("compactor: acquiring levels write lock to install output");
        let mut levels = opts.levels.write().expect("lock is poisoned");

        for &id in &payload.run_ids {
            levels.remove(id);
        }

        for items in outputs {
            // A merge may consume its entire input (e.g. only tombstones
            // reaching the bottom level); nothing to install then
            if let Some(run) = SortedRun::new(items) {
                let run = Arc::new(run);

                if payload.dest_key_ordered {
                    levels.insert_into_level_key_ordered(payload.dest_level, run);
                } else {
                    levels.insert_into_level(payload.dest_level, run);
                }

                created_runs += 1;
            }
        }

        levels.show_runs(&payload.run_ids);
    }

    let elapsed_secs = start.elapsed().as_secs_f64().max(f64::EPSILON);

    opts.metrics.record_compaction(CompactionMetrics {
        input_level: payload.source_level,
        output_level: payload.dest_level,
        drop_ratio: if input_records == 0 {
            0.0
        } else {
            (input_records - output_records) as f64 / input_records as f64
        },
        read_bandwidth: input_bytes as f64 / elapsed_secs,
        write_bandwidth: output_bytes as f64 / elapsed_secs,
        write_amplification: if source_bytes == 0 {
            0.0
        } else {
            output_bytes as f64 / source_bytes as f64
        },
        total_bytes: input_bytes + output_bytes,
        pending_compaction_bytes: pending_bytes,
        immutable_queue_len: opts.sealed_queue_len.load(Ordering::Relaxed),
        io: IoLatency {
            prepare_nanos,
            file_write_nanos: write_nanos,
            range_sync_nanos: 0,
            fsync_nanos: 0,
        },
    });

    log::debug!(
        "compactor: compacted in {}ms ({created_runs} runs created)",
        start.elapsed().as_millis(),
    );

    true
}

fn nanos_since(instant: Instant) -> u64 {
    u64::try_from(instant.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
