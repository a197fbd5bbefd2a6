use skred::tuner::{
    BatchState, ChangeScope, EngineSample, OpType, SystemScores, ThreadState, TunableOption,
    Tuner, TuningOp, MIN_BACKGROUND_JOBS,
};
use skred::{Config, MetricsCollector};
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

const MIB: u64 = 1_024 * 1_024;

fn fixture_tuner(config: &Config) -> Tuner {
    Tuner::new(config, Arc::new(MetricsCollector::default()))
}

fn peak_scores() -> SystemScores {
    SystemScores {
        memtable_speed: 100.0,
        flush_speed_avg: 50.0,
        flush_numbers: 10.0,
        ..Default::default()
    }
}

#[test]
fn memtable_overflow_halves_threads_and_grows_memtable() {
    let config = Config::new()
        .core_count(16)
        .memtable_bytes_threshold(8 * MIB);
    let tuner = fixture_tuner(&config);
    let max = peak_scores();

    // Writes at half the historical best, flushing at 0.4x its best, two
    // sealed memtables queued, eight workers running
    let score = SystemScores {
        memtable_speed: 50.0,
        flush_speed_avg: 20.0,
        immutable_number: 2.0,
        active_size_ratio: 0.6,
        ..Default::default()
    };

    let thread_state = tuner.locate_thread_state(&score, &max, 8);
    let batch_state = tuner.locate_batch_state(&score, &max, 8);

    assert_eq!(ThreadState::MemtableOverflow, thread_state);
    assert_eq!(BatchState::TinyMemtable, batch_state);

    let op = Tuner::vote(thread_state, batch_state);
    assert_eq!(OpType::Half, op.thread_op);
    assert_eq!(OpType::LinearIncrease, op.batch_op);

    let sample = EngineSample {
        current_background_jobs: 8,
        current_memtable_threshold: 8 * MIB,
        ..Default::default()
    };

    let changes = tuner.fill_change_list(op, &sample);

    let jobs = changes
        .iter()
        .find(|change| change.option == TunableOption::MaxBackgroundJobs)
        .expect("should emit a jobs change");
    assert_eq!(4, jobs.value);
    assert_eq!(ChangeScope::Engine, jobs.scope);

    let memtable = changes
        .iter()
        .find(|change| change.option == TunableOption::MemtableBytesThreshold)
        .expect("should emit a memtable change");
    assert_eq!(16 * MIB, memtable.value);
    assert_eq!(ChangeScope::Store, memtable.scope);
}

#[test]
fn emitted_values_respect_clamps() {
    let config = Config::new()
        .core_count(8)
        .memtable_bytes_threshold(8 * MIB)
        .memtable_size_range(2 * MIB, 32 * MIB);
    let tuner = fixture_tuner(&config);

    // Way out-of-range starting points
    let samples = [
        EngineSample {
            current_background_jobs: 2,
            current_memtable_threshold: 2 * MIB,
            ..Default::default()
        },
        EngineSample {
            current_background_jobs: 64,
            current_memtable_threshold: 512 * MIB,
            ..Default::default()
        },
    ];

    let ops = [
        TuningOp {
            batch_op: OpType::Half,
            thread_op: OpType::Half,
        },
        TuningOp {
            batch_op: OpType::LinearIncrease,
            thread_op: OpType::LinearIncrease,
        },
    ];

    for sample in &samples {
        for op in ops {
            for change in tuner.fill_change_list(op, sample) {
                match change.option {
                    TunableOption::MaxBackgroundJobs => {
                        assert!(change.value >= MIN_BACKGROUND_JOBS as u64);
                        assert!(change.value <= 8);
                    }
                    TunableOption::MemtableBytesThreshold | TunableOption::RunTargetSize => {
                        assert!(change.value >= 2 * MIB);
                        assert!(change.value <= 32 * MIB);
                    }
                    TunableOption::BaseLevelSize => {
                        assert!(change.value >= 2 * MIB);
                    }
                }
            }
        }
    }
}

#[test]
fn aimd_discipline_between_transitions() {
    let config = Config::new()
        .core_count(16)
        .memtable_bytes_threshold(4 * MIB)
        .memtable_size_range(MIB, 256 * MIB);
    let tuner = fixture_tuner(&config);

    // Additive increase: +2 workers per step
    let mut jobs = 4u64;
    for _ in 0..3 {
        let sample = EngineSample {
            current_background_jobs: jobs as usize,
            current_memtable_threshold: 4 * MIB,
            ..Default::default()
        };

        let changes = tuner.fill_change_list(
            TuningOp {
                batch_op: OpType::Keep,
                thread_op: OpType::LinearIncrease,
            },
            &sample,
        );

        let change = changes
            .iter()
            .find(|change| change.option == TunableOption::MaxBackgroundJobs)
            .expect("should emit a jobs change");

        assert_eq!(jobs + 2, change.value);
        jobs = change.value;
    }

    // Multiplicative decrease: halving per step
    for _ in 0..2 {
        let sample = EngineSample {
            current_background_jobs: jobs as usize,
            current_memtable_threshold: 4 * MIB,
            ..Default::default()
        };

        let changes = tuner.fill_change_list(
            TuningOp {
                batch_op: OpType::Keep,
                thread_op: OpType::Half,
            },
            &sample,
        );

        let change = changes
            .iter()
            .find(|change| change.option == TunableOption::MaxBackgroundJobs)
            .expect("should emit a jobs change");

        assert_eq!((jobs / 2).max(MIN_BACKGROUND_JOBS as u64), change.value);
        jobs = change.value;
    }

    // Memtable: additive by the configured default, halving down
    let sample = EngineSample {
        current_background_jobs: 4,
        current_memtable_threshold: 12 * MIB,
        ..Default::default()
    };

    let grow = tuner.fill_change_list(
        TuningOp {
            batch_op: OpType::LinearIncrease,
            thread_op: OpType::Keep,
        },
        &sample,
    );
    let change = grow
        .iter()
        .find(|change| change.option == TunableOption::MemtableBytesThreshold)
        .expect("should emit a memtable change");
    assert_eq!(16 * MIB, change.value);

    let shrink = tuner.fill_change_list(
        TuningOp {
            batch_op: OpType::Half,
            thread_op: OpType::Keep,
        },
        &sample,
    );
    let change = shrink
        .iter()
        .find(|change| change.option == TunableOption::MemtableBytesThreshold)
        .expect("should emit a memtable change");
    assert_eq!(6 * MIB, change.value);
}

#[test]
fn engine_applies_change_points() -> skred::Result<()> {
    use skred::tuner::ChangePoint;

    let engine = Config::new().core_count(8).open()?;

    engine.apply_change_points(&[
        ChangePoint {
            option: TunableOption::MemtableBytesThreshold,
            value: 2 * MIB,
            scope: ChangeScope::Store,
        },
        ChangePoint {
            option: TunableOption::MaxBackgroundJobs,
            value: 6,
            scope: ChangeScope::Engine,
        },
    ]);

    assert_eq!(2 * MIB, engine.memtable_bytes_threshold());
    assert_eq!(6, engine.background_worker_count());

    engine.close();
    Ok(())
}

#[test]
fn live_tuner_keeps_values_in_bounds() -> skred::Result<()> {
    let engine = Config::new()
        .tuner_gap_seconds(1)
        .core_count(8)
        .memtable_bytes_threshold(4 * MIB)
        .memtable_size_range(MIB, 64 * MIB)
        .open()?;

    for idx in 0u32..5_000 {
        engine.put(format!("key-{idx:06}"), "some_payload_bytes")?;
    }

    // Let a few ticks pass while the engine sits idle
    std::thread::sleep(Duration::from_millis(2_500));

    let threshold = engine.memtable_bytes_threshold();
    assert!(threshold >= MIB);
    assert!(threshold <= 64 * MIB);

    let jobs = engine.background_worker_count();
    assert!(jobs >= MIN_BACKGROUND_JOBS);
    assert!(jobs <= 8);

    // The engine keeps serving reads and writes under a live tuner
    engine.put("after", "tuning")?;
    assert_eq!(Some("tuning".as_bytes().into()), engine.get("after")?);

    engine.close();
    Ok(())
}
