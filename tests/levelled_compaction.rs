use skred::{CompactionStyle, Config};
use std::time::Duration;
use test_log::test;

const TIMEOUT: Duration = Duration::from_secs(30);

#[test]
fn levelled_l0_merges_into_l1() -> skred::Result<()> {
    let engine = Config::new()
        .compaction_style(CompactionStyle::Levelled)
        .max_l0_runs(2)
        .fanout(3)
        .base_level_size(50)
        .memtable_bytes_threshold(50)
        .open()?;

    // 18 bytes per item; the third one crosses the 50 B threshold
    engine.put("key:01", "some_value_a")?;
    engine.put("key:02", "some_value_b")?;
    engine.put("key:03", "some_value_c")?;

    assert!(engine.wait_for_idle(TIMEOUT));
    assert_eq!(1, engine.l0_run_count());

    // 21 bytes per item; the third one flushes again, and |L0| = 2
    // triggers the L0 -> L1 merge
    engine.put("key:04", "another_value_d")?;
    engine.put("key:05", "another_value_e")?;
    engine.put("key:06", "another_value_f")?;

    assert!(engine.wait_for_idle(TIMEOUT));

    assert_eq!(0, engine.l0_run_count());
    assert_eq!(1, engine.level_run_counts()[1]);

    // The single L1 run covers the union of both flushed ranges
    let ranges = engine.level_run_ranges();
    let (first, last) = &ranges[1][0];
    assert_eq!(b"key:01", &**first);
    assert_eq!(b"key:06", &**last);

    assert_eq!(
        Some("some_value_a".as_bytes().into()),
        engine.get("key:01")?
    );
    assert_eq!(
        Some("another_value_f".as_bytes().into()),
        engine.get("key:06")?
    );

    engine.close();
    Ok(())
}

#[test]
fn levelled_levels_stay_disjoint_and_sorted() -> skred::Result<()> {
    let engine = Config::new()
        .compaction_style(CompactionStyle::Levelled)
        .max_l0_runs(2)
        .fanout(2)
        .base_level_size(256)
        .run_target_size(128)
        .memtable_bytes_threshold(64 * 1_024)
        .open()?;

    // Interleaved key ranges so L0 runs overlap heavily
    for round in 0u32..12 {
        for idx in 0u32..16 {
            let key = format!("key-{:05}", idx * 100 + round);
            engine.put(&key, format!("value-{round}-{idx}"))?;
        }

        engine.flush()?;
        assert!(engine.wait_for_idle(TIMEOUT));
    }

    // After settling, every level >= 1 must hold pairwise-disjoint runs
    // sorted by first key
    let ranges = engine.level_run_ranges();

    for level_ranges in ranges.iter().skip(1) {
        for pair in level_ranges.windows(2) {
            let (_, left_last) = &pair[0];
            let (right_first, _) = &pair[1];

            assert!(
                left_last < right_first,
                "overlapping or unsorted runs: {left_last:?} vs {right_first:?}",
            );
        }
    }

    // All 192 distinct keys survive, with their latest values
    let items = engine.scan()?;
    assert_eq!(192, items.len());

    assert_eq!(
        Some("value-0-0".as_bytes().into()),
        engine.get("key-00000")?
    );
    assert_eq!(
        Some("value-11-15".as_bytes().into()),
        engine.get("key-01511")?
    );

    engine.close();
    Ok(())
}

#[test]
fn levelled_updates_survive_deep_compaction() -> skred::Result<()> {
    let engine = Config::new()
        .compaction_style(CompactionStyle::Levelled)
        .max_l0_runs(2)
        .fanout(2)
        .base_level_size(512)
        .memtable_bytes_threshold(64 * 1_024)
        .open()?;

    for round in 0u32..8 {
        for idx in 0u32..8 {
            // The same 8 keys every round; only the last write counts
            let key = format!("key-{idx:02}");
            engine.put(&key, format!("round-{round}"))?;
        }

        engine.flush()?;
        assert!(engine.wait_for_idle(TIMEOUT));
    }

    engine.delete("key-03")?;
    engine.flush()?;
    assert!(engine.wait_for_idle(TIMEOUT));

    for idx in 0u32..8 {
        let key = format!("key-{idx:02}");

        if idx == 3 {
            assert_eq!(None, engine.get(&key)?);
        } else {
            assert_eq!(Some("round-7".as_bytes().into()), engine.get(&key)?);
        }
    }

    let items = engine.scan()?;
    assert_eq!(7, items.len());

    engine.close();
    Ok(())
}
