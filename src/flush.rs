use crate::{memtable::MemTable, run::SortedRun};

/// Converts a sealed memtable into a sorted run.
///
/// The memtable's level-0 chain is already in strict key order with one
/// entry per key, so the run is a straight copy of it.
///
/// Returns `None` if the memtable ended up empty (possible under
/// concurrent workloads when rotation raced a flush).
pub(crate) fn flush_to_run(memtable: &MemTable) -> Option<SortedRun> {
    log::debug!("flush: converting sealed memtable ({} B)", memtable.size());

    let run = SortedRun::new(memtable.iter().collect())?;

    log::debug!("flush: created run #{} ({} B)", run.id(), run.size());

    Some(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, ValueType};
    use test_log::test;

    #[test]
    fn test_flush_preserves_order_and_latest_value() {
        let memtable = MemTable::default();

        memtable.insert(Value::new(b"b".to_vec(), b"1".to_vec(), ValueType::Value));
        memtable.insert(Value::new(b"a".to_vec(), b"1".to_vec(), ValueType::Value));
        memtable.insert(Value::new(b"b".to_vec(), b"2".to_vec(), ValueType::Value));

        let run = flush_to_run(&memtable).expect("memtable is not empty");

        assert_eq!(2, run.len());
        assert_eq!(b"a", &**run.first_key());
        assert_eq!(b"b", &**run.last_key());
        assert_eq!(b"2", &*run.get("b").expect("should exist").value);
    }

    #[test]
    fn test_flush_empty_memtable() {
        let memtable = MemTable::default();
        assert!(flush_to_run(&memtable).is_none());
    }
}
