//! Engine-level compaction: registry bookkeeping and read correctness
//! after merges.

#[cfg(test)]
mod tests {
    use crate::compaction::merge::write_over_older;
    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineConfig, SSTABLE_DIR};
    use crate::sstable::SSTable;
    use tempfile::TempDir;

    fn flush_one(engine: &Engine, key: &str, value: &str) {
        engine.insert(key, value).unwrap();
        assert!(engine.flush().unwrap());
    }

    #[test]
    fn test_no_compaction_at_threshold() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), eager_compaction_config()).unwrap();
        flush_one(&engine, "a", "1");
        flush_one(&engine, "b", "2");

        assert_eq!(engine.compact_if_needed().unwrap(), 0);
        assert_eq!(engine.stats().unwrap().sstable_count, 2);
    }

    /// # Scenario
    /// Three small tables with a threshold of two.
    ///
    /// # Expected behavior
    /// One merge: `sstable1.txt` is gone, `sstable2.txt` holds both inputs,
    /// and the registry matches the directory.
    #[test]
    fn test_compaction_updates_registry() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), eager_compaction_config()).unwrap();
        flush_one(&engine, "a", "1");
        flush_one(&engine, "b", "2");
        flush_one(&engine, "c", "3");

        assert_eq!(engine.compact_if_needed().unwrap(), 1);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.sstable_names, vec!["sstable3.txt", "sstable2.txt"]);
        assert_eq!(stats.bucket_sizes, [2, 0, 0, 0]);
        assert_eq!(sstable_files(tmp.path()), vec!["sstable2.txt", "sstable3.txt"]);

        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            assert_eq!(engine.read(k).unwrap().as_deref(), Some(v));
        }
    }

    #[test]
    fn test_delete_survives_compaction() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), eager_compaction_config()).unwrap();

        flush_one(&engine, "a", "1");
        engine.delete("a").unwrap();
        engine.flush().unwrap();
        flush_one(&engine, "b", "2");

        assert_eq!(engine.compact_if_needed().unwrap(), 1);

        assert_eq!(engine.read("a").unwrap(), None);
        assert_eq!(engine.read("b").unwrap().as_deref(), Some("2"));
        let merged = std::fs::read_to_string(tmp.path().join("sstable/sstable2.txt")).unwrap();
        assert_eq!(merged, "");
    }

    #[test]
    fn test_overwrite_survives_compaction() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), eager_compaction_config()).unwrap();

        flush_one(&engine, "k", "v1");
        flush_one(&engine, "k", "v2");
        flush_one(&engine, "other", "x");
        engine.compact_if_needed().unwrap();

        assert_eq!(engine.read("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_compacted_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open(tmp.path(), eager_compaction_config()).unwrap();
            flush_one(&engine, "a", "1");
            flush_one(&engine, "b", "2");
            flush_one(&engine, "c", "3");
            engine.compact_if_needed().unwrap();
            engine.close().unwrap();
        }

        let engine = reopen(tmp.path(), eager_compaction_config());
        let stats = engine.stats().unwrap();
        assert_eq!(stats.sstable_names, vec!["sstable3.txt", "sstable2.txt"]);
        assert_eq!(stats.bucket_sizes[0], 2);

        flush_one(&engine, "d", "4");
        assert_eq!(engine.stats().unwrap().sstable_names[0], "sstable4.txt");
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            assert_eq!(engine.read(k).unwrap().as_deref(), Some(v));
        }
    }

    #[test]
    fn test_repeated_passes_shrink_bucket() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), eager_compaction_config()).unwrap();
        for i in 0..6 {
            flush_one(&engine, &format!("k{i}"), &format!("v{i}"));
        }

        let mut merges = 0;
        loop {
            let n = engine.compact_if_needed().unwrap();
            if n == 0 {
                break;
            }
            merges += n;
        }

        assert_eq!(merges, 4);
        assert_eq!(engine.stats().unwrap().sstable_count, 2);
        for i in 0..6 {
            assert_eq!(engine.read(&format!("k{i}")).unwrap(), Some(format!("v{i}")));
        }
    }

    /// # Scenario
    /// `victim` lives in a table large enough for bucket 1. It is deleted,
    /// the tombstone is flushed to bucket 0, and two more small tables push
    /// bucket 0 over a threshold of two.
    ///
    /// # Expected behavior
    /// The bucket-0 merge keeps the tombstone, so `victim` stays deleted
    /// before and after a reopen.
    #[test]
    fn test_delete_survives_compaction_over_older_bucket() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), eager_compaction_config()).unwrap();

        let value = "x".repeat(100);
        for i in 0..350 {
            engine.insert(&format!("fill{i:05}"), &value).unwrap();
        }
        engine.insert("victim", "alive").unwrap();
        assert!(engine.flush().unwrap());
        assert_eq!(engine.stats().unwrap().bucket_sizes, [0, 1, 0, 0]);

        engine.delete("victim").unwrap();
        assert!(engine.flush().unwrap());
        flush_one(&engine, "a", "1");
        flush_one(&engine, "b", "2");
        assert_eq!(engine.stats().unwrap().bucket_sizes, [3, 1, 0, 0]);

        assert_eq!(engine.compact_if_needed().unwrap(), 1);
        assert_eq!(engine.stats().unwrap().bucket_sizes, [2, 1, 0, 0]);
        assert_eq!(engine.read("victim").unwrap(), None);
        assert_eq!(engine.read("a").unwrap().as_deref(), Some("1"));

        drop(engine);
        let engine = reopen(tmp.path(), eager_compaction_config());
        assert_eq!(engine.read("victim").unwrap(), None);
        assert_eq!(
            engine.read("fill00000").unwrap().as_deref(),
            Some(value.as_str())
        );
    }

    /// # Scenario
    /// A merge of `k=live` with a newer tombstone for `k` is interrupted
    /// right after the merged data replaced the older file.
    ///
    /// # Expected behavior
    /// Recovery loads both files and `k` is still deleted.
    #[test]
    fn test_interrupted_merge_keeps_delete() {
        let tmp = TempDir::new().unwrap();
        let config = eager_compaction_config();
        {
            let engine = Engine::open(tmp.path(), config.clone()).unwrap();
            flush_one(&engine, "k", "live");
            engine.delete("k").unwrap();
            assert!(engine.flush().unwrap());
        }

        let dir = tmp.path().join(SSTABLE_DIR);
        let options = config.sstable_options();
        let older = SSTable::open(dir.join("sstable1.txt"), options).unwrap();
        let newer = SSTable::open(dir.join("sstable2.txt"), options).unwrap();
        write_over_older(&older, &newer, &[], options).unwrap();
        drop((older, newer));

        let engine = reopen(tmp.path(), config);
        assert_eq!(engine.stats().unwrap().sstable_count, 2);
        assert_eq!(engine.read("k").unwrap(), None);
    }

    /// # Scenario
    /// A compaction pass is in progress (its pass lock is held).
    ///
    /// # Expected behavior
    /// Writes, flushes, and reads all complete without waiting for it.
    #[test]
    fn test_writes_and_reads_proceed_during_pass() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(
            tmp.path(),
            EngineConfig {
                write_buffer_size: 64,
                ..eager_compaction_config()
            },
        )
        .unwrap();
        flush_one(&engine, "a", "1");

        let _pass = engine.lock_pass().unwrap();
        let mut flushed = false;
        for i in 0..20 {
            flushed |= engine.insert(&format!("key{i:02}"), "value").unwrap();
        }
        assert!(flushed);
        assert_eq!(engine.read("a").unwrap().as_deref(), Some("1"));
        assert_eq!(engine.read("key19").unwrap().as_deref(), Some("value"));
        assert!(engine.stats().unwrap().sstable_count > 1);
    }
}
