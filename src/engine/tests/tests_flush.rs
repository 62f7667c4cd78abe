//! Flush tests: automatic flush at the write-buffer limit, explicit
//! [`Engine::flush`], and reads that fall through to SSTables.

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::engine::tests::helpers::*;
    use tempfile::TempDir;

    /// # Scenario
    /// Inserting fixed-size records into a 64-byte write buffer.
    ///
    /// # Expected behavior
    /// The insert that brings the counter to 64 or more flushes: the memtable
    /// and the WAL are emptied and `sstable1.txt` holds the records.
    #[test]
    fn test_flush_triggers_at_buffer_limit() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_buffer_config()).unwrap();

        // "kNN" + "vNN" = 6 bytes each: ten fit, the eleventh reaches 66.
        for i in 0..10 {
            assert!(!engine.insert(&format!("k{i:02}"), &format!("v{i:02}")).unwrap());
        }
        assert!(engine.insert("k10", "v10").unwrap());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.memtable_entries, 0);
        assert_eq!(stats.unflushed_bytes, 0);
        assert_eq!(stats.sstable_names, vec!["sstable1.txt".to_string()]);
        assert_eq!(wal_len(tmp.path()), 0);

        let contents = std::fs::read_to_string(tmp.path().join("sstable/sstable1.txt")).unwrap();
        assert!(contents.starts_with("k00: v00\nk01: v01\n"));
        assert!(contents.ends_with("k10: v10\n"));

        for i in 0..=10 {
            assert_eq!(
                engine.read(&format!("k{i:02}")).unwrap(),
                Some(format!("v{i:02}"))
            );
        }
    }

    #[test]
    fn test_explicit_flush() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        assert!(!engine.flush().unwrap(), "empty memtable is not flushed");

        engine.insert("a", "1").unwrap();
        engine.insert("b", "2").unwrap();
        assert!(engine.flush().unwrap());

        assert_eq!(sstable_files(tmp.path()), vec!["sstable1.txt"]);
        assert_eq!(engine.read("a").unwrap().as_deref(), Some("1"));
        assert_eq!(engine.read("b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_sequence_numbers_ascend() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        for i in 0..3 {
            engine.insert(&format!("k{i}"), "v").unwrap();
            engine.flush().unwrap();
        }

        assert_eq!(
            engine.stats().unwrap().sstable_names,
            vec!["sstable3.txt", "sstable2.txt", "sstable1.txt"]
        );
    }

    #[test]
    fn test_newest_table_wins() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        engine.insert("k", "old").unwrap();
        engine.flush().unwrap();
        engine.insert("k", "new").unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.read("k").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn test_memtable_shadows_sstables() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        engine.insert("k", "flushed").unwrap();
        engine.flush().unwrap();
        engine.insert("k", "buffered").unwrap();

        assert_eq!(engine.read("k").unwrap().as_deref(), Some("buffered"));
    }

    /// # Scenario
    /// A value lives in an older SSTable and a tombstone for it in a newer one.
    ///
    /// # Expected behavior
    /// The on-disk tombstone is surfaced as not-found; the search does not
    /// fall through to the older live value.
    #[test]
    fn test_sstable_tombstone_hides_older_value() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        engine.insert("a", "1").unwrap();
        engine.insert("b", "2").unwrap();
        engine.flush().unwrap();
        engine.delete("a").unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.stats().unwrap().sstable_count, 2);
        assert_eq!(engine.read("a").unwrap(), None);
        assert_eq!(engine.read("b").unwrap().as_deref(), Some("2"));
    }

    /// The end-to-end scenario: reads are identical before and after a flush.
    #[test]
    fn test_reads_stable_across_flush() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        engine.insert("a", "1").unwrap();
        engine.insert("b", "2").unwrap();
        engine.delete("a").unwrap();

        let before = (engine.read("a").unwrap(), engine.read("b").unwrap());
        engine.flush().unwrap();
        let after = (engine.read("a").unwrap(), engine.read("b").unwrap());

        assert_eq!(before, (None, Some("2".to_string())));
        assert_eq!(before, after);
    }

    #[test]
    fn test_many_flushes_all_keys_readable() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_buffer_config()).unwrap();

        let mut flushes = 0;
        for i in 0..300 {
            if engine.insert(&format!("key{i:04}"), &format!("value{i}")).unwrap() {
                flushes += 1;
            }
        }
        assert!(flushes > 10);

        for i in 0..300 {
            assert_eq!(
                engine.read(&format!("key{i:04}")).unwrap(),
                Some(format!("value{i}")),
                "key{i:04}"
            );
        }
        assert_eq!(engine.read("key9999").unwrap(), None);
    }
}
