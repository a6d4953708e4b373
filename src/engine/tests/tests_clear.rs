//! `clear` drops every layer of data.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use tempfile::TempDir;

    /// # Scenario
    /// Data spread across the active memtable, the immutable queue and
    /// level 0.
    ///
    /// # Expected behavior
    /// After `clear` nothing is readable, no tables or pending segments
    /// remain, and a reopen does not resurrect anything.
    #[test]
    fn clear__drops_all_layers() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = small_buffer(tmp.path());
            fill_and_flush(&engine, 0..20, "a");
            pad_until_rotation(&engine, "queued");
            put(&engine, "active", "v");
            assert!(engine.stats().unwrap().immutable_count > 0);

            engine.clear().unwrap();

            assert_eq!(engine.get("key_000").unwrap(), None);
            assert_eq!(engine.get("queued000").unwrap(), None);
            assert_eq!(engine.get("active").unwrap(), None);
            let stats = engine.stats().unwrap();
            assert_eq!(stats.immutable_count, 0);
            assert_eq!(stats.active_entries, 0);
            assert!(stats.levels.iter().all(|l| l.files == 0));
            assert!(engine.pending_segments().unwrap().is_empty());
        }

        let engine = small_buffer(tmp.path());
        assert_eq!(engine.get("key_000").unwrap(), None);
        assert_eq!(engine.get("active").unwrap(), None);
        assert_eq!(engine.stats().unwrap().immutable_count, 0);
    }

    /// # Scenario
    /// The engine stays usable after `clear`.
    #[test]
    fn clear__writes_after_clear() {
        let tmp = TempDir::new().unwrap();
        let engine = small_buffer(tmp.path());
        fill_and_flush(&engine, 0..20, "a");

        engine.clear().unwrap();
        fill_and_flush(&engine, 0..20, "b");

        assert_eq!(engine.get("key_005").unwrap().as_deref(), Some("val_005_b"));
        assert!(!engine.level_files(0).unwrap().is_empty());
    }
}
