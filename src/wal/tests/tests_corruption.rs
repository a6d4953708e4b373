//! Recovery in the presence of damaged records.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::memtable::{MemTable, MemtableGetResult};
    use crate::wal::Wal;
    use crate::wal::tests::helpers::*;
    use std::fs;
    use tempfile::TempDir;

    /// # Scenario
    /// One record's stored checksum is altered on disk.
    ///
    /// # Expected behavior
    /// That record is skipped and every other record is recovered.
    #[test]
    fn corruption__bad_checksum_skipped() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = current_path(tmp.path());
        write_records(
            &path,
            &[("a", put("1")), ("b", put("2")), ("c", put("3"))],
        );

        let mut lines = read_lines(&path);
        let (crc, rest) = lines[1].split_once(' ').unwrap();
        let bad: u32 = crc.parse::<u32>().unwrap().wrapping_add(1);
        lines[1] = format!("{bad} {rest}");
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let wal = Wal::open(tmp.path(), 1000).unwrap();
        let mt = MemTable::new();
        let stats = wal.recover_current(&mt).unwrap();

        assert_eq!(stats.applied, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(mt.search("a").unwrap(), MemtableGetResult::Put("1".into()));
        assert_eq!(mt.search("b").unwrap(), MemtableGetResult::NotFound);
        assert_eq!(mt.search("c").unwrap(), MemtableGetResult::Put("3".into()));
    }

    #[test]
    fn corruption__malformed_and_unknown_lines_skipped() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = current_path(tmp.path());
        write_records(&path, &[("a", put("1"))]);

        let unknown = "MERGE k v";
        let mut body = fs::read_to_string(&path).unwrap();
        body.push_str("this is not a record\n");
        body.push_str(&format!("{} {}\n", crc32fast::hash(unknown.as_bytes()), unknown));
        body.push('\n');
        fs::write(&path, body).unwrap();

        let wal = Wal::open(tmp.path(), 1000).unwrap();
        let mt = MemTable::new();
        let stats = wal.recover_current(&mt).unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(mt.len(), 1);
    }

    /// # Scenario
    /// The last record was cut off mid-line by a crash.
    ///
    /// # Expected behavior
    /// The torn tail fails its checksum and is dropped.
    #[test]
    fn corruption__torn_tail() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = current_path(tmp.path());
        write_records(&path, &[("a", put("1")), ("b", put("longvalue"))]);

        let body = fs::read_to_string(&path).unwrap();
        fs::write(&path, &body[..body.len() - 5]).unwrap();

        let wal = Wal::open(tmp.path(), 1000).unwrap();
        let mt = MemTable::new();
        let stats = wal.recover_current(&mt).unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(mt.search("b").unwrap(), MemtableGetResult::NotFound);
    }

    /// # Scenario
    /// Two independent recoveries of the same segments.
    ///
    /// # Expected behavior
    /// Identical memtable contents.
    #[test]
    fn recovery__deterministic() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let wal = Wal::open(tmp.path(), 1000).unwrap();
            for i in 0..50 {
                wal.write_wal(&format!("k{}", i % 7), &put(&i.to_string())).unwrap();
            }
            wal.rotate().unwrap();
            for i in 0..20 {
                wal.write_wal(&format!("k{}", i % 3), &put(&i.to_string())).unwrap();
            }
        }

        let snapshot = || {
            let wal = Wal::open(tmp.path(), 1000).unwrap();
            let mut queue = crate::memtable::ImmutableQueue::new();
            wal.recover_pending(&mut queue).unwrap();
            let active = MemTable::new();
            wal.recover_current(&active).unwrap();
            let frozen: Vec<_> = queue
                .newest_first()
                .map(|e| e.table.traverse().unwrap())
                .collect();
            (frozen, active.traverse().unwrap())
        };

        assert_eq!(snapshot(), snapshot());
    }
}
