//! Log manifest: the set of pending (rotated but not yet flushed) segments.
//!
//! Persisted as one segment filename per line in `manifest.txt` inside the
//! WAL directory. Every change rewrites `manifest.tmp` and renames it over the
//! real file.

use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{info, warn};

use super::{CURRENT_SEGMENT, WalError};

pub const MANIFEST_FILE: &str = "manifest.txt";
const MANIFEST_TMP: &str = "manifest.tmp";

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".log";

/// Pending segment bookkeeping.
#[derive(Debug)]
pub struct LogManifest {
    dir: PathBuf,
    pending: BTreeSet<String>,
    last_stamp: u64,
}

/// Extracts the timestamp from `wal_<digits>.log`.
fn segment_stamp(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

impl LogManifest {
    /// Loads the manifest from `dir` and reconciles it with the segments
    /// actually present on disk.
    ///
    /// Names whose file is gone are dropped. Segment files that exist but
    /// are not listed (crash between rename and registration) are adopted.
    pub fn load(dir: &Path) -> Result<Self, WalError> {
        let mut manifest = Self {
            dir: dir.to_path_buf(),
            pending: BTreeSet::new(),
            last_stamp: 0,
        };

        let path = dir.join(MANIFEST_FILE);
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                let name = line.trim();
                if !name.is_empty() {
                    manifest.pending.insert(name.to_string());
                }
            }
        }

        let mut changed = false;

        let listed: Vec<String> = manifest.pending.iter().cloned().collect();
        for name in listed {
            if !dir.join(&name).exists() {
                warn!(segment = %name, "pending segment missing on disk, dropping");
                manifest.pending.remove(&name);
                changed = true;
            }
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == CURRENT_SEGMENT || segment_stamp(&name).is_none() {
                continue;
            }
            if manifest.pending.insert(name.clone()) {
                warn!(segment = %name, "adopting unregistered segment");
                changed = true;
            }
        }

        manifest.last_stamp = manifest
            .pending
            .iter()
            .filter_map(|n| segment_stamp(n))
            .max()
            .unwrap_or(0);

        if changed {
            manifest.rewrite()?;
        }

        info!(
            pending = manifest.pending.len(),
            "log manifest loaded from {}",
            dir.display()
        );
        Ok(manifest)
    }

    /// Fresh pending name derived from wall-clock milliseconds.
    ///
    /// Names are strictly increasing even when called twice within the same
    /// millisecond, so lexicographic order equals rotation order.
    pub fn next_wal_name(&mut self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let stamp = now.max(self.last_stamp + 1);
        self.last_stamp = stamp;
        format!("{SEGMENT_PREFIX}{stamp:020}{SEGMENT_SUFFIX}")
    }

    pub fn add(&mut self, name: &str) -> Result<(), WalError> {
        self.pending.insert(name.to_string());
        self.rewrite()
    }

    /// Deletes the segment file, then unregisters it.
    pub fn remove(&mut self, name: &str) -> Result<(), WalError> {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(segment = %name, "segment already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.pending.remove(name);
        self.rewrite()
    }

    /// Deletes every pending segment and empties the manifest.
    pub fn clear(&mut self) -> Result<(), WalError> {
        for name in std::mem::take(&mut self.pending) {
            if let Err(e) = fs::remove_file(self.dir.join(&name)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(segment = %name, error = %e, "failed to delete pending segment");
                }
            }
        }
        self.rewrite()
    }

    /// Pending names, oldest first.
    pub fn get_pending_wals(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    fn rewrite(&self) -> Result<(), WalError> {
        let tmp = self.dir.join(MANIFEST_TMP);
        {
            let mut out = File::create(&tmp)?;
            for name in &self.pending {
                writeln!(out, "{name}")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(MANIFEST_FILE))?;
        Ok(())
    }
}
