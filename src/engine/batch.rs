//! Batch command parsing for `putbat`.
//!
//! Each line is either `put <key> <value...>` or `del <key>`. The value is
//! everything after the key, so it may contain spaces.

use std::{collections::BTreeMap, io::BufRead};

use tracing::warn;

use super::EngineError;
use crate::memtable::{TOMBSTONE, Value};

/// Reads up to `count` lines from `input` into an ordered batch.
///
/// Blank lines, lines with a missing key or value, and puts of the reserved
/// tombstone literal are skipped but still count towards `count`. The first
/// unknown command aborts with [`EngineError::InvalidBatch`]. A later line
/// for the same key replaces an earlier one.
pub fn parse_batch<R: BufRead>(
    input: &mut R,
    count: usize,
) -> Result<BTreeMap<String, Value>, EngineError> {
    let mut batch = BTreeMap::new();
    let mut line = String::new();

    for n in 0..count {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            warn!(read = n, expected = count, "batch input ended early");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (cmd, rest) = split_word(trimmed);
        match cmd {
            "put" => {
                let (key, value) = split_word(rest);
                if key.is_empty() || value.is_empty() {
                    warn!(line = trimmed, "batch put without key or value, skipping");
                    continue;
                }
                if value == TOMBSTONE {
                    warn!(key, "batch put of reserved value, skipping");
                    continue;
                }
                batch.insert(key.to_string(), Value::Put(value.to_string()));
            }
            "del" => {
                let (key, _) = split_word(rest);
                if key.is_empty() {
                    warn!(line = trimmed, "batch del without key, skipping");
                    continue;
                }
                batch.insert(key.to_string(), Value::Tombstone);
            }
            other => return Err(EngineError::InvalidBatch(other.to_string())),
        }
    }

    Ok(batch)
}

/// Splits off the first whitespace-delimited word; the rest is left-trimmed.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}
