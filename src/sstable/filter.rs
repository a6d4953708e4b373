//! Per-file bloom filter over keys.

use bloomfilter::Bloom;

use super::SstError;

/// Target false-positive rate for every table filter.
pub const FALSE_POSITIVE_RATE: f64 = 0.01;

/// Probabilistic key membership for one table.
///
/// Filters are not persisted; they are rebuilt from the data file on load.
pub struct KeyFilter {
    bloom: Bloom<[u8]>,
}

impl KeyFilter {
    /// Sizes the filter for `expected_keys` entries at [`FALSE_POSITIVE_RATE`].
    pub fn new(expected_keys: usize) -> Result<Self, SstError> {
        let bloom = Bloom::new_for_fp_rate(expected_keys.max(1), FALSE_POSITIVE_RATE)
            .map_err(|e| SstError::Filter(e.to_string()))?;
        Ok(Self { bloom })
    }

    pub fn insert(&mut self, key: &str) {
        self.bloom.set(key.as_bytes());
    }

    /// `false` means the key is definitely absent.
    pub fn may_contain(&self, key: &str) -> bool {
        self.bloom.check(key.as_bytes())
    }
}

impl std::fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFilter").finish_non_exhaustive()
    }
}
