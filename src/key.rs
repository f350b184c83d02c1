//! Document key derivation.
//!
//! The absolute key of an offset is `offset + seed`. The string key is the
//! configured prefix, the absolute key zero-padded so the whole key reaches
//! `key_size` where possible, and the suffix.

use crate::config::OperationConfig;

/// Builds document keys for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
    suffix: String,
    key_size: usize,
    seed: u64,
}

impl KeyBuilder {
    /// Creates a builder for the given config and collection seed.
    pub fn new(config: &OperationConfig, seed: u64) -> Self {
        Self {
            prefix: config.key_prefix.clone(),
            suffix: config.key_suffix.clone(),
            key_size: config.key_size,
            seed,
        }
    }

    /// The collection seed added to every offset.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Absolute key-space value for an offset.
    ///
    /// Task configuration rejects ranges where `seed + end` overflows, so
    /// this never wraps for an offset inside the task range.
    pub fn absolute(&self, offset: u64) -> u64 {
        self.seed.wrapping_add(offset)
    }

    /// String key for an offset.
    pub fn key(&self, offset: u64) -> String {
        let number = self.absolute(offset).to_string();
        let fixed = self.prefix.len() + self.suffix.len();
        let width = self.key_size.saturating_sub(fixed).max(number.len());
        format!("{}{:0>width$}{}", self.prefix, number, self.suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(prefix: &str, suffix: &str, key_size: usize, seed: u64) -> KeyBuilder {
        let config = OperationConfig {
            key_prefix: prefix.to_string(),
            key_suffix: suffix.to_string(),
            key_size,
            ..OperationConfig::with_range(0, 10)
        };
        KeyBuilder::new(&config, seed)
    }

    #[test]
    fn test_key_is_padded_to_key_size() {
        let keys = builder("u-", "", 10, 100);
        let key = keys.key(5);
        assert_eq!(key, "u-00000105");
        assert_eq!(key.len(), 10);
    }

    #[test]
    fn test_key_never_truncates_number() {
        let keys = builder("prefix-", "-s", 4, 123_456);
        assert_eq!(keys.key(0), "prefix-123456-s");
    }

    #[test]
    fn test_distinct_offsets_yield_distinct_keys() {
        let keys = builder("", "", 20, 42);
        assert_ne!(keys.key(1), keys.key(2));
        assert_eq!(keys.absolute(8), 50);
    }
}
