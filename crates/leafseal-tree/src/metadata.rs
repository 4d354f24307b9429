use chrono::{DateTime, Utc};
use leafseal_core::{RulesConfig, SealError, SealResult};
use leafseal_keys::KeyGroup;

/// Everything stored next to the encrypted values.
#[derive(Debug)]
pub struct Metadata {
    pub key_groups: Vec<KeyGroup>,
    /// Groups required to recover the data key; `None` means all of them
    pub data_key_threshold: Option<usize>,
    /// Encrypted MAC envelope; empty until the first encrypt pass
    pub mac: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub version: String,
    pub rules: RulesConfig,
}

impl Metadata {
    pub fn new(key_groups: Vec<KeyGroup>) -> Self {
        Self {
            key_groups,
            data_key_threshold: None,
            mac: String::new(),
            last_modified: None,
            version: leafseal_core::VERSION.to_string(),
            rules: RulesConfig::default().with_defaults(),
        }
    }

    pub fn with_rules(mut self, rules: RulesConfig) -> Self {
        self.rules = rules.with_defaults();
        self
    }

    pub fn with_data_key_threshold(mut self, threshold: Option<usize>) -> Self {
        self.data_key_threshold = threshold.filter(|&t| t != 0);
        self
    }

    pub fn data_key_threshold(&self) -> usize {
        self.data_key_threshold.unwrap_or(self.key_groups.len())
    }

    /// The threshold to persist, `None` when it equals the group count.
    pub fn explicit_data_key_threshold(&self) -> Option<usize> {
        self.data_key_threshold
            .filter(|&t| t != self.key_groups.len())
    }

    pub fn needs_rotation(&self) -> bool {
        self.key_groups.iter().any(KeyGroup::needs_rotation)
    }

    pub fn validate(&self) -> SealResult<()> {
        if self.key_groups.is_empty() {
            return Err(SealError::config("metadata has no key groups"));
        }
        if self.key_groups.len() > 255 {
            return Err(SealError::config("at most 255 key groups are supported"));
        }
        let threshold = self.data_key_threshold();
        if threshold == 0 || threshold > self.key_groups.len() {
            return Err(SealError::config(format!(
                "data key threshold {threshold} is invalid for {} key groups",
                self.key_groups.len()
            )));
        }
        self.rules.validate()
    }
}
