//! Which leaves are encrypted
//!
//! A matcher applies to mapping keys and fixes the decision for the whole
//! subtree below the first matching key:
//!   - `unencrypted_suffix` / `unencrypted_regex`: everything is encrypted
//!     except subtrees under a matching key
//!   - `encrypted_suffix` / `encrypted_regex`: nothing is encrypted except
//!     subtrees under a matching key

use leafseal_core::{RulesConfig, SealError, SealResult};
use regex::Regex;

#[derive(Debug, Clone)]
enum Matcher {
    UnencryptedSuffix(String),
    EncryptedSuffix(String),
    UnencryptedRegex(Regex),
    EncryptedRegex(Regex),
}

#[derive(Debug, Clone)]
pub struct EncryptionRules {
    matcher: Matcher,
    mac_only_encrypted: bool,
}

impl EncryptionRules {
    pub fn from_config(config: &RulesConfig) -> SealResult<Self> {
        config.validate()?;
        let config = config.clone().with_defaults();
        let compile = |re: &str| {
            Regex::new(re).map_err(|e| SealError::config(format!("invalid regex {re:?}: {e}")))
        };
        let matcher = if !config.encrypted_suffix.is_empty() {
            Matcher::EncryptedSuffix(config.encrypted_suffix)
        } else if !config.unencrypted_regex.is_empty() {
            Matcher::UnencryptedRegex(compile(&config.unencrypted_regex)?)
        } else if !config.encrypted_regex.is_empty() {
            Matcher::EncryptedRegex(compile(&config.encrypted_regex)?)
        } else {
            Matcher::UnencryptedSuffix(config.unencrypted_suffix)
        };
        Ok(Self {
            matcher,
            mac_only_encrypted: config.mac_only_encrypted,
        })
    }

    /// Decision at the document root, before any key has matched.
    pub fn root(&self) -> bool {
        matches!(
            self.matcher,
            Matcher::UnencryptedSuffix(_) | Matcher::UnencryptedRegex(_)
        )
    }

    /// Decision for the subtree under mapping key `key`.
    pub fn descend(&self, encrypting: bool, key: &str) -> bool {
        match &self.matcher {
            Matcher::UnencryptedSuffix(s) => encrypting && !key.ends_with(s.as_str()),
            Matcher::UnencryptedRegex(re) => encrypting && !re.is_match(key),
            Matcher::EncryptedSuffix(s) => encrypting || key.ends_with(s.as_str()),
            Matcher::EncryptedRegex(re) => encrypting || re.is_match(key),
        }
    }

    pub fn mac_only_encrypted(&self) -> bool {
        self.mac_only_encrypted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(config: RulesConfig) -> EncryptionRules {
        EncryptionRules::from_config(&config).unwrap()
    }

    #[test]
    fn test_default_unencrypted_suffix() {
        let r = rules(RulesConfig::default());
        assert!(r.root());
        assert!(r.descend(true, "password"));
        assert!(!r.descend(true, "name_unencrypted"));
        // once excluded, children stay excluded
        assert!(!r.descend(false, "password"));
    }

    #[test]
    fn test_encrypted_suffix() {
        let r = rules(RulesConfig {
            encrypted_suffix: "_secret".into(),
            ..Default::default()
        });
        assert!(!r.root());
        assert!(!r.descend(false, "host"));
        assert!(r.descend(false, "token_secret"));
        assert!(r.descend(true, "nested"));
    }

    #[test]
    fn test_regex_matchers() {
        let r = rules(RulesConfig {
            encrypted_regex: "^(data|stringData)$".into(),
            ..Default::default()
        });
        assert!(r.descend(false, "data"));
        assert!(!r.descend(false, "metadata"));

        let r = rules(RulesConfig {
            unencrypted_regex: "^public_".into(),
            ..Default::default()
        });
        assert!(!r.descend(true, "public_url"));
        assert!(r.descend(true, "private_key"));
    }

    #[test]
    fn test_conflicting_matchers_rejected() {
        let err = EncryptionRules::from_config(&RulesConfig {
            unencrypted_suffix: "_u".into(),
            encrypted_suffix: "_e".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, SealError::Config(_)));
    }
}
