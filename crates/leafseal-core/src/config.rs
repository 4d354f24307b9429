use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SealError, SealResult};
use crate::DEFAULT_UNENCRYPTED_SUFFIX;

/// Top-level configuration (loaded from leafseal.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafsealConfig {
    pub log: LogConfig,
    pub rules: RulesConfig,
    pub keys: KeysConfig,
    pub age: AgeConfig,
    #[serde(rename = "box")]
    pub box_keys: BoxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Which leaves get encrypted. At most one matcher may be non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RulesConfig {
    pub unencrypted_suffix: String,
    pub encrypted_suffix: String,
    pub unencrypted_regex: String,
    pub encrypted_regex: String,
    /// Only hash encrypted values into the MAC
    pub mac_only_encrypted: bool,
}

/// What to do when a master key fails to wrap its share during encryption.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncryptFailurePolicy {
    /// Any single wrap failure aborts the whole encrypt
    #[default]
    AbortOnAny,
    /// A group may lose wraps as long as `threshold` of them still succeed
    RequireGroupThreshold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Keys required inside a group (0 = all keys in the group)
    pub group_threshold: usize,
    /// Groups required to recover the data key (0 = all groups)
    pub data_key_threshold: usize,
    /// Per-backend call timeout
    pub backend_timeout_secs: u64,
    /// Age after which a master key reports it needs rotation
    pub rotation_max_age_days: i64,
    /// Launch order for master-key decrypt attempts, by key type
    pub decryption_order: Vec<String>,
    pub encrypt_failure_policy: EncryptFailurePolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgeConfig {
    /// Age identity file (default: ~/.config/sops/age/keys.txt)
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxConfig {
    /// Directory holding `<sha256(pubkey)>.key` private key files
    pub key_dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            group_threshold: 0,
            data_key_threshold: 0,
            backend_timeout_secs: 30,
            rotation_max_age_days: 180,
            decryption_order: vec!["age".into(), "box".into()],
            encrypt_failure_policy: EncryptFailurePolicy::AbortOnAny,
        }
    }
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("~/.sops/naclbox"),
        }
    }
}

impl KeysConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

impl RulesConfig {
    /// Fill in the default unencrypted suffix when no matcher is set.
    pub fn with_defaults(mut self) -> Self {
        if self.unencrypted_suffix.is_empty()
            && self.encrypted_suffix.is_empty()
            && self.unencrypted_regex.is_empty()
            && self.encrypted_regex.is_empty()
        {
            self.unencrypted_suffix = DEFAULT_UNENCRYPTED_SUFFIX.into();
        }
        self
    }

    pub fn validate(&self) -> SealResult<()> {
        let set = [
            &self.unencrypted_suffix,
            &self.encrypted_suffix,
            &self.unencrypted_regex,
            &self.encrypted_regex,
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .count();
        if set > 1 {
            return Err(SealError::config(
                "only one of unencrypted_suffix, encrypted_suffix, unencrypted_regex \
                 and encrypted_regex may be set",
            ));
        }
        for re in [&self.unencrypted_regex, &self.encrypted_regex] {
            if !re.is_empty() {
                regex::Regex::new(re)
                    .map_err(|e| SealError::config(format!("invalid regex {re:?}: {e}")))?;
            }
        }
        Ok(())
    }
}

impl LeafsealConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> SealResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> SealResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| SealError::config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SealResult<()> {
        self.rules.validate()?;
        if self.keys.backend_timeout_secs == 0 {
            return Err(SealError::config("backend_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(rest) = s.strip_prefix("~/") {
            return home_dir().join(rest);
        }
    }
    path.to_path_buf()
}

pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
