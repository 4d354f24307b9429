//! The capability every key-management backend implements

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use leafseal_core::LeafsealConfig;
use zeroize::Zeroizing;

use crate::error::{KeyError, KeyResult};
use crate::{age, naclbox};

/// Persisted form of a master key: backend-specific string fields.
pub type KeyMap = BTreeMap<String, String>;

/// A backend able to wrap and unwrap one data-key share.
///
/// `Display` is the stable identifier used in logs and error reports
/// (the age recipient, the box public key).
#[async_trait]
pub trait MasterKey: fmt::Display + Send + Sync {
    /// Metadata section this key is persisted under (`age`, `box`)
    fn key_type(&self) -> &'static str;

    /// Current wrapped share; empty when nothing is wrapped yet.
    fn encrypted_data_key(&self) -> &[u8];

    /// Install a wrapped share, as previously returned by
    /// [`encrypted_data_key`](Self::encrypted_data_key).
    fn set_encrypted_data_key(&mut self, enc: Vec<u8>);

    /// Wrap `share`, replacing any previous wrap.
    async fn encrypt(&mut self, share: &[u8]) -> KeyResult<()>;

    /// Wrap `share` unless a share is already wrapped.
    async fn encrypt_if_needed(&mut self, share: &[u8]) -> KeyResult<()> {
        if self.encrypted_data_key().is_empty() {
            self.encrypt(share).await
        } else {
            Ok(())
        }
    }

    /// Unwrap the stored share.
    async fn decrypt(&self) -> KeyResult<Zeroizing<Vec<u8>>>;

    fn needs_rotation(&self) -> bool;

    fn to_map(&self) -> KeyMap;
}

/// Settings shared by every backend when keys are built or loaded.
#[derive(Debug, Clone)]
pub struct KeyContext {
    pub age_identity_file: Option<PathBuf>,
    pub box_key_dir: PathBuf,
    pub rotation_max_age: Duration,
}

impl Default for KeyContext {
    fn default() -> Self {
        Self::from_config(&LeafsealConfig::default())
    }
}

impl KeyContext {
    pub fn from_config(config: &LeafsealConfig) -> Self {
        Self {
            age_identity_file: config
                .age
                .identity_file
                .as_deref()
                .map(leafseal_core::config::expand_tilde),
            box_key_dir: leafseal_core::config::expand_tilde(&config.box_keys.key_dir),
            rotation_max_age: Duration::days(config.keys.rotation_max_age_days),
        }
    }
}

/// Rebuild a master key of type `kind` from its persisted map.
pub fn master_key_from_map(
    kind: &str,
    map: &KeyMap,
    ctx: &KeyContext,
) -> KeyResult<Box<dyn MasterKey>> {
    match kind {
        age::KEY_TYPE => Ok(Box::new(age::AgeMasterKey::from_map(map, ctx)?)),
        naclbox::KEY_TYPE => Ok(Box::new(naclbox::BoxMasterKey::from_map(map, ctx)?)),
        other => Err(KeyError::UnknownType(other.to_string())),
    }
}

pub(crate) fn field<'a>(map: &'a KeyMap, name: &'static str) -> KeyResult<&'a str> {
    map.get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(KeyError::MissingField(name))
}

pub(crate) fn parse_created_at(map: &KeyMap) -> KeyResult<DateTime<Utc>> {
    let raw = field(map, "created_at")?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| KeyError::InvalidKey(format!("created_at {raw:?}: {e}")))
}

pub(crate) fn format_created_at(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn is_stale(created_at: &DateTime<Utc>, max_age: Duration) -> bool {
    Utc::now().signed_duration_since(*created_at) > max_age
}
