//! Persisted shape of the `sops` metadata block

use chrono::{DateTime, SecondsFormat, Utc};
use leafseal_core::{RulesConfig, SealError, SealResult};
use leafseal_keys::{age, master_key_from_map, naclbox, KeyContext, KeyGroup, KeyMap};
use leafseal_tree::Metadata;
use serde::{Deserialize, Serialize};

/// One key group as written to disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredGroup {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub age: Vec<KeyMap>,
    #[serde(rename = "box", default, skip_serializing_if = "Vec::is_empty")]
    pub box_keys: Vec<KeyMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<usize>,
}

/// The metadata block. A single group with the default threshold is
/// written as flat `age`/`box` lists instead of `key_groups`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shamir_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_groups: Vec<StoredGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub age: Vec<KeyMap>,
    #[serde(rename = "box", default, skip_serializing_if = "Vec::is_empty")]
    pub box_keys: Vec<KeyMap>,
    #[serde(default)]
    pub lastmodified: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unencrypted_suffix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encrypted_suffix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unencrypted_regex: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encrypted_regex: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mac_only_encrypted: bool,
    #[serde(default)]
    pub version: String,
}

fn is_false(value: &bool) -> bool {
    !value
}

impl StoredGroup {
    fn from_group(group: &KeyGroup) -> SealResult<Self> {
        let mut stored = StoredGroup {
            threshold: group.explicit_threshold(),
            ..Default::default()
        };
        for key in group.keys() {
            match key.key_type() {
                age::KEY_TYPE => stored.age.push(key.to_map()),
                naclbox::KEY_TYPE => stored.box_keys.push(key.to_map()),
                other => {
                    return Err(SealError::config(format!(
                        "master key {key} of type {other} cannot be persisted"
                    )))
                }
            }
        }
        Ok(stored)
    }

    fn into_group(self, index: usize, ctx: &KeyContext) -> SealResult<KeyGroup> {
        let backends = [(age::KEY_TYPE, self.age), (naclbox::KEY_TYPE, self.box_keys)];
        let mut keys = Vec::new();
        for (kind, maps) in backends {
            for map in &maps {
                let key = master_key_from_map(kind, map, ctx).map_err(|e| {
                    SealError::config(format!("key group {index}: {kind} key: {e}"))
                })?;
                keys.push(key);
            }
        }
        KeyGroup::new(keys, self.threshold)
    }
}

impl StoredMetadata {
    pub fn from_metadata(metadata: &Metadata) -> SealResult<Self> {
        let mut groups = metadata
            .key_groups
            .iter()
            .map(StoredGroup::from_group)
            .collect::<SealResult<Vec<_>>>()?;
        let rules = &metadata.rules;
        let mut stored = StoredMetadata {
            shamir_threshold: metadata.explicit_data_key_threshold(),
            lastmodified: metadata
                .last_modified
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            mac: metadata.mac.clone(),
            unencrypted_suffix: rules.unencrypted_suffix.clone(),
            encrypted_suffix: rules.encrypted_suffix.clone(),
            unencrypted_regex: rules.unencrypted_regex.clone(),
            encrypted_regex: rules.encrypted_regex.clone(),
            mac_only_encrypted: rules.mac_only_encrypted,
            version: metadata.version.clone(),
            ..Default::default()
        };
        if groups.len() == 1 && groups[0].threshold.is_none() {
            let group = groups.remove(0);
            stored.age = group.age;
            stored.box_keys = group.box_keys;
        } else {
            stored.key_groups = groups;
        }
        Ok(stored)
    }

    pub fn into_metadata(self, ctx: &KeyContext) -> SealResult<Metadata> {
        let mut groups = self.key_groups;
        if groups.is_empty() {
            groups.push(StoredGroup {
                age: self.age,
                box_keys: self.box_keys,
                threshold: None,
            });
        }
        let key_groups = groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| group.into_group(index, ctx))
            .collect::<SealResult<Vec<_>>>()?;

        let last_modified = match self.lastmodified.as_str() {
            "" => None,
            raw => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| SealError::config(format!("lastmodified {raw:?}: {e}")))?,
            ),
        };

        let mut metadata = Metadata::new(key_groups)
            .with_data_key_threshold(self.shamir_threshold)
            .with_rules(RulesConfig {
                unencrypted_suffix: self.unencrypted_suffix,
                encrypted_suffix: self.encrypted_suffix,
                unencrypted_regex: self.unencrypted_regex,
                encrypted_regex: self.encrypted_regex,
                mac_only_encrypted: self.mac_only_encrypted,
            });
        metadata.mac = self.mac;
        metadata.last_modified = last_modified;
        metadata.version = self.version;
        metadata.validate()?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafseal_keys::naclbox::{BoxKeyFile, BoxMasterKey};
    use leafseal_keys::MasterKey;

    fn box_key(ctx: &KeyContext) -> Box<dyn MasterKey> {
        let file = BoxKeyFile::generate();
        Box::new(BoxMasterKey::new(&file.public_key, ctx).unwrap())
    }

    #[test]
    fn test_single_default_group_is_flat() {
        let ctx = KeyContext::default();
        let group = KeyGroup::new(vec![box_key(&ctx), box_key(&ctx)], None).unwrap();
        let stored = StoredMetadata::from_metadata(&Metadata::new(vec![group])).unwrap();

        assert!(stored.key_groups.is_empty());
        assert_eq!(stored.box_keys.len(), 2);
        assert_eq!(stored.shamir_threshold, None);
        assert_eq!(stored.unencrypted_suffix, "_unencrypted");
    }

    #[test]
    fn test_thresholds_force_key_groups() {
        let ctx = KeyContext::default();
        let group = KeyGroup::new(vec![box_key(&ctx), box_key(&ctx)], Some(1)).unwrap();
        let stored = StoredMetadata::from_metadata(&Metadata::new(vec![group])).unwrap();
        assert_eq!(stored.key_groups.len(), 1);
        assert_eq!(stored.key_groups[0].threshold, Some(1));

        let groups = (0..3)
            .map(|_| KeyGroup::new(vec![box_key(&ctx)], None).unwrap())
            .collect();
        let metadata = Metadata::new(groups).with_data_key_threshold(Some(2));
        let stored = StoredMetadata::from_metadata(&metadata).unwrap();
        assert_eq!(stored.shamir_threshold, Some(2));
        assert_eq!(stored.key_groups.len(), 3);
        assert!(stored.key_groups.iter().all(|g| g.threshold.is_none()));

        let back = stored.into_metadata(&ctx).unwrap();
        assert_eq!(back.data_key_threshold(), 2);
        assert_eq!(back.key_groups.len(), 3);
    }

    #[test]
    fn test_parse_flat_metadata() {
        let ctx = KeyContext::default();
        let public = BoxKeyFile::generate().public_key.clone();
        let stored: StoredMetadata = serde_json::from_value(serde_json::json!({
            "box": [{
                "publickey": public,
                "enc": "",
                "nonce": "",
                "ephemeralpubkey": "",
                "created_at": "2026-01-02T03:04:05Z"
            }],
            "lastmodified": "2026-01-02T03:04:05Z",
            "mac": "",
            "encrypted_regex": "^data$",
            "version": "3.9.0"
        }))
        .unwrap();

        let metadata = stored.into_metadata(&ctx).unwrap();
        assert_eq!(metadata.key_groups.len(), 1);
        assert_eq!(metadata.key_groups[0].key_ids(), vec![public]);
        assert_eq!(metadata.rules.encrypted_regex, "^data$");
        assert!(metadata.rules.unencrypted_suffix.is_empty());
        assert_eq!(metadata.version, "3.9.0");
        assert!(metadata.last_modified.is_some());
    }

    #[test]
    fn test_metadata_without_keys_is_rejected() {
        let stored = StoredMetadata {
            mac: "x".into(),
            ..Default::default()
        };
        assert!(matches!(
            stored.into_metadata(&KeyContext::default()),
            Err(SealError::Config(_))
        ));
    }

    #[test]
    fn test_bad_lastmodified_is_rejected() {
        let ctx = KeyContext::default();
        let group = KeyGroup::new(vec![box_key(&ctx)], None).unwrap();
        let mut stored = StoredMetadata::from_metadata(&Metadata::new(vec![group])).unwrap();
        stored.lastmodified = "yesterday".into();
        assert!(stored.into_metadata(&ctx).is_err());
    }
}
