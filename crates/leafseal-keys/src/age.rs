//! age master key (age 0.11 API)

use std::fmt;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use age::armor::{ArmoredReader, ArmoredWriter, Format};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{KeyError, KeyResult};
use crate::master_key::{
    field, format_created_at, is_stale, parse_created_at, KeyContext, KeyMap, MasterKey,
};

pub const KEY_TYPE: &str = "age";

/// Literal identity content (may hold several keys, one per line)
pub const SOPS_AGE_KEY_ENV: &str = "SOPS_AGE_KEY";
/// Path to an identity file
pub const SOPS_AGE_KEY_FILE_ENV: &str = "SOPS_AGE_KEY_FILE";

/// A loaded age identity (private key material)
pub struct IdentityProvider {
    pub key_data: SecretString,
    pub source: String,
}

impl IdentityProvider {
    pub fn new(key_data: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            key_data: SecretString::from(key_data.into()),
            source: source.into(),
        }
    }
}

/// Discover the age identity using the priority chain:
///   1. $SOPS_AGE_KEY  (literal key content)
///   2. $SOPS_AGE_KEY_FILE  (explicit path env var)
///   3. `identity_file` from leafseal.toml
///   4. ~/.config/sops/age/keys.txt
pub async fn find_age_identity(identity_file: Option<&Path>) -> KeyResult<IdentityProvider> {
    if let Ok(key_content) = std::env::var(SOPS_AGE_KEY_ENV) {
        if !key_content.is_empty() {
            return Ok(IdentityProvider::new(key_content, "SOPS_AGE_KEY (env)"));
        }
    }

    if let Ok(key_file) = std::env::var(SOPS_AGE_KEY_FILE_ENV) {
        let path = PathBuf::from(&key_file);
        if path.exists() {
            let key_data = tokio::fs::read_to_string(&path).await?;
            return Ok(IdentityProvider::new(
                key_data,
                format!("SOPS_AGE_KEY_FILE:{}", path.display()),
            ));
        }
    }

    if let Some(path) = identity_file {
        if path.exists() {
            let key_data = tokio::fs::read_to_string(path).await?;
            return Ok(IdentityProvider::new(
                key_data,
                format!("config:{}", path.display()),
            ));
        }
    }

    let default_path = default_age_key_path();
    if default_path.exists() {
        let key_data = tokio::fs::read_to_string(&default_path).await?;
        return Ok(IdentityProvider::new(
            key_data,
            format!("default:{}", default_path.display()),
        ));
    }

    Err(KeyError::NoIdentity(format!(
        "tried ${SOPS_AGE_KEY_ENV}, ${SOPS_AGE_KEY_FILE_ENV}, config path, and {}",
        default_path.display()
    )))
}

fn default_age_key_path() -> PathBuf {
    leafseal_core::config::home_dir().join(".config/sops/age/keys.txt")
}

/// Encrypt `plaintext` to one recipient, producing armored ciphertext.
fn encrypt_armored(recipient: &age::x25519::Recipient, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))
            .map_err(|e| KeyError::Encrypt(e.to_string()))?;

    let mut out = Vec::new();
    let armored = ArmoredWriter::wrap_output(&mut out, Format::AsciiArmor)?;
    let mut writer = encryptor.wrap_output(armored)?;
    writer.write_all(plaintext)?;
    writer.finish().and_then(|armor| armor.finish())?;
    Ok(out)
}

/// Decrypt armored (or binary) age ciphertext with an identity.
fn decrypt_armored(
    identity: &IdentityProvider,
    encrypted: &[u8],
) -> KeyResult<Zeroizing<Vec<u8>>> {
    let identities = age::IdentityFile::from_buffer(BufReader::new(
        identity.key_data.expose_secret().as_bytes(),
    ))
    .map_err(|e| KeyError::InvalidKey(format!("parsing identity from {}: {e}", identity.source)))?
    .into_identities()
    .map_err(|e| KeyError::InvalidKey(format!("extracting identities: {e}")))?;

    let decryptor = age::Decryptor::new(ArmoredReader::new(encrypted))
        .map_err(|e| KeyError::Decrypt(e.to_string()))?;
    if decryptor.is_scrypt() {
        return Err(KeyError::Decrypt(
            "passphrase-protected age files are not supported".into(),
        ));
    }

    let mut reader = decryptor
        .decrypt(identities.iter().map(|i| i.as_ref() as &dyn age::Identity))
        .map_err(|e| KeyError::Decrypt(e.to_string()))?;

    let mut plaintext = Zeroizing::new(Vec::new());
    reader.read_to_end(&mut *plaintext)?;
    Ok(plaintext)
}

/// A share wrapped to an age X25519 recipient.
pub struct AgeMasterKey {
    recipient: age::x25519::Recipient,
    encoded_recipient: String,
    encrypted_key: Vec<u8>,
    created_at: DateTime<Utc>,
    identity: Option<Arc<IdentityProvider>>,
    identity_file: Option<PathBuf>,
    max_age: Duration,
}

impl AgeMasterKey {
    pub fn new(recipient: &str, ctx: &KeyContext) -> KeyResult<Self> {
        let encoded_recipient = recipient.trim().to_string();
        let parsed = encoded_recipient
            .parse::<age::x25519::Recipient>()
            .map_err(|e| KeyError::InvalidKey(format!("age recipient {encoded_recipient:?}: {e}")))?;
        Ok(Self {
            recipient: parsed,
            encoded_recipient,
            encrypted_key: Vec::new(),
            created_at: Utc::now(),
            identity: None,
            identity_file: ctx.age_identity_file.clone(),
            max_age: ctx.rotation_max_age,
        })
    }

    /// Parse a comma-separated recipient list.
    pub fn from_recipients(recipients: &str, ctx: &KeyContext) -> KeyResult<Vec<Self>> {
        recipients
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| Self::new(r, ctx))
            .collect()
    }

    pub fn from_map(map: &KeyMap, ctx: &KeyContext) -> KeyResult<Self> {
        let mut key = Self::new(field(map, "recipient")?, ctx)?;
        if let Some(enc) = map.get("enc") {
            key.encrypted_key = enc.as_bytes().to_vec();
        }
        if map.contains_key("created_at") {
            key.created_at = parse_created_at(map)?;
        }
        Ok(key)
    }

    /// Use this identity instead of the discovery chain.
    pub fn with_identity(mut self, identity: Arc<IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn recipient(&self) -> &str {
        &self.encoded_recipient
    }
}

impl fmt::Display for AgeMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded_recipient)
    }
}

#[async_trait]
impl MasterKey for AgeMasterKey {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn encrypted_data_key(&self) -> &[u8] {
        &self.encrypted_key
    }

    fn set_encrypted_data_key(&mut self, enc: Vec<u8>) {
        self.encrypted_key = enc;
    }

    async fn encrypt(&mut self, share: &[u8]) -> KeyResult<()> {
        self.encrypted_key = encrypt_armored(&self.recipient, share)?;
        self.created_at = Utc::now();
        info!(recipient = %self.encoded_recipient, "age encryption succeeded");
        Ok(())
    }

    async fn decrypt(&self) -> KeyResult<Zeroizing<Vec<u8>>> {
        if self.encrypted_key.is_empty() {
            return Err(KeyError::NotWrapped);
        }
        let discovered;
        let identity = match &self.identity {
            Some(identity) => identity.as_ref(),
            None => {
                discovered = find_age_identity(self.identity_file.as_deref()).await?;
                &discovered
            }
        };
        debug!(recipient = %self.encoded_recipient, source = %identity.source, "decrypting with age identity");
        let share = decrypt_armored(identity, &self.encrypted_key)?;
        info!(recipient = %self.encoded_recipient, "age decryption succeeded");
        Ok(share)
    }

    fn needs_rotation(&self) -> bool {
        is_stale(&self.created_at, self.max_age)
    }

    fn to_map(&self) -> KeyMap {
        let mut map = KeyMap::new();
        map.insert("recipient".into(), self.encoded_recipient.clone());
        map.insert(
            "enc".into(),
            String::from_utf8_lossy(&self.encrypted_key).into_owned(),
        );
        map.insert("created_at".into(), format_created_at(&self.created_at));
        map
    }
}
