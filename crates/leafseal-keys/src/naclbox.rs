//! NaCl box master key: X25519 + XSalsa20-Poly1305 (`crypto_box`)
//!
//! Each wrap generates an ephemeral keypair; only its public half is kept,
//! next to the nonce and ciphertext. The recipient's private key lives in
//! `<key_dir>/<hex sha256(public key)>.key` as JSON.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{KeyError, KeyResult};
use crate::master_key::{
    field, format_created_at, is_stale, parse_created_at, KeyContext, KeyMap, MasterKey,
};

pub const KEY_TYPE: &str = "box";

const PUBLIC_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// On-disk form of a box keypair, both halves base64.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct BoxKeyFile {
    pub public_key: String,
    pub private_key: String,
}

impl BoxKeyFile {
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        Self {
            public_key: STANDARD.encode(secret.public_key().as_bytes()),
            private_key: STANDARD.encode(secret.to_bytes()),
        }
    }

    pub fn secret_key(&self) -> KeyResult<SecretKey> {
        let raw = Zeroizing::new(
            STANDARD
                .decode(&self.private_key)
                .map_err(|e| KeyError::InvalidKey(format!("private key base64: {e}")))?,
        );
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidKey(format!("private key is {} bytes", raw.len())))?;
        Ok(SecretKey::from(bytes))
    }

    /// Write into `dir` under the lookup name for its public key.
    pub async fn write_to(&self, dir: &Path) -> KeyResult<PathBuf> {
        let public = decode_public_key(&self.public_key)?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(key_file_name(&public));
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| KeyError::InvalidKey(format!("serializing key file: {e}")))?;
        tokio::fs::write(&path, json).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(path)
    }
}

/// `<hex sha256(raw public key)>.key`
pub fn key_file_name(public: &PublicKey) -> String {
    format!("{}.key", hex::encode(Sha256::digest(public.as_bytes())))
}

fn decode_public_key(encoded: &str) -> KeyResult<PublicKey> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| KeyError::InvalidKey(format!("box public key base64: {e}")))?;
    let bytes: [u8; PUBLIC_KEY_SIZE] = raw
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidKey(format!("box public key is {} bytes", raw.len())))?;
    Ok(PublicKey::from(bytes))
}

fn decode_field(map: &KeyMap, name: &'static str, len: Option<usize>) -> KeyResult<Vec<u8>> {
    let raw = STANDARD
        .decode(field(map, name)?)
        .map_err(|e| KeyError::InvalidKey(format!("{name} base64: {e}")))?;
    match len {
        Some(len) if raw.len() != len => Err(KeyError::InvalidKey(format!(
            "{name} must be {len} bytes, got {}",
            raw.len()
        ))),
        _ => Ok(raw),
    }
}

/// A share sealed to a box public key.
///
/// The wrapped share is held as one opaque buffer,
/// `ephemeral public key (32) || nonce (24) || ciphertext`, and split into
/// the `ephemeralpubkey`, `nonce` and `enc` fields when persisted.
pub struct BoxMasterKey {
    public_key: PublicKey,
    encoded_public: String,
    wrapped: Vec<u8>,
    created_at: DateTime<Utc>,
    secret: Option<SecretKey>,
    key_dir: PathBuf,
    max_age: Duration,
}

impl BoxMasterKey {
    pub fn new(public_key: &str, ctx: &KeyContext) -> KeyResult<Self> {
        let encoded_public = public_key.replace(' ', "");
        Ok(Self {
            public_key: decode_public_key(&encoded_public)?,
            encoded_public,
            wrapped: Vec::new(),
            created_at: Utc::now(),
            secret: None,
            key_dir: ctx.box_key_dir.clone(),
            max_age: ctx.rotation_max_age,
        })
    }

    /// Parse a comma-separated public key list.
    pub fn from_public_keys(public_keys: &str, ctx: &KeyContext) -> KeyResult<Vec<Self>> {
        public_keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| Self::new(k, ctx))
            .collect()
    }

    pub fn from_map(map: &KeyMap, ctx: &KeyContext) -> KeyResult<Self> {
        let mut key = Self::new(field(map, "publickey")?, ctx)?;
        if map.get("enc").is_some_and(|enc| !enc.is_empty()) {
            let mut wrapped = decode_field(map, "ephemeralpubkey", Some(PUBLIC_KEY_SIZE))?;
            wrapped.extend(decode_field(map, "nonce", Some(NONCE_SIZE))?);
            wrapped.extend(decode_field(map, "enc", None)?);
            key.wrapped = wrapped;
        }
        if map.contains_key("created_at") {
            key.created_at = parse_created_at(map)?;
        }
        Ok(key)
    }

    /// Use this private key instead of looking it up in the key directory.
    pub fn with_secret(mut self, secret: SecretKey) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn public_key(&self) -> &str {
        &self.encoded_public
    }

    async fn load_secret(&self) -> KeyResult<SecretKey> {
        let path = self.key_dir.join(key_file_name(&self.public_key));
        if !path.exists() {
            return Err(KeyError::NoIdentity(format!(
                "no private key found at {}",
                path.display()
            )));
        }
        let data = Zeroizing::new(tokio::fs::read(&path).await?);
        let key_file: BoxKeyFile = serde_json::from_slice(&data).map_err(|e| {
            KeyError::InvalidKey(format!("parsing key file {}: {e}", path.display()))
        })?;
        debug!(public_key = %self.encoded_public, path = %path.display(), "loaded box private key");
        key_file.secret_key()
    }

    /// Split the opaque buffer into (ephemeral public key, nonce, ciphertext).
    fn parts(&self) -> KeyResult<(&[u8], &[u8], &[u8])> {
        if self.wrapped.len() < PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(KeyError::Decrypt("wrapped share is truncated".into()));
        }
        let (ephemeral, rest) = self.wrapped.split_at(PUBLIC_KEY_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        Ok((ephemeral, nonce, ciphertext))
    }
}

impl fmt::Display for BoxMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded_public)
    }
}

#[async_trait]
impl MasterKey for BoxMasterKey {
    fn key_type(&self) -> &'static str {
        KEY_TYPE
    }

    fn encrypted_data_key(&self) -> &[u8] {
        &self.wrapped
    }

    fn set_encrypted_data_key(&mut self, enc: Vec<u8>) {
        self.wrapped = enc;
    }

    async fn encrypt(&mut self, share: &[u8]) -> KeyResult<()> {
        let ephemeral = SecretKey::generate(&mut rand::rngs::OsRng);
        let salsa_box = SalsaBox::new(&self.public_key, &ephemeral);

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = salsa_box
            .encrypt(crypto_box::Nonce::from_slice(&nonce), share)
            .map_err(|e| KeyError::Encrypt(format!("box seal failed: {e}")))?;

        let mut wrapped = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(ephemeral.public_key().as_bytes());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        self.wrapped = wrapped;
        self.created_at = Utc::now();

        info!(public_key = %self.encoded_public, "box encryption succeeded");
        Ok(())
    }

    async fn decrypt(&self) -> KeyResult<Zeroizing<Vec<u8>>> {
        if self.wrapped.is_empty() {
            return Err(KeyError::NotWrapped);
        }
        let (ephemeral, nonce, ciphertext) = self.parts()?;
        let ephemeral: [u8; PUBLIC_KEY_SIZE] = ephemeral
            .try_into()
            .map_err(|_| KeyError::Decrypt("bad ephemeral public key".into()))?;

        let loaded;
        let secret = match &self.secret {
            Some(secret) => secret,
            None => {
                loaded = self.load_secret().await?;
                &loaded
            }
        };
        if secret.public_key() != self.public_key {
            return Err(KeyError::InvalidKey(
                "private key does not match the public key".into(),
            ));
        }

        let salsa_box = SalsaBox::new(&PublicKey::from(ephemeral), secret);
        let share = salsa_box
            .decrypt(crypto_box::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeyError::Decrypt("box open failed (wrong key or tampered data)".into()))?;

        info!(public_key = %self.encoded_public, "box decryption succeeded");
        Ok(Zeroizing::new(share))
    }

    fn needs_rotation(&self) -> bool {
        is_stale(&self.created_at, self.max_age)
    }

    fn to_map(&self) -> KeyMap {
        let (enc, nonce, ephemeral) = match self.parts() {
            Ok((ephemeral, nonce, ciphertext)) => (
                STANDARD.encode(ciphertext),
                STANDARD.encode(nonce),
                STANDARD.encode(ephemeral),
            ),
            Err(_) => Default::default(),
        };
        let mut map = KeyMap::new();
        map.insert("publickey".into(), self.encoded_public.clone());
        map.insert("enc".into(), enc);
        map.insert("nonce".into(), nonce);
        map.insert("ephemeralpubkey".into(), ephemeral);
        map.insert("created_at".into(), format_created_at(&self.created_at));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (BoxKeyFile, KeyContext) {
        (BoxKeyFile::generate(), KeyContext::default())
    }

    #[tokio::test]
    async fn test_wrap_unwrap_with_explicit_secret() {
        let (file, ctx) = keypair();
        let mut key = BoxMasterKey::new(&file.public_key, &ctx)
            .unwrap()
            .with_secret(file.secret_key().unwrap());

        key.encrypt(b"group share").await.unwrap();
        assert_eq!(
            key.encrypted_data_key().len(),
            PUBLIC_KEY_SIZE + NONCE_SIZE + b"group share".len() + TAG_SIZE
        );
        assert_eq!(&key.decrypt().await.unwrap()[..], b"group share");
    }

    #[tokio::test]
    async fn test_private_key_lookup_in_key_dir() {
        let (file, _) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let path = file.write_to(dir.path()).await.unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with(".key"));

        let ctx = KeyContext {
            box_key_dir: dir.path().to_path_buf(),
            ..KeyContext::default()
        };
        let mut key = BoxMasterKey::new(&file.public_key, &ctx).unwrap();
        key.encrypt(b"from disk").await.unwrap();

        let restored = BoxMasterKey::from_map(&key.to_map(), &ctx).unwrap();
        assert_eq!(&restored.decrypt().await.unwrap()[..], b"from disk");
    }

    #[tokio::test]
    async fn test_missing_private_key() {
        let (file, _) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let ctx = KeyContext {
            box_key_dir: dir.path().to_path_buf(),
            ..KeyContext::default()
        };
        let mut key = BoxMasterKey::new(&file.public_key, &ctx).unwrap();
        key.encrypt(b"x").await.unwrap();
        assert!(matches!(key.decrypt().await, Err(KeyError::NoIdentity(_))));
    }

    #[tokio::test]
    async fn test_each_wrap_uses_fresh_ephemeral_key() {
        let (file, ctx) = keypair();
        let mut key = BoxMasterKey::new(&file.public_key, &ctx).unwrap();
        key.encrypt(b"same").await.unwrap();
        let first = key.to_map();
        key.encrypt(b"same").await.unwrap();
        let second = key.to_map();
        assert_ne!(first["ephemeralpubkey"], second["ephemeralpubkey"]);
        assert_ne!(first["nonce"], second["nonce"]);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let (file, ctx) = keypair();
        let mut key = BoxMasterKey::new(&file.public_key, &ctx)
            .unwrap()
            .with_secret(file.secret_key().unwrap());
        key.encrypt(b"share").await.unwrap();
        let mut wrapped = key.encrypted_data_key().to_vec();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        key.set_encrypted_data_key(wrapped);
        assert!(matches!(key.decrypt().await, Err(KeyError::Decrypt(_))));
    }

    #[test]
    fn test_unwrapped_map_has_blank_fields() {
        let (file, ctx) = keypair();
        let key = BoxMasterKey::new(&file.public_key, &ctx).unwrap();
        let map = key.to_map();
        assert_eq!(map["enc"], "");
        assert_eq!(map["nonce"], "");
        let restored = BoxMasterKey::from_map(&map, &ctx).unwrap();
        assert!(restored.encrypted_data_key().is_empty());
    }

    #[test]
    fn test_bad_public_key() {
        let ctx = KeyContext::default();
        assert!(BoxMasterKey::new("not base64!", &ctx).is_err());
        assert!(BoxMasterKey::new(&STANDARD.encode([1u8; 16]), &ctx).is_err());
    }

    #[test]
    fn test_key_file_name_is_sha256_hex() {
        let (file, _) = keypair();
        let public = decode_public_key(&file.public_key).unwrap();
        let name = key_file_name(&public);
        assert_eq!(name.len(), 64 + ".key".len());
    }
}
