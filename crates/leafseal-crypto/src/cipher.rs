//! Per-value AES-256-GCM encryption
//!
//! Envelope format (text):
//! ```text
//! ENC[AES256_GCM,data:<b64 ciphertext>,iv:<b64 32-byte iv>,tag:<b64 16-byte tag>,type:<kind>]
//! AAD = tree path of the value, e.g. "nested:x:" or "list:0:"
//! ```
//!
//! The AAD binds each ciphertext to its position in the document, so an
//! envelope copied to another path fails authentication.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::consts::U32;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use crate::data_key::DataKey;
use crate::error::{CryptoError, CryptoResult};
use crate::{IV_SIZE, TAG_SIZE};

/// AES-256-GCM with a 256-bit nonce, as used by sops envelopes.
type Aes256Gcm32 = AesGcm<Aes256, U32>;

const PREFIX: &str = "ENC[AES256_GCM,";

/// A typed scalar leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    /// Wide enough for every signed and unsigned 64-bit document integer
    Int(i128),
    Float(f64),
    Bool(bool),
    Null,
}

/// The `type:` tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Str,
    Int,
    Float,
    Bool,
    Null,
}

impl ScalarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarKind::Str => "str",
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Bool => "bool",
            ScalarKind::Null => "null",
        }
    }
}

impl FromStr for ScalarKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        match s {
            "str" => Ok(ScalarKind::Str),
            "int" => Ok(ScalarKind::Int),
            "float" => Ok(ScalarKind::Float),
            "bool" => Ok(ScalarKind::Bool),
            "null" => Ok(ScalarKind::Null),
            other => Err(CryptoError::UnknownType(other.to_string())),
        }
    }
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Str(_) => ScalarKind::Str,
            Scalar::Int(_) => ScalarKind::Int,
            Scalar::Float(_) => ScalarKind::Float,
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Null => ScalarKind::Null,
        }
    }

    /// Canonical byte form, shared by the cipher plaintext and the MAC.
    ///
    /// Floats use the shortest round-trip decimal without exponent and
    /// booleans are titlecased, matching files written by sops.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Scalar::Str(s) => s.as_bytes().to_vec(),
            Scalar::Int(i) => i.to_string().into_bytes(),
            Scalar::Float(f) => f.to_string().into_bytes(),
            Scalar::Bool(true) => b"True".to_vec(),
            Scalar::Bool(false) => b"False".to_vec(),
            Scalar::Null => Vec::new(),
        }
    }

    fn parse(kind: ScalarKind, plaintext: &str) -> CryptoResult<Self> {
        let bad = || CryptoError::BadPlaintext {
            kind: kind.as_str(),
            len: plaintext.len(),
        };
        match kind {
            ScalarKind::Str => Ok(Scalar::Str(plaintext.to_string())),
            ScalarKind::Int => plaintext.parse().map(Scalar::Int).map_err(|_| bad()),
            ScalarKind::Float => plaintext.parse().map(Scalar::Float).map_err(|_| bad()),
            ScalarKind::Bool => match plaintext {
                "True" | "true" | "TRUE" | "1" => Ok(Scalar::Bool(true)),
                "False" | "false" | "FALSE" | "0" => Ok(Scalar::Bool(false)),
                _ => Err(bad()),
            },
            ScalarKind::Null => Ok(Scalar::Null),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.canonical_bytes()))
    }
}

/// A parsed `ENC[...]` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub kind: ScalarKind,
}

impl FromStr for Envelope {
    type Err = CryptoError;

    fn from_str(enc: &str) -> CryptoResult<Self> {
        let inner = enc
            .strip_prefix(PREFIX)
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| CryptoError::MalformedEnvelope("missing ENC[AES256_GCM,...] wrapper".into()))?;

        let mut data_b64 = None;
        let mut iv_b64 = None;
        let mut tag_b64 = None;
        let mut kind = None;

        for part in inner.split(',') {
            if let Some(v) = part.strip_prefix("data:") {
                data_b64 = Some(v);
            } else if let Some(v) = part.strip_prefix("iv:") {
                iv_b64 = Some(v);
            } else if let Some(v) = part.strip_prefix("tag:") {
                tag_b64 = Some(v);
            } else if let Some(v) = part.strip_prefix("type:") {
                kind = Some(v);
            } else {
                return Err(CryptoError::MalformedEnvelope(format!("unexpected field {part:?}")));
            }
        }

        let (Some(data_b64), Some(iv_b64), Some(tag_b64), Some(kind)) = (data_b64, iv_b64, tag_b64, kind)
        else {
            return Err(CryptoError::MalformedEnvelope(
                "ENC value missing one of data, iv, tag, type".into(),
            ));
        };

        let decode = |field: &str, v: &str| {
            B64.decode(v)
                .map_err(|e| CryptoError::MalformedEnvelope(format!("base64 decode {field}: {e}")))
        };
        let data = decode("data", data_b64)?;
        let iv = decode("iv", iv_b64)?;
        let tag = decode("tag", tag_b64)?;

        if iv.len() != IV_SIZE {
            return Err(CryptoError::MalformedEnvelope(format!(
                "IV must be {IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::MalformedEnvelope(format!(
                "tag must be {TAG_SIZE} bytes, got {}",
                tag.len()
            )));
        }

        Ok(Envelope {
            data,
            iv,
            tag,
            kind: kind.parse()?,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}data:{},iv:{},tag:{},type:{}]",
            B64.encode(&self.data),
            B64.encode(&self.iv),
            B64.encode(&self.tag),
            self.kind.as_str()
        )
    }
}

/// True if the string looks like a leaf envelope.
pub fn is_envelope(value: &str) -> bool {
    value.starts_with(PREFIX) && value.ends_with(']')
}

/// Encrypt a scalar under the data key with a fresh random IV.
pub fn encrypt_scalar(key: &DataKey, value: &Scalar, aad: &str) -> CryptoResult<String> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    encrypt_scalar_with_iv(key, value, aad, &iv)
}

/// Encrypt a scalar with a caller-supplied IV.
///
/// Only safe when `(key, aad, value)` is identical to the encryption that
/// produced `iv`; used to keep unchanged values byte-identical across
/// re-encryption with a reused data key.
pub fn encrypt_scalar_with_iv(
    key: &DataKey,
    value: &Scalar,
    aad: &str,
    iv: &[u8; IV_SIZE],
) -> CryptoResult<String> {
    let cipher = Aes256Gcm32::new(key.as_bytes().into());
    let plaintext = Zeroizing::new(value.canonical_bytes());

    let mut sealed = cipher
        .encrypt(
            Nonce::<U32>::from_slice(iv),
            Payload {
                msg: &plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    // aes-gcm emits ciphertext || tag
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(Envelope {
        data: sealed,
        iv: iv.to_vec(),
        tag,
        kind: value.kind(),
    }
    .to_string())
}

/// Decrypt an envelope, returning the typed scalar and the IV it used.
///
/// A blank string is accepted as the empty `str` value written by older
/// encoders.
pub fn decrypt_scalar(key: &DataKey, enc: &str, aad: &str) -> CryptoResult<(Scalar, [u8; IV_SIZE])> {
    if enc.is_empty() {
        return Ok((Scalar::Str(String::new()), [0u8; IV_SIZE]));
    }
    let envelope: Envelope = enc.parse().map_err(|e| {
        debug!(aad, error = %e, "rejecting malformed envelope");
        e
    })?;

    let mut ct_with_tag = envelope.data;
    ct_with_tag.extend_from_slice(&envelope.tag);

    let cipher = Aes256Gcm32::new(key.as_bytes().into());
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::<U32>::from_slice(&envelope.iv),
                Payload {
                    msg: &ct_with_tag,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| {
                debug!(aad, "envelope failed authentication");
                CryptoError::Authentication
            })?,
    );

    let text = std::str::from_utf8(&plaintext).map_err(|_| CryptoError::BadPlaintext {
        kind: envelope.kind.as_str(),
        len: plaintext.len(),
    })?;

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&envelope.iv);
    Ok((Scalar::parse(envelope.kind, text)?, iv))
}
