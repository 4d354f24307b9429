//! Tree MAC: SHA-512 over the canonical bytes of every hashed leaf, in
//! document order, stored as an encrypted uppercase-hex `str` envelope.

use leafseal_core::{SealError, SealResult};
use leafseal_crypto::{decrypt_scalar, encrypt_scalar, encrypt_scalar_with_iv, DataKey, Scalar};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

use crate::walker::IvStash;

/// AAD used for the MAC envelope. Leaf AADs always end in `:`, so this
/// never collides with a leaf path.
pub const MAC_AAD: &str = "";

#[derive(Default)]
pub struct MacHasher {
    hasher: Sha512,
}

impl MacHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Uppercase hex digest.
    pub fn finish(self) -> String {
        hex::encode_upper(self.hasher.finalize())
    }
}

/// Encrypt a digest for `metadata.mac`, reusing the stashed IV when the
/// digest is unchanged.
pub fn seal_mac(key: &DataKey, digest: &str, stash: Option<&IvStash>) -> SealResult<String> {
    let value = Scalar::Str(digest.to_string());
    let sealed = match stash.and_then(|s| s.lookup_mac(digest)) {
        Some(iv) => encrypt_scalar_with_iv(key, &value, MAC_AAD, iv),
        None => encrypt_scalar(key, &value, MAC_AAD),
    };
    sealed.map_err(|e| SealError::Authentication {
        path: "mac".into(),
        message: e.to_string(),
    })
}

/// Decrypt the stored MAC and compare it with `digest` in constant time.
/// Records the MAC's IV in `stash` on success.
pub fn verify_mac(
    key: &DataKey,
    stored: &str,
    digest: &str,
    stash: &mut IvStash,
) -> SealResult<()> {
    if stored.is_empty() {
        return Err(SealError::MacMismatch);
    }
    let (value, iv) = decrypt_scalar(key, stored, MAC_AAD).map_err(|e| {
        SealError::Authentication {
            path: "mac".into(),
            message: e.to_string(),
        }
    })?;
    let Scalar::Str(expected) = value else {
        return Err(SealError::MacMismatch);
    };
    if !bool::from(expected.as_bytes().ct_eq(digest.as_bytes())) {
        return Err(SealError::MacMismatch);
    }
    stash.record_mac(digest, iv);
    Ok(())
}
