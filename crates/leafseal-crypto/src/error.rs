use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch: tampered ciphertext, wrong key, or wrong path.
    #[error("AES-256-GCM authentication failed (wrong key, tampered value, or moved value)")]
    Authentication,

    #[error("malformed ENC value: {0}")]
    MalformedEnvelope(String),

    #[error("unknown value type: {0}")]
    UnknownType(String),

    #[error("decrypted {kind} value ({len} bytes) cannot be parsed")]
    BadPlaintext { kind: &'static str, len: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error(transparent)]
    Shamir(#[from] crate::shamir::ShamirError),
}
