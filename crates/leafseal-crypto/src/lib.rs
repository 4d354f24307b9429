//! leafseal-crypto: per-value authenticated encryption and secret splitting
//!
//! Every scalar leaf of a document is sealed independently:
//! ```text
//! Data Key (256-bit, random per document)
//!   ├── Leaf AEAD: AES-256-GCM (key=data_key, iv=random_256bit, AAD=tree path "a:b:0:")
//!   │   └── ENC[AES256_GCM,data:<b64>,iv:<b64>,tag:<b64>,type:<str|int|float|bool|null>]
//!   └── MAC envelope: same cipher over the hex SHA-512 of all leaf values, AAD=""
//! ```
//!
//! The data key is never stored; it is split with Shamir's scheme over
//! GF(2^8) and each share is wrapped by an external master key.

pub mod cipher;
pub mod data_key;
pub mod error;
pub mod shamir;

pub use cipher::{decrypt_scalar, encrypt_scalar, encrypt_scalar_with_iv, is_envelope, Envelope, Scalar, ScalarKind};
pub use data_key::DataKey;
pub use error::{CryptoError, CryptoResult};

/// Size of a data key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the AES-GCM IV used for leaf envelopes (256-bit, sops-compatible)
pub const IV_SIZE: usize = 32;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
