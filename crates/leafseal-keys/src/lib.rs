//! leafseal-keys: master keys and key groups
//!
//! A master key wraps one share of the data key. Keys are organised into
//! groups: inside a group any `threshold` of N keys recover the group
//! secret; across groups the group secrets are themselves Shamir shares of
//! the data key (by default every group is required).
//!
//! Backends:
//!   - `age`: X25519 age recipients, armored ciphertext
//!   - `box`: X25519 + XSalsa20-Poly1305 with a per-wrap ephemeral keypair

pub mod age;
pub mod error;
pub mod group;
pub mod master_key;
pub mod naclbox;

pub use error::{GroupError, KeyError, KeyFailure, KeyResult};
pub use group::{GroupCallOptions, KeyGroup};
pub use master_key::{master_key_from_map, KeyContext, KeyMap, MasterKey};
