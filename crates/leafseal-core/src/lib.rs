//! leafseal-core: shared error taxonomy, configuration schema, and constants
//! used by every other leafseal crate.

pub mod config;
pub mod error;

pub use config::{EncryptFailurePolicy, LeafsealConfig, RulesConfig};
pub use error::{SealError, SealResult};

/// Name of the metadata block stored alongside the encrypted document.
pub const METADATA_KEY: &str = "sops";

/// Default suffix a key has to end with for its value to stay in cleartext.
pub const DEFAULT_UNENCRYPTED_SUFFIX: &str = "_unencrypted";

/// Version string written into `metadata.version` on every encrypt pass.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
