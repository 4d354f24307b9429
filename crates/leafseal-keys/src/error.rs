use std::fmt;
use std::time::Duration;

use leafseal_core::SealError;
use leafseal_crypto::shamir::ShamirError;
use thiserror::Error;

pub type KeyResult<T> = Result<T, KeyError>;

/// Failure of a single master key (network, credential, or local key issue).
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no identity available: {0}")]
    NoIdentity(String),

    #[error("encrypt failed: {0}")]
    Encrypt(String),

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("no encrypted data key stored")]
    NotWrapped,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("metadata entry is missing field '{0}'")]
    MissingField(&'static str),

    #[error("unknown master key type '{0}'")]
    UnknownType(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One master key's failure, kept for diagnostics.
#[derive(Debug)]
pub struct KeyFailure {
    pub key: String,
    pub error: KeyError,
}

impl fmt::Display for KeyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.error)
    }
}

/// A key group could not reach its threshold.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("{}", describe(operation, *need, *have, failures))]
    Threshold {
        operation: &'static str,
        need: usize,
        have: usize,
        failures: Vec<KeyFailure>,
    },

    #[error("combining shares failed: {0}")]
    Shamir(#[from] ShamirError),
}

fn describe(operation: &str, need: usize, have: usize, failures: &[KeyFailure]) -> String {
    let mut msg = format!(
        "key group could not {operation} its share: {have} of {need} required master keys succeeded"
    );
    for failure in failures {
        msg.push_str("\n\t");
        msg.push_str(&failure.to_string());
    }
    msg
}

impl GroupError {
    pub fn failures(&self) -> &[KeyFailure] {
        match self {
            GroupError::Threshold { failures, .. } => failures,
            GroupError::Shamir(_) => &[],
        }
    }
}

impl From<GroupError> for SealError {
    fn from(err: GroupError) -> Self {
        match &err {
            GroupError::Threshold {
                operation: "encrypt",
                failures,
                ..
            } => SealError::Backend {
                key: failures
                    .iter()
                    .map(|f| f.key.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                message: err.to_string(),
            },
            _ => SealError::GroupUnrecoverable(err.to_string()),
        }
    }
}
