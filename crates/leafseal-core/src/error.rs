use thiserror::Error;

pub type SealResult<T> = Result<T, SealError>;

/// Top-level error taxonomy shared by the engine and its callers.
///
/// Backend failures are aggregated at the key-group level and only surface
/// here as `Backend` (encrypt side) or `GroupUnrecoverable` (decrypt side).
#[derive(Debug, Error)]
pub enum SealError {
    /// A single master key failed and the failure could not be absorbed.
    #[error("master key {key}: {message}")]
    Backend { key: String, message: String },

    /// Fewer than `threshold` master keys succeeded in one or more groups.
    #[error("{0}")]
    GroupUnrecoverable(String),

    /// AEAD tag or path mismatch on a leaf value.
    #[error("authentication failed at '{path}': {message}")]
    Authentication { path: String, message: String },

    /// The recomputed MAC does not match the stored one.
    #[error("MAC mismatch: document was modified after it was last encrypted")]
    MacMismatch,

    #[error("config error: {0}")]
    Config(String),

    #[error("path {0} not found in tree")]
    PathNotFound(String),

    /// The document carries no metadata block at all.
    #[error("sops metadata not found")]
    MetadataNotFound,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SealError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the one error class collaborating tooling treats as a
    /// cleartext passthrough signal.
    pub fn is_metadata_not_found(&self) -> bool {
        matches!(self, Self::MetadataNotFound)
    }

    /// True when the failure signals tampering or a wrong key, as opposed
    /// to backend availability.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::MacMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SealError::MetadataNotFound.is_metadata_not_found());
        assert!(!SealError::MacMismatch.is_metadata_not_found());
        assert!(SealError::MacMismatch.is_authentication());
        assert!(SealError::Authentication {
            path: "a:".into(),
            message: "bad tag".into()
        }
        .is_authentication());
        assert!(!SealError::GroupUnrecoverable("x".into()).is_authentication());
    }

    #[test]
    fn test_display_names_key() {
        let err = SealError::Backend {
            key: "age1abc".into(),
            message: "no identity".into(),
        };
        assert_eq!(err.to_string(), "master key age1abc: no identity");
    }
}
