//! leafseal-stores: text formats <-> [`Tree`]
//!
//! A store turns a document into branches (one per YAML document, one for
//! JSON) and moves the metadata block in and out of the top-level `sops`
//! key. Comments are not carried by either format's parser.

pub mod json;
pub mod metadata;
pub mod yaml;

use std::path::Path;
use std::str::FromStr;

use leafseal_core::{SealError, SealResult};
use leafseal_keys::KeyContext;
use leafseal_tree::{Tree, TreeBranch, TreeValue};

pub use json::JsonStore;
pub use metadata::{StoredGroup, StoredMetadata};
pub use yaml::YamlStore;

/// Reads and writes one document format.
pub trait Store: Send + Sync {
    /// Parse a cleartext document. Fails if it already carries metadata.
    fn load_plain_file(&self, input: &[u8]) -> SealResult<Vec<TreeBranch>>;

    /// Parse an encrypted document, rebuilding master keys with `ctx`.
    ///
    /// Returns [`SealError::MetadataNotFound`] when there is no `sops` key.
    fn load_encrypted_file(&self, input: &[u8], ctx: &KeyContext) -> SealResult<Tree>;

    fn emit_encrypted_file(&self, tree: &Tree) -> SealResult<Vec<u8>>;

    fn emit_plain_file(&self, branches: &[TreeBranch]) -> SealResult<Vec<u8>>;

    /// Render a single extracted value. Strings are written raw.
    fn emit_value(&self, value: &TreeValue) -> SealResult<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Pick a format from a file extension; anything unknown is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }

    pub fn store(self) -> Box<dyn Store> {
        match self {
            Format::Yaml => Box::new(YamlStore),
            Format::Json => Box::new(JsonStore),
        }
    }
}

impl FromStr for Format {
    type Err = SealError;

    fn from_str(s: &str) -> SealResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            other => Err(SealError::config(format!("unknown document format {other:?}"))),
        }
    }
}

pub(crate) fn parse_error(format: &str, err: impl std::fmt::Display) -> SealError {
    SealError::config(format!("parsing {format}: {err}"))
}

pub(crate) fn emit_error(format: &str, err: impl std::fmt::Display) -> SealError {
    SealError::config(format!("emitting {format}: {err}"))
}
