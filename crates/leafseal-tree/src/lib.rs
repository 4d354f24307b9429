//! leafseal-tree: the generic document tree and the engine that encrypts it
//!
//! ```text
//! Tree ── branches: [TreeBranch]   (one per document root)
//!   │       └── items: [TreeItem { key: Name | Index | Comment, value }]
//!   └── metadata: key groups, MAC, rules, version, last_modified
//! ```
//!
//! Every in-scope scalar leaf is sealed with the data key under the AAD of
//! its path; the MAC covers all leaf values in document order.

pub mod mac;
pub mod metadata;
pub mod path;
pub mod rules;
pub mod tree;
pub mod walker;

pub use metadata::Metadata;
pub use path::{PathSegment, TreePath};
pub use rules::EncryptionRules;
pub use tree::{Tree, TreeBranch, TreeItem, TreeKey, TreeValue};
pub use walker::{
    decrypt_tree, encrypt_tree, extract, needs_rotation, rotate_tree, set_value, DataKeyMode,
    DecryptOptions, Decrypted, EncryptOptions, IvStash, RotateOptions,
};
