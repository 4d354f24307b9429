//! Encrypt, decrypt, extract and rotate passes over a [`Tree`]
//!
//! Every pass works on a copy of the branches and only writes back once the
//! whole operation has succeeded: key recovery or wrapping, every leaf, and
//! (for decrypt) the MAC check.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use chrono::Utc;
use futures::future::join_all;
use leafseal_core::{SealError, SealResult, VERSION};
use leafseal_crypto::{
    decrypt_scalar, encrypt_scalar, encrypt_scalar_with_iv, is_envelope, shamir, CryptoError,
    DataKey, Scalar, IV_SIZE,
};
use leafseal_keys::{GroupCallOptions, GroupError, KeyGroup, MasterKey};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::mac::{seal_mac, verify_mac, MacHasher};
use crate::metadata::Metadata;
use crate::path::{PathSegment, TreePath};
use crate::rules::EncryptionRules;
use crate::tree::{Tree, TreeBranch, TreeKey, TreeValue};

/// Where the data key of an encrypt pass comes from.
pub enum DataKeyMode {
    /// Generate a new key and re-wrap every group
    Fresh,
    /// Keep the key recovered by a previous decrypt
    Reuse(DataKey),
}

/// IVs seen during decryption, keyed by document index and leaf AAD.
///
/// When the same data key is reused, a leaf whose document, path and
/// plaintext are unchanged is re-encrypted with its old IV, so its envelope
/// is byte-identical. Equal values in different documents never share an
/// IV. Plaintexts are only held as SHA-256 digests.
#[derive(Clone, Default)]
pub struct IvStash {
    entries: HashMap<(usize, String), StashEntry>,
    mac: Option<StashEntry>,
}

#[derive(Clone)]
struct StashEntry {
    digest: [u8; 32],
    iv: [u8; IV_SIZE],
}

impl StashEntry {
    fn new(plaintext: &[u8], iv: [u8; IV_SIZE]) -> Self {
        Self {
            digest: Sha256::digest(plaintext).into(),
            iv,
        }
    }

    fn matching(&self, plaintext: &[u8]) -> Option<&[u8; IV_SIZE]> {
        let digest: [u8; 32] = Sha256::digest(plaintext).into();
        (self.digest == digest).then_some(&self.iv)
    }
}

impl IvStash {
    pub fn record(&mut self, branch: usize, aad: &str, plaintext: &[u8], iv: [u8; IV_SIZE]) {
        self.entries
            .insert((branch, aad.to_string()), StashEntry::new(plaintext, iv));
    }

    pub fn lookup(&self, branch: usize, aad: &str, plaintext: &[u8]) -> Option<&[u8; IV_SIZE]> {
        self.entries
            .get(&(branch, aad.to_string()))?
            .matching(plaintext)
    }

    pub fn record_mac(&mut self, digest: &str, iv: [u8; IV_SIZE]) {
        self.mac = Some(StashEntry::new(digest.as_bytes(), iv));
    }

    pub fn lookup_mac(&self, digest: &str) -> Option<&[u8; IV_SIZE]> {
        self.mac.as_ref()?.matching(digest.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.mac.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn merge(&mut self, other: IvStash) {
        self.entries.extend(other.entries);
    }
}

impl fmt::Debug for IvStash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IvStash")
            .field("entries", &self.entries.len())
            .finish()
    }
}

pub struct EncryptOptions {
    pub data_key: DataKeyMode,
    /// Only consulted with [`DataKeyMode::Reuse`]
    pub iv_stash: Option<IvStash>,
    pub group: GroupCallOptions,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            data_key: DataKeyMode::Fresh,
            iv_stash: None,
            group: GroupCallOptions::default(),
        }
    }
}

impl EncryptOptions {
    /// Re-encrypt with the key and IVs recovered by a decrypt pass.
    pub fn reuse(decrypted: Decrypted, group: GroupCallOptions) -> Self {
        Self {
            data_key: DataKeyMode::Reuse(decrypted.data_key),
            iv_stash: Some(decrypted.iv_stash),
            group,
        }
    }
}

#[derive(Default)]
pub struct DecryptOptions {
    /// Skip MAC verification (logged)
    pub ignore_mac: bool,
    pub group: GroupCallOptions,
    pub cancel: Option<CancellationToken>,
}

/// Result of a successful decrypt pass.
#[derive(Debug)]
pub struct Decrypted {
    pub data_key: DataKey,
    pub iv_stash: IvStash,
}

#[derive(Default)]
pub struct RotateOptions {
    pub decrypt: DecryptOptions,
    /// Keys to add, by key-group index
    pub add_keys: Vec<(usize, Box<dyn MasterKey>)>,
    /// Identifiers of keys to drop from every group
    pub remove_keys: Vec<String>,
}

fn aad(path: &[String]) -> String {
    let mut out = String::new();
    for segment in path {
        out.push_str(segment);
        out.push(':');
    }
    out
}

/// Depth-first walk calling `visit(leaf, aad, encrypt)` for every scalar.
fn visit_leaves<F>(
    branch: &mut TreeBranch,
    path: &mut Vec<String>,
    encrypt: bool,
    rules: &EncryptionRules,
    visit: &mut F,
) -> SealResult<()>
where
    F: FnMut(&mut Scalar, &str, bool) -> SealResult<()>,
{
    for item in branch.items.iter_mut() {
        let (segment, in_scope) = match &item.key {
            TreeKey::Comment => continue,
            TreeKey::Name(name) => (name.clone(), rules.descend(encrypt, name)),
            TreeKey::Index(index) => (index.to_string(), encrypt),
        };
        path.push(segment);
        match &mut item.value {
            TreeValue::Scalar(value) => visit(value, &aad(path), in_scope)?,
            TreeValue::Mapping(child) | TreeValue::Sequence(child) => {
                visit_leaves(child, path, in_scope, rules, visit)?
            }
            TreeValue::Comment(_) => {}
        }
        path.pop();
    }
    Ok(())
}

fn leaf_error(aad: &str, err: CryptoError) -> SealError {
    SealError::Authentication {
        path: aad.to_string(),
        message: err.to_string(),
    }
}

/// Encrypt every in-scope leaf of `branch`; returns its MAC byte stream.
fn encrypt_branch(
    index: usize,
    branch: &mut TreeBranch,
    rules: &EncryptionRules,
    key: &DataKey,
    stash: Option<&IvStash>,
) -> SealResult<Zeroizing<Vec<u8>>> {
    let mut stream = Zeroizing::new(Vec::new());
    visit_leaves(branch, &mut Vec::new(), rules.root(), rules, &mut |value, aad, encrypt| {
        let plaintext = Zeroizing::new(value.canonical_bytes());
        if encrypt || !rules.mac_only_encrypted() {
            stream.extend_from_slice(&plaintext);
        }
        if !encrypt {
            return Ok(());
        }
        if matches!(value, Scalar::Str(s) if is_envelope(s)) {
            return Err(SealError::config(format!("value at {aad} is already encrypted")));
        }
        let sealed = match stash.and_then(|s| s.lookup(index, aad, &plaintext)) {
            Some(iv) => encrypt_scalar_with_iv(key, value, aad, iv),
            None => encrypt_scalar(key, value, aad),
        }
        .map_err(|e| SealError::Other(anyhow::anyhow!("encrypting {aad}: {e}")))?;
        *value = Scalar::Str(sealed);
        Ok(())
    })?;
    Ok(stream)
}

/// Decrypt one in-scope leaf in place. Returns the IV, or `None` for a
/// legacy blank value.
fn open_leaf(value: &mut Scalar, aad: &str, key: &DataKey) -> SealResult<Option<[u8; IV_SIZE]>> {
    let Scalar::Str(enc) = value else {
        return Err(SealError::Authentication {
            path: aad.to_string(),
            message: "expected an encrypted value".into(),
        });
    };
    let legacy_blank = enc.is_empty();
    let (plain, iv) = decrypt_scalar(key, enc, aad).map_err(|e| leaf_error(aad, e))?;
    *value = plain;
    Ok((!legacy_blank).then_some(iv))
}

fn decrypt_branch(
    index: usize,
    branch: &mut TreeBranch,
    rules: &EncryptionRules,
    key: &DataKey,
) -> SealResult<(Zeroizing<Vec<u8>>, IvStash)> {
    let mut stream = Zeroizing::new(Vec::new());
    let mut stash = IvStash::default();
    visit_leaves(branch, &mut Vec::new(), rules.root(), rules, &mut |value, aad, encrypt| {
        if !encrypt {
            if !rules.mac_only_encrypted() {
                stream.extend_from_slice(&value.canonical_bytes());
            }
            return Ok(());
        }
        let iv = open_leaf(value, aad, key)?;
        let plaintext = Zeroizing::new(value.canonical_bytes());
        if let Some(iv) = iv {
            stash.record(index, aad, &plaintext, iv);
        }
        stream.extend_from_slice(&plaintext);
        Ok(())
    })?;
    Ok((stream, stash))
}

async fn cancellable<T>(
    cancel: Option<&CancellationToken>,
    fut: impl Future<Output = SealResult<T>>,
) -> SealResult<T> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(SealError::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> SealResult<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(SealError::Cancelled),
        _ => Ok(()),
    }
}

/// Recover the data key from the key groups (AND of groups by default).
async fn recover_data_key(metadata: &Metadata, opts: &GroupCallOptions) -> SealResult<DataKey> {
    metadata.validate()?;
    let results = join_all(
        metadata
            .key_groups
            .iter()
            .map(|group| group.decrypt_data_key(opts)),
    )
    .await;

    let mut secrets = Vec::new();
    let mut failures = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(secret) => secrets.push(secret),
            Err(e) => {
                warn!(group = index, error = %e, "key group could not recover its share");
                failures.push(format!("group {index}: {e}"));
            }
        }
    }

    let need = metadata.data_key_threshold();
    if secrets.len() < need {
        return Err(SealError::GroupUnrecoverable(format!(
            "no key groups could decrypt the data key ({} of {need} required groups succeeded)\n{}",
            secrets.len(),
            failures.join("\n")
        )));
    }

    let raw = if metadata.key_groups.len() == 1 {
        secrets
            .pop()
            .ok_or_else(|| SealError::GroupUnrecoverable("no group secret recovered".into()))?
    } else {
        shamir::combine(&secrets)
            .map_err(|e| SealError::GroupUnrecoverable(format!("combining group shares: {e}")))?
    };
    DataKey::from_slice(&raw)
        .map_err(|e| SealError::GroupUnrecoverable(format!("recovered data key: {e}")))
}

fn encrypt_failure(failures: Vec<(usize, GroupError)>) -> SealError {
    let key = failures
        .iter()
        .flat_map(|(_, e)| e.failures().iter().map(|f| f.key.clone()))
        .collect::<Vec<_>>()
        .join(", ");
    let message = failures
        .iter()
        .map(|(index, e)| format!("group {index}: {e}"))
        .collect::<Vec<_>>()
        .join("\n");
    SealError::Backend { key, message }
}

/// Split the data key across groups and wrap it, restoring every previous
/// wrap if any group fails.
async fn wrap_data_key(
    metadata: &mut Metadata,
    data_key: &DataKey,
    fresh: bool,
    opts: &GroupCallOptions,
) -> SealResult<()> {
    let group_count = metadata.key_groups.len();
    let shares = shamir::split(data_key.as_bytes(), group_count, metadata.data_key_threshold())
        .map_err(|e| SealError::config(format!("splitting data key: {e}")))?;
    // group shares of different splits cannot be mixed
    let force = fresh
        || (group_count > 1 && metadata.key_groups.iter().any(|g| !g.is_fully_wrapped()));
    let snapshot: Vec<Vec<Vec<u8>>> = metadata.key_groups.iter().map(KeyGroup::wraps).collect();

    let results = join_all(metadata.key_groups.iter_mut().zip(shares.iter()).map(
        |(group, share)| async move {
            if force {
                group.rewrap(share, opts).await
            } else {
                group.encrypt_data_key(share, opts).await
            }
        },
    ))
    .await;

    let failures: Vec<(usize, GroupError)> = results
        .into_iter()
        .enumerate()
        .filter_map(|(index, result)| result.err().map(|e| (index, e)))
        .collect();
    if failures.is_empty() {
        return Ok(());
    }
    for (group, wraps) in metadata.key_groups.iter_mut().zip(snapshot) {
        group.restore_wraps(wraps);
    }
    Err(encrypt_failure(failures))
}

/// Decrypt a copy of the tree's branches and verify the MAC.
async fn open(tree: &Tree, opts: &DecryptOptions) -> SealResult<(Vec<TreeBranch>, Decrypted)> {
    let cancel = opts.cancel.as_ref();
    let rules = EncryptionRules::from_config(&tree.metadata.rules)?;
    let data_key = cancellable(cancel, recover_data_key(&tree.metadata, &opts.group)).await?;
    check_cancelled(cancel)?;

    let mut branches = tree.branches.clone();
    let results: Vec<(Zeroizing<Vec<u8>>, IvStash)> = branches
        .par_iter_mut()
        .enumerate()
        .map(|(index, branch)| decrypt_branch(index, branch, &rules, &data_key))
        .collect::<SealResult<_>>()?;

    let mut hasher = MacHasher::new();
    let mut iv_stash = IvStash::default();
    for (stream, partial) in results {
        hasher.update(&stream);
        iv_stash.merge(partial);
    }
    let digest = hasher.finish();
    match verify_mac(&data_key, &tree.metadata.mac, &digest, &mut iv_stash) {
        Ok(()) => debug!("MAC verified"),
        Err(e) if opts.ignore_mac => {
            warn!(error = %e, "MAC verification failed, ignored on request")
        }
        Err(e) => return Err(e),
    }
    check_cancelled(cancel)?;

    Ok((branches, Decrypted { data_key, iv_stash }))
}

/// Encrypt a copy of `cleartext` and wrap the data key; returns the sealed
/// branches and MAC envelope.
async fn seal(
    metadata: &mut Metadata,
    cleartext: &[TreeBranch],
    opts: EncryptOptions,
) -> SealResult<(Vec<TreeBranch>, String)> {
    metadata.validate()?;
    let rules = EncryptionRules::from_config(&metadata.rules)?;
    let EncryptOptions {
        data_key,
        iv_stash,
        group,
    } = opts;
    let (data_key, fresh, iv_stash) = match data_key {
        DataKeyMode::Fresh => (DataKey::generate(), true, None),
        DataKeyMode::Reuse(key) => (key, false, iv_stash),
    };
    let stash = iv_stash.as_ref();

    let mut branches = cleartext.to_vec();
    let streams: Vec<Zeroizing<Vec<u8>>> = branches
        .par_iter_mut()
        .enumerate()
        .map(|(index, branch)| encrypt_branch(index, branch, &rules, &data_key, stash))
        .collect::<SealResult<_>>()?;

    let mut hasher = MacHasher::new();
    for stream in &streams {
        hasher.update(stream);
    }
    let mac = seal_mac(&data_key, &hasher.finish(), stash)?;

    wrap_data_key(metadata, &data_key, fresh, &group).await?;
    Ok((branches, mac))
}

fn commit_encrypted(tree: &mut Tree, branches: Vec<TreeBranch>, mac: String) {
    tree.branches = branches;
    tree.metadata.mac = mac;
    tree.metadata.last_modified = Some(Utc::now());
    tree.metadata.version = VERSION.to_string();
}

/// Encrypt every in-scope leaf and wrap the data key under every group.
///
/// On failure the tree, its MAC, and every master key's previous wrap are
/// left as they were.
pub async fn encrypt_tree(tree: &mut Tree, opts: EncryptOptions) -> SealResult<()> {
    let (branches, mac) = seal(&mut tree.metadata, &tree.branches, opts).await?;
    commit_encrypted(tree, branches, mac);
    info!(
        branches = tree.branches.len(),
        groups = tree.metadata.key_groups.len(),
        "tree encrypted"
    );
    Ok(())
}

/// Recover the data key, decrypt every leaf, and verify the MAC.
pub async fn decrypt_tree(tree: &mut Tree, opts: DecryptOptions) -> SealResult<Decrypted> {
    let (branches, decrypted) = open(tree, &opts).await?;
    tree.branches = branches;
    info!(branches = tree.branches.len(), "tree decrypted");
    Ok(decrypted)
}

/// Insert or replace the value at `path` in the first branch and re-encrypt
/// with the same data key. Envelopes of unchanged leaves stay
/// byte-identical; the key groups are not called again.
pub async fn set_value(
    tree: &mut Tree,
    path: &TreePath,
    value: TreeValue,
    opts: DecryptOptions,
) -> SealResult<()> {
    let (mut cleartext, decrypted) = open(tree, &opts).await?;
    cleartext
        .first_mut()
        .ok_or_else(|| SealError::PathNotFound(path.to_string()))?
        .set(path, value)?;
    check_cancelled(opts.cancel.as_ref())?;

    let encrypt = EncryptOptions::reuse(decrypted, opts.group.clone());
    let (branches, mac) = seal(&mut tree.metadata, &cleartext, encrypt).await?;
    commit_encrypted(tree, branches, mac);
    info!(path = %path, "value set");
    Ok(())
}

/// Decrypt only the value at `path` in the first branch. The MAC is not
/// checked; the tree itself is not modified.
pub async fn extract(tree: &Tree, path: &TreePath, opts: DecryptOptions) -> SealResult<TreeValue> {
    let rules = EncryptionRules::from_config(&tree.metadata.rules)?;
    let root = tree
        .branches
        .first()
        .ok_or_else(|| SealError::PathNotFound(path.to_string()))?;
    let mut value = root.truncate(path)?.clone();

    let cancel = opts.cancel.as_ref();
    let data_key = cancellable(cancel, recover_data_key(&tree.metadata, &opts.group)).await?;
    check_cancelled(cancel)?;

    let mut in_scope = rules.root();
    let mut segments = Vec::with_capacity(path.segments().len());
    for segment in path.segments() {
        match segment {
            PathSegment::Key(key) => {
                in_scope = rules.descend(in_scope, key);
                segments.push(key.clone());
            }
            PathSegment::Index(index) => segments.push(index.to_string()),
        }
    }

    match &mut value {
        TreeValue::Scalar(scalar) if in_scope => {
            open_leaf(scalar, &aad(&segments), &data_key)?;
        }
        TreeValue::Mapping(branch) | TreeValue::Sequence(branch) => {
            visit_leaves(branch, &mut segments, in_scope, &rules, &mut |leaf, aad, encrypt| {
                if encrypt {
                    open_leaf(leaf, aad, &data_key)?;
                }
                Ok(())
            })?;
        }
        _ => {}
    }
    debug!(path = %path, "extracted value");
    Ok(value)
}

/// True when any master key of any group is due for rotation.
pub fn needs_rotation(tree: &Tree) -> bool {
    tree.metadata.needs_rotation()
}

/// Structural changes made by a rotation, kept so they can be reverted.
struct RotationUndo {
    wraps: Vec<Vec<Vec<u8>>>,
    added: Vec<usize>,
    removed: Vec<(usize, Vec<(usize, Box<dyn MasterKey>)>)>,
}

impl RotationUndo {
    fn new(groups: &[KeyGroup]) -> Self {
        Self {
            wraps: groups.iter().map(KeyGroup::wraps).collect(),
            added: vec![0; groups.len()],
            removed: Vec::new(),
        }
    }

    fn apply(
        &mut self,
        groups: &mut [KeyGroup],
        add_keys: Vec<(usize, Box<dyn MasterKey>)>,
        remove_keys: &[String],
    ) -> SealResult<()> {
        for id in remove_keys {
            let mut found = false;
            for (index, group) in groups.iter_mut().enumerate() {
                let removed = group.remove_key(id)?;
                if !removed.is_empty() {
                    found = true;
                    self.removed.push((index, removed));
                }
            }
            if !found {
                return Err(SealError::config(format!("no master key {id} in any key group")));
            }
            info!(key = %id, "removing master key");
        }
        for (index, key) in add_keys {
            let group = groups.get_mut(index).ok_or_else(|| {
                SealError::config(format!("key group {index} does not exist"))
            })?;
            info!(key = %key, group = index, "adding master key");
            self.added[index] += 1;
            group.add_key(key)?;
        }
        Ok(())
    }

    fn revert(self, groups: &mut [KeyGroup]) {
        for (group, added) in groups.iter_mut().zip(&self.added) {
            let len = group.len() - added;
            group.truncate_keys(len);
        }
        for (index, removed) in self.removed.into_iter().rev() {
            groups[index].restore_removed(removed);
        }
        for (group, wraps) in groups.iter_mut().zip(self.wraps) {
            group.restore_wraps(wraps);
        }
    }
}

/// Decrypt, apply key additions and removals, then encrypt under a fresh
/// data key with every group re-wrapped.
pub async fn rotate_tree(tree: &mut Tree, opts: RotateOptions) -> SealResult<()> {
    let RotateOptions {
        decrypt,
        add_keys,
        remove_keys,
    } = opts;
    let (cleartext, _previous) = open(tree, &decrypt).await?;

    let mut undo = RotationUndo::new(&tree.metadata.key_groups);
    if let Err(e) = undo.apply(&mut tree.metadata.key_groups, add_keys, &remove_keys) {
        undo.revert(&mut tree.metadata.key_groups);
        return Err(e);
    }

    let encrypt = EncryptOptions {
        data_key: DataKeyMode::Fresh,
        iv_stash: None,
        group: decrypt.group.clone(),
    };
    match seal(&mut tree.metadata, &cleartext, encrypt).await {
        Ok((branches, mac)) => {
            commit_encrypted(tree, branches, mac);
            info!(groups = tree.metadata.key_groups.len(), "data key rotated");
            Ok(())
        }
        Err(e) => {
            undo.revert(&mut tree.metadata.key_groups);
            Err(e)
        }
    }
}
