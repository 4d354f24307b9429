use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use leafseal_core::{EncryptFailurePolicy, SealError};
use leafseal_crypto::Scalar;
use leafseal_keys::naclbox::{BoxKeyFile, BoxMasterKey};
use leafseal_keys::{GroupCallOptions, KeyContext, KeyError, KeyGroup, KeyMap, KeyResult, MasterKey};
use leafseal_tree::{
    decrypt_tree, encrypt_tree, rotate_tree, DecryptOptions, EncryptOptions, Metadata,
    RotateOptions, Tree, TreeBranch, TreeItem, TreePath, TreeValue,
};
use zeroize::Zeroizing;

/// Box key whose encrypt and decrypt can be made to fail on demand.
struct Switchable {
    inner: BoxMasterKey,
    fail_encrypt: Arc<AtomicBool>,
    fail_decrypt: Arc<AtomicBool>,
}

#[derive(Clone)]
struct Switches {
    id: String,
    fail_encrypt: Arc<AtomicBool>,
    fail_decrypt: Arc<AtomicBool>,
}

impl Switches {
    fn encrypt_fails(&self, on: bool) {
        self.fail_encrypt.store(on, Ordering::SeqCst);
    }

    fn decrypt_fails(&self, on: bool) {
        self.fail_decrypt.store(on, Ordering::SeqCst);
    }
}

impl fmt::Display for Switchable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

#[async_trait]
impl MasterKey for Switchable {
    fn key_type(&self) -> &'static str {
        self.inner.key_type()
    }

    fn encrypted_data_key(&self) -> &[u8] {
        self.inner.encrypted_data_key()
    }

    fn set_encrypted_data_key(&mut self, enc: Vec<u8>) {
        self.inner.set_encrypted_data_key(enc)
    }

    async fn encrypt(&mut self, share: &[u8]) -> KeyResult<()> {
        if self.fail_encrypt.load(Ordering::SeqCst) {
            return Err(KeyError::Encrypt("backend unavailable".into()));
        }
        self.inner.encrypt(share).await
    }

    async fn decrypt(&self) -> KeyResult<Zeroizing<Vec<u8>>> {
        if self.fail_decrypt.load(Ordering::SeqCst) {
            return Err(KeyError::Decrypt("backend unavailable".into()));
        }
        self.inner.decrypt().await
    }

    fn needs_rotation(&self) -> bool {
        self.inner.needs_rotation()
    }

    fn to_map(&self) -> KeyMap {
        self.inner.to_map()
    }
}

fn key() -> (Box<dyn MasterKey>, Switches) {
    let file = BoxKeyFile::generate();
    let inner = BoxMasterKey::new(&file.public_key, &KeyContext::default())
        .unwrap()
        .with_secret(file.secret_key().unwrap());
    let switches = Switches {
        id: inner.to_string(),
        fail_encrypt: Arc::new(AtomicBool::new(false)),
        fail_decrypt: Arc::new(AtomicBool::new(false)),
    };
    let key = Switchable {
        inner,
        fail_encrypt: switches.fail_encrypt.clone(),
        fail_decrypt: switches.fail_decrypt.clone(),
    };
    (Box::new(key), switches)
}

fn keys(n: usize) -> (Vec<Box<dyn MasterKey>>, Vec<Switches>) {
    (0..n).map(|_| key()).unzip()
}

fn document() -> TreeBranch {
    TreeBranch::from_iter([
        TreeItem::named("a", "hello"),
        TreeItem::named("b", "world"),
        TreeItem::named(
            "db",
            TreeBranch::from_iter([
                TreeItem::named("user", "admin"),
                TreeItem::named("port", 5432i64),
            ]),
        ),
    ])
}

fn tolerant() -> GroupCallOptions {
    GroupCallOptions {
        policy: EncryptFailurePolicy::RequireGroupThreshold,
        ..Default::default()
    }
}

fn envelope(tree: &Tree, raw: &str) -> String {
    match tree.branches[0].truncate(&TreePath::parse(raw).unwrap()).unwrap() {
        TreeValue::Scalar(Scalar::Str(s)) => s.clone(),
        other => panic!("expected an envelope, got {other:?}"),
    }
}

fn set(tree: &mut Tree, name: &str, value: String) {
    *tree.branches[0].get_mut(name).unwrap() = TreeValue::from(value);
}

#[tokio::test]
async fn swapped_envelopes_fail_authentication() {
    let (group_keys, _) = keys(1);
    let group = KeyGroup::new(group_keys, None).unwrap();
    let mut tree = Tree::new(vec![document()], Metadata::new(vec![group]));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();

    let a = envelope(&tree, r#"["a"]"#);
    let b = envelope(&tree, r#"["b"]"#);
    set(&mut tree, "a", b);
    set(&mut tree, "b", a);

    let err = decrypt_tree(&mut tree, DecryptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SealError::Authentication { ref path, .. } if path == "a:"));
    assert!(err.is_authentication());
}

#[tokio::test]
async fn tampered_ciphertext_is_rejected_without_partial_output() {
    let (group_keys, _) = keys(1);
    let group = KeyGroup::new(group_keys, None).unwrap();
    let mut tree = Tree::new(vec![document()], Metadata::new(vec![group]));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();

    let b = envelope(&tree, r#"["b"]"#);
    let data_start = b.find("data:").unwrap() + "data:".len();
    let mut tampered = b.into_bytes();
    tampered[data_start] = if tampered[data_start] == b'A' { b'B' } else { b'A' };
    set(&mut tree, "b", String::from_utf8(tampered).unwrap());
    let before = tree.branches.clone();

    assert!(decrypt_tree(&mut tree, DecryptOptions::default())
        .await
        .unwrap_err()
        .is_authentication());
    assert_eq!(tree.branches, before);
}

#[tokio::test]
async fn one_of_two_failing_on_encrypt() {
    let (group_keys, switches) = keys(2);
    let group = KeyGroup::new(group_keys, Some(1)).unwrap();
    let mut tree = Tree::new(vec![document()], Metadata::new(vec![group]));
    switches[1].encrypt_fails(true);

    let err = encrypt_tree(&mut tree, EncryptOptions::default())
        .await
        .unwrap_err();
    match err {
        SealError::Backend { key, .. } => assert_eq!(key, switches[1].id),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tree.branches[0], document());
    assert!(tree.metadata.mac.is_empty());
    assert!(tree.metadata.key_groups[0]
        .wraps()
        .iter()
        .all(|w| w.is_empty()));

    let opts = EncryptOptions {
        group: tolerant(),
        ..Default::default()
    };
    encrypt_tree(&mut tree, opts).await.unwrap();
    let wraps = tree.metadata.key_groups[0].wraps();
    assert!(!wraps[0].is_empty());
    assert!(wraps[1].is_empty());

    decrypt_tree(&mut tree, DecryptOptions::default()).await.unwrap();
    assert_eq!(tree.branches[0], document());
}

#[tokio::test]
async fn group_threshold_tolerates_missing_keys_on_decrypt() {
    let (group_keys, switches) = keys(3);
    let group = KeyGroup::new(group_keys, Some(2)).unwrap();
    let mut tree = Tree::new(vec![document()], Metadata::new(vec![group]));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();
    let sealed = tree.branches.clone();

    switches[0].decrypt_fails(true);
    decrypt_tree(&mut tree, DecryptOptions::default()).await.unwrap();
    assert_eq!(tree.branches[0], document());

    tree.branches = sealed;
    switches[1].decrypt_fails(true);
    let err = decrypt_tree(&mut tree, DecryptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SealError::GroupUnrecoverable(_)));
    assert!(err.to_string().contains(&switches[0].id));
}

#[tokio::test]
async fn groups_need_data_key_threshold() {
    let mut switches = Vec::new();
    let groups = (0..3)
        .map(|_| {
            let (group_keys, s) = keys(1);
            switches.extend(s);
            KeyGroup::new(group_keys, None).unwrap()
        })
        .collect();
    let metadata = Metadata::new(groups).with_data_key_threshold(Some(2));
    let mut tree = Tree::new(vec![document()], metadata);
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();
    let sealed = tree.branches.clone();

    switches[2].decrypt_fails(true);
    decrypt_tree(&mut tree, DecryptOptions::default()).await.unwrap();
    assert_eq!(tree.branches[0], document());

    tree.branches = sealed;
    switches[0].decrypt_fails(true);
    let err = decrypt_tree(&mut tree, DecryptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SealError::GroupUnrecoverable(_)));
}

#[tokio::test]
async fn every_group_is_required_by_default() {
    let mut switches = Vec::new();
    let groups = (0..2)
        .map(|_| {
            let (group_keys, s) = keys(1);
            switches.extend(s);
            KeyGroup::new(group_keys, None).unwrap()
        })
        .collect();
    let mut tree = Tree::new(vec![document()], Metadata::new(groups));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();

    switches[1].decrypt_fails(true);
    assert!(matches!(
        decrypt_tree(&mut tree, DecryptOptions::default()).await,
        Err(SealError::GroupUnrecoverable(_))
    ));
}

#[tokio::test]
async fn rotation_replaces_key_and_data_key() {
    let (group_keys, switches) = keys(2);
    let group = KeyGroup::new(group_keys, Some(1)).unwrap();
    let mut tree = Tree::new(vec![document()], Metadata::new(vec![group]));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();
    let old_envelope = envelope(&tree, r#"["a"]"#);

    let (added, added_switches) = key();
    let opts = RotateOptions {
        add_keys: vec![(0, added)],
        remove_keys: vec![switches[0].id.clone()],
        ..Default::default()
    };
    rotate_tree(&mut tree, opts).await.unwrap();

    let ids = tree.metadata.key_groups[0].key_ids();
    assert_eq!(ids, vec![switches[1].id.clone(), added_switches.id.clone()]);
    assert_ne!(envelope(&tree, r#"["a"]"#), old_envelope);
    assert!(tree.metadata.key_groups[0].is_fully_wrapped());

    switches[1].decrypt_fails(true);
    decrypt_tree(&mut tree, DecryptOptions::default()).await.unwrap();
    assert_eq!(tree.branches[0], document());
}

#[tokio::test]
async fn failed_rotation_leaves_tree_unchanged() {
    let (group_keys, switches) = keys(2);
    let group = KeyGroup::new(group_keys, None).unwrap();
    let mut tree = Tree::new(vec![document()], Metadata::new(vec![group]));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();
    let branches = tree.branches.clone();
    let mac = tree.metadata.mac.clone();
    let ids = tree.metadata.key_groups[0].key_ids();
    let wraps = tree.metadata.key_groups[0].wraps();

    let (added, added_switches) = key();
    added_switches.encrypt_fails(true);
    let opts = RotateOptions {
        add_keys: vec![(0, added)],
        remove_keys: vec![switches[0].id.clone()],
        ..Default::default()
    };
    assert!(matches!(
        rotate_tree(&mut tree, opts).await,
        Err(SealError::Backend { .. })
    ));

    assert_eq!(tree.branches, branches);
    assert_eq!(tree.metadata.mac, mac);
    assert_eq!(tree.metadata.key_groups[0].key_ids(), ids);
    assert_eq!(tree.metadata.key_groups[0].wraps(), wraps);
    decrypt_tree(&mut tree, DecryptOptions::default()).await.unwrap();
}

#[tokio::test]
async fn rotation_rejects_unknown_key() {
    let (group_keys, _) = keys(1);
    let group = KeyGroup::new(group_keys, None).unwrap();
    let mut tree = Tree::new(vec![document()], Metadata::new(vec![group]));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();
    let wraps = tree.metadata.key_groups[0].wraps();

    let opts = RotateOptions {
        remove_keys: vec!["not-a-key".into()],
        ..Default::default()
    };
    assert!(matches!(
        rotate_tree(&mut tree, opts).await,
        Err(SealError::Config(_))
    ));
    assert_eq!(tree.metadata.key_groups[0].wraps(), wraps);
}

#[tokio::test]
async fn multiple_documents_share_one_mac() {
    let (group_keys, _) = keys(1);
    let group = KeyGroup::new(group_keys, None).unwrap();
    let second = TreeBranch::from_iter([TreeItem::named("other", "doc")]);
    let mut tree = Tree::new(vec![document(), second.clone()], Metadata::new(vec![group]));
    encrypt_tree(&mut tree, EncryptOptions::default()).await.unwrap();

    tree.branches.swap(0, 1);
    assert!(matches!(
        decrypt_tree(&mut tree, DecryptOptions::default()).await,
        Err(SealError::MacMismatch)
    ));
    tree.branches.swap(0, 1);
    decrypt_tree(&mut tree, DecryptOptions::default()).await.unwrap();
    assert_eq!(tree.branches, vec![document(), second]);
}
