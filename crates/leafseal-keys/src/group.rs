//! Key groups: T-of-N master keys sharing one group secret

use std::fmt;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use leafseal_core::config::KeysConfig;
use leafseal_core::{EncryptFailurePolicy, SealError, SealResult};
use leafseal_crypto::shamir;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{GroupError, KeyError, KeyFailure, KeyResult};
use crate::master_key::MasterKey;

/// Per-call settings for master-key fan-out.
#[derive(Debug, Clone)]
pub struct GroupCallOptions {
    /// Upper bound on any single backend call
    pub timeout: Duration,
    /// Key types in launch order; unlisted types go last
    pub decryption_order: Vec<String>,
    pub policy: EncryptFailurePolicy,
}

impl Default for GroupCallOptions {
    fn default() -> Self {
        Self::from_config(&KeysConfig::default())
    }
}

impl GroupCallOptions {
    pub fn from_config(config: &KeysConfig) -> Self {
        Self {
            timeout: config.backend_timeout(),
            decryption_order: config.decryption_order.clone(),
            policy: config.encrypt_failure_policy,
        }
    }
}

/// An ordered set of master keys. Any `threshold` of them recover the
/// group secret; with a single key the secret is wrapped directly.
pub struct KeyGroup {
    keys: Vec<Box<dyn MasterKey>>,
    threshold: Option<usize>,
}

impl fmt::Debug for KeyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGroup")
            .field("keys", &self.key_ids())
            .field("threshold", &self.threshold())
            .finish()
    }
}

impl KeyGroup {
    /// `threshold` of `None` or `Some(0)` means every key is required.
    pub fn new(keys: Vec<Box<dyn MasterKey>>, threshold: Option<usize>) -> SealResult<Self> {
        let group = Self {
            keys,
            threshold: threshold.filter(|&t| t != 0),
        };
        group.validate()?;
        Ok(group)
    }

    fn validate(&self) -> SealResult<()> {
        if self.keys.is_empty() {
            return Err(SealError::config("key group has no master keys"));
        }
        if self.keys.len() > 255 {
            return Err(SealError::config(format!(
                "key group has {} master keys, at most 255 are supported",
                self.keys.len()
            )));
        }
        let threshold = self.threshold();
        if threshold > self.keys.len() {
            return Err(SealError::config(format!(
                "group threshold {threshold} exceeds its {} master keys",
                self.keys.len()
            )));
        }
        Ok(())
    }

    pub fn keys(&self) -> &[Box<dyn MasterKey>] {
        &self.keys
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold.unwrap_or(self.keys.len())
    }

    /// The threshold to persist, `None` when it equals the key count.
    pub fn explicit_threshold(&self) -> Option<usize> {
        self.threshold.filter(|&t| t != self.keys.len())
    }

    pub fn is_fully_wrapped(&self) -> bool {
        self.keys.iter().all(|k| !k.encrypted_data_key().is_empty())
    }

    /// Add a key. Existing wraps become unusable and are cleared.
    pub fn add_key(&mut self, key: Box<dyn MasterKey>) -> SealResult<()> {
        self.keys.push(key);
        self.clear_wraps();
        self.validate()
    }

    /// Remove every key whose identifier is `id`.
    ///
    /// Returns the removed keys with their former positions so the removal
    /// can be undone with [`restore_removed`](Self::restore_removed).
    pub fn remove_key(&mut self, id: &str) -> SealResult<Vec<(usize, Box<dyn MasterKey>)>> {
        let positions: Vec<usize> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.to_string() == id)
            .map(|(i, _)| i)
            .collect();
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let remaining = self.keys.len() - positions.len();
        if remaining == 0 || self.threshold.is_some_and(|t| t > remaining) {
            return Err(SealError::config(format!(
                "removing {id} would leave {remaining} keys, below the group threshold"
            )));
        }
        let removed = positions
            .into_iter()
            .rev()
            .map(|i| (i, self.keys.remove(i)))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        self.clear_wraps();
        Ok(removed)
    }

    /// Put back keys taken out by [`remove_key`](Self::remove_key).
    pub fn restore_removed(&mut self, removed: Vec<(usize, Box<dyn MasterKey>)>) {
        for (position, key) in removed {
            let position = position.min(self.keys.len());
            self.keys.insert(position, key);
        }
    }

    /// Drop keys beyond the first `len`, undoing [`add_key`](Self::add_key).
    pub fn truncate_keys(&mut self, len: usize) {
        self.keys.truncate(len);
    }

    /// Current wrapped share of every key, in key order.
    pub fn wraps(&self) -> Vec<Vec<u8>> {
        self.keys
            .iter()
            .map(|k| k.encrypted_data_key().to_vec())
            .collect()
    }

    pub fn restore_wraps(&mut self, wraps: Vec<Vec<u8>>) {
        for (key, wrap) in self.keys.iter_mut().zip(wraps) {
            key.set_encrypted_data_key(wrap);
        }
    }

    pub fn needs_rotation(&self) -> bool {
        self.keys.iter().any(|k| k.needs_rotation())
    }

    fn clear_wraps(&mut self) {
        for key in &mut self.keys {
            key.set_encrypted_data_key(Vec::new());
        }
    }

    /// Wrap `secret` under this group.
    ///
    /// A no-op when every key already holds a wrap. A partially wrapped
    /// multi-key group is re-split and every key re-wrapped, since shares
    /// from different splits cannot be combined.
    pub async fn encrypt_data_key(
        &mut self,
        secret: &[u8],
        opts: &GroupCallOptions,
    ) -> Result<(), GroupError> {
        if self.is_fully_wrapped() {
            debug!(keys = ?self.key_ids(), "key group already wrapped");
            return Ok(());
        }
        let force = self.keys.len() > 1;
        self.wrap(secret, opts, force).await
    }

    /// Discard every existing wrap and wrap `secret` afresh.
    pub async fn rewrap(
        &mut self,
        secret: &[u8],
        opts: &GroupCallOptions,
    ) -> Result<(), GroupError> {
        self.wrap(secret, opts, true).await
    }

    async fn wrap(
        &mut self,
        secret: &[u8],
        opts: &GroupCallOptions,
        force: bool,
    ) -> Result<(), GroupError> {
        let threshold = self.threshold();
        let shares = shamir::split(secret, self.keys.len(), threshold)?;
        let snapshot = self.wraps();
        if force {
            self.clear_wraps();
        }

        let timeout = opts.timeout;
        let results: Vec<(String, KeyResult<()>)> =
            futures::future::join_all(self.keys.iter_mut().zip(shares.iter()).map(
                |(key, share)| async move {
                    let id = key.to_string();
                    let result = with_timeout(timeout, key.encrypt_if_needed(share)).await;
                    (id, result)
                },
            ))
            .await;

        let mut failures = Vec::new();
        for (idx, (key, result)) in results.into_iter().enumerate() {
            if let Err(error) = result {
                failures.push((idx, KeyFailure { key, error }));
            }
        }
        if failures.is_empty() {
            return Ok(());
        }

        let succeeded = self.keys.len() - failures.len();
        let tolerated = opts.policy == EncryptFailurePolicy::RequireGroupThreshold
            && succeeded >= threshold;
        if tolerated {
            for (idx, failure) in &failures {
                warn!(key = %failure.key, error = %failure.error, "master key failed to wrap its share, group threshold still met");
                self.keys[*idx].set_encrypted_data_key(Vec::new());
            }
            return Ok(());
        }

        self.restore_wraps(snapshot);
        Err(GroupError::Threshold {
            operation: "encrypt",
            need: match opts.policy {
                EncryptFailurePolicy::AbortOnAny => self.keys.len(),
                EncryptFailurePolicy::RequireGroupThreshold => threshold,
            },
            have: succeeded,
            failures: failures.into_iter().map(|(_, f)| f).collect(),
        })
    }

    /// Recover the group secret from any `threshold` master keys.
    ///
    /// Keys are launched concurrently in `decryption_order`; collection stops
    /// as soon as enough shares are in.
    pub async fn decrypt_data_key(
        &self,
        opts: &GroupCallOptions,
    ) -> Result<Zeroizing<Vec<u8>>, GroupError> {
        let threshold = self.threshold();
        let timeout = opts.timeout;

        let mut ordered: Vec<&dyn MasterKey> = self.keys.iter().map(|k| k.as_ref()).collect();
        ordered.sort_by_key(|k| {
            opts.decryption_order
                .iter()
                .position(|t| t == k.key_type())
                .unwrap_or(usize::MAX)
        });

        let mut pending: FuturesUnordered<_> = ordered
            .into_iter()
            .map(|key| async move {
                let result = with_timeout(timeout, key.decrypt()).await;
                (key.to_string(), result)
            })
            .collect();

        let mut shares: Vec<Zeroizing<Vec<u8>>> = Vec::with_capacity(threshold);
        let mut failures = Vec::new();
        while let Some((key, result)) = pending.next().await {
            match result {
                Ok(share) => {
                    debug!(key = %key, "master key decrypted its share");
                    shares.push(share);
                    if shares.len() >= threshold {
                        break;
                    }
                }
                Err(error) => {
                    warn!(key = %key, error = %error, "master key failed to decrypt its share");
                    failures.push(KeyFailure { key, error });
                }
            }
        }
        drop(pending);

        if shares.len() < threshold {
            return Err(GroupError::Threshold {
                operation: "decrypt",
                need: threshold,
                have: shares.len(),
                failures,
            });
        }
        if self.keys.len() == 1 {
            return shares.pop().ok_or(GroupError::Threshold {
                operation: "decrypt",
                need: 1,
                have: 0,
                failures,
            });
        }
        Ok(shamir::combine(&shares)?)
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = KeyResult<T>>,
) -> KeyResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(KeyError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::KeyMap;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory key that can be told to fail or stall.
    struct FlakyKey {
        name: String,
        kind: &'static str,
        wrapped: Vec<u8>,
        fail_encrypt: Arc<AtomicBool>,
        fail_decrypt: Arc<AtomicBool>,
        stall: Arc<AtomicBool>,
        encrypt_calls: Arc<AtomicUsize>,
    }

    impl FlakyKey {
        fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                kind: "box",
                wrapped: Vec::new(),
                fail_encrypt: Arc::default(),
                fail_decrypt: Arc::default(),
                stall: Arc::default(),
                encrypt_calls: Arc::default(),
            }
        }
    }

    impl fmt::Display for FlakyKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.name)
        }
    }

    #[async_trait]
    impl MasterKey for FlakyKey {
        fn key_type(&self) -> &'static str {
            self.kind
        }
        fn encrypted_data_key(&self) -> &[u8] {
            &self.wrapped
        }
        fn set_encrypted_data_key(&mut self, enc: Vec<u8>) {
            self.wrapped = enc;
        }
        async fn encrypt(&mut self, share: &[u8]) -> KeyResult<()> {
            self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_encrypt.load(Ordering::SeqCst) {
                return Err(KeyError::Encrypt("backend unavailable".into()));
            }
            self.wrapped = share.iter().map(|b| b ^ 0x5A).collect();
            Ok(())
        }
        async fn decrypt(&self) -> KeyResult<Zeroizing<Vec<u8>>> {
            if self.stall.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.fail_decrypt.load(Ordering::SeqCst) {
                return Err(KeyError::Decrypt("access denied".into()));
            }
            if self.wrapped.is_empty() {
                return Err(KeyError::NotWrapped);
            }
            Ok(Zeroizing::new(self.wrapped.iter().map(|b| b ^ 0x5A).collect()))
        }
        fn needs_rotation(&self) -> bool {
            false
        }
        fn to_map(&self) -> KeyMap {
            KeyMap::new()
        }
    }

    struct Handles {
        fail_encrypt: Vec<Arc<AtomicBool>>,
        fail_decrypt: Vec<Arc<AtomicBool>>,
        stall: Vec<Arc<AtomicBool>>,
        encrypt_calls: Vec<Arc<AtomicUsize>>,
    }

    fn flaky_group(n: usize, threshold: Option<usize>) -> (KeyGroup, Handles) {
        let mut handles = Handles {
            fail_encrypt: vec![],
            fail_decrypt: vec![],
            stall: vec![],
            encrypt_calls: vec![],
        };
        let keys = (0..n)
            .map(|i| {
                let key = FlakyKey::new(&format!("key-{i}"));
                handles.fail_encrypt.push(key.fail_encrypt.clone());
                handles.fail_decrypt.push(key.fail_decrypt.clone());
                handles.stall.push(key.stall.clone());
                handles.encrypt_calls.push(key.encrypt_calls.clone());
                Box::new(key) as Box<dyn MasterKey>
            })
            .collect();
        (KeyGroup::new(keys, threshold).unwrap(), handles)
    }

    fn opts() -> GroupCallOptions {
        GroupCallOptions {
            timeout: Duration::from_millis(200),
            ..GroupCallOptions::default()
        }
    }

    const SECRET: [u8; 32] = [7u8; 32];

    #[test]
    fn test_construction_rules() {
        assert!(matches!(
            KeyGroup::new(vec![], None),
            Err(SealError::Config(_))
        ));
        let keys: Vec<Box<dyn MasterKey>> =
            vec![Box::new(FlakyKey::new("a")), Box::new(FlakyKey::new("b"))];
        assert!(matches!(
            KeyGroup::new(keys, Some(3)),
            Err(SealError::Config(_))
        ));

        let (group, _) = flaky_group(3, Some(0));
        assert_eq!(group.threshold(), 3);
        assert_eq!(group.explicit_threshold(), None);
        let (group, _) = flaky_group(3, Some(2));
        assert_eq!(group.explicit_threshold(), Some(2));
    }

    #[tokio::test]
    async fn test_any_three_of_five_recover() {
        let (mut group, handles) = flaky_group(5, Some(3));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();

        for down in [[0, 1], [1, 3], [2, 4], [0, 4]] {
            for (i, flag) in handles.fail_decrypt.iter().enumerate() {
                flag.store(down.contains(&i), Ordering::SeqCst);
            }
            let secret = group.decrypt_data_key(&opts()).await.unwrap();
            assert_eq!(&secret[..], &SECRET[..]);
        }
    }

    #[tokio::test]
    async fn test_two_of_five_is_unrecoverable() {
        let (mut group, handles) = flaky_group(5, Some(3));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        for flag in &handles.fail_decrypt[..3] {
            flag.store(true, Ordering::SeqCst);
        }

        let err = group.decrypt_data_key(&opts()).await.unwrap_err();
        match &err {
            GroupError::Threshold { need, have, .. } => {
                assert_eq!((*need, *have), (3, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut failed: Vec<_> = err.failures().iter().map(|f| f.key.clone()).collect();
        failed.sort();
        assert_eq!(failed, vec!["key-0", "key-1", "key-2"]);
        assert!(matches!(
            SealError::from(err),
            SealError::GroupUnrecoverable(_)
        ));
    }

    #[tokio::test]
    async fn test_encrypt_is_idempotent_when_wrapped() {
        let (mut group, handles) = flaky_group(3, Some(2));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        let before: Vec<_> = group.keys().iter().map(|k| k.encrypted_data_key().to_vec()).collect();

        group.encrypt_data_key(&[9u8; 32], &opts()).await.unwrap();
        let after: Vec<_> = group.keys().iter().map(|k| k.encrypted_data_key().to_vec()).collect();
        assert_eq!(before, after);
        assert!(handles
            .encrypt_calls
            .iter()
            .all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn test_partial_wrap_is_resplit() {
        let (mut group, handles) = flaky_group(3, Some(2));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        group.keys[1].set_encrypted_data_key(Vec::new());

        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        assert!(handles
            .encrypt_calls
            .iter()
            .all(|c| c.load(Ordering::SeqCst) == 2));
        handles.fail_decrypt[0].store(true, Ordering::SeqCst);
        assert_eq!(&group.decrypt_data_key(&opts()).await.unwrap()[..], &SECRET[..]);
    }

    #[tokio::test]
    async fn test_abort_on_any_restores_previous_wraps() {
        let (mut group, handles) = flaky_group(2, Some(1));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        let before: Vec<_> = group.keys().iter().map(|k| k.encrypted_data_key().to_vec()).collect();

        handles.fail_encrypt[1].store(true, Ordering::SeqCst);
        let err = group.rewrap(&[1u8; 32], &opts()).await.unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].key, "key-1");

        let after: Vec<_> = group.keys().iter().map(|k| k.encrypted_data_key().to_vec()).collect();
        assert_eq!(before, after);
        assert_eq!(&group.decrypt_data_key(&opts()).await.unwrap()[..], &SECRET[..]);
    }

    #[tokio::test]
    async fn test_require_threshold_tolerates_failed_wrap() {
        let (mut group, handles) = flaky_group(2, Some(1));
        handles.fail_encrypt[0].store(true, Ordering::SeqCst);
        let tolerant = GroupCallOptions {
            policy: EncryptFailurePolicy::RequireGroupThreshold,
            ..opts()
        };
        group.encrypt_data_key(&SECRET, &tolerant).await.unwrap();
        assert!(group.keys()[0].encrypted_data_key().is_empty());
        assert_eq!(&group.decrypt_data_key(&opts()).await.unwrap()[..], &SECRET[..]);

        handles.fail_encrypt[1].store(true, Ordering::SeqCst);
        assert!(group.rewrap(&SECRET, &tolerant).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_key_times_out_without_blocking_threshold() {
        let (mut group, handles) = flaky_group(3, Some(2));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        handles.stall[0].store(true, Ordering::SeqCst);

        let started = std::time::Instant::now();
        let secret = group.decrypt_data_key(&opts()).await.unwrap();
        assert_eq!(&secret[..], &SECRET[..]);
        assert!(started.elapsed() < Duration::from_secs(5));

        handles.fail_decrypt[1].store(true, Ordering::SeqCst);
        let err = group.decrypt_data_key(&opts()).await.unwrap_err();
        assert!(err
            .failures()
            .iter()
            .any(|f| matches!(f.error, KeyError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_single_key_group_wraps_secret_directly() {
        let (mut group, _) = flaky_group(1, None);
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        let wrapped: Vec<u8> = group.keys()[0].encrypted_data_key().to_vec();
        assert_eq!(wrapped.len(), SECRET.len());
        assert_eq!(&group.decrypt_data_key(&opts()).await.unwrap()[..], &SECRET[..]);
    }

    #[tokio::test]
    async fn test_remove_key_clears_wraps_and_revalidates() {
        let (mut group, _) = flaky_group(3, Some(3));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        assert!(group.remove_key("key-1").is_err());
        assert_eq!(group.len(), 3);
        assert!(group.is_fully_wrapped());

        let (mut group, _) = flaky_group(3, Some(2));
        group.encrypt_data_key(&SECRET, &opts()).await.unwrap();
        let wraps = group.wraps();
        let removed = group.remove_key("key-1").unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, 1);
        assert!(!group.is_fully_wrapped());
        assert_eq!(group.key_ids(), vec!["key-0", "key-2"]);
        assert!(group.remove_key("absent").unwrap().is_empty());

        group.restore_removed(removed);
        group.restore_wraps(wraps);
        assert_eq!(group.key_ids(), vec!["key-0", "key-1", "key-2"]);
        assert_eq!(&group.decrypt_data_key(&opts()).await.unwrap()[..], &SECRET[..]);
    }
}
