/*
 * strongroom: sealed key management for an encrypted secrets barrier
 * Copyright (C) 2018-2022 Aleksa Sarai <cyphar@cyphar.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{
    barrier::{self, generate_key, Barrier, KEYRING_PATH, KEYRING_PENDING_PATH, KEY_LENGTH},
    config::SealConfig,
    pgp::{self, IssuedShare, ShareEncryptor},
    progress::Quorum,
    rekey::REKEY_MARKER_PATH,
    seal::SealBackend,
    shamir::{self, KeyShare},
    storage::Storage,
    Error,
};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use serde::Serialize;
use zeroize::Zeroizing;

/// Plaintext seal configuration.
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";

/// The root key wrapped by an auto-unseal seal.
pub const WRAPPED_ROOT_KEY_PATH: &str = "core/wrapped-root-key";

/// Key shares kept by the server, wrapped by the seal.
pub const STORED_SHARES_PATH: &str = "core/stored-shares";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of [`SealManager::initialize`]. The shares are never available
/// again.
#[derive(Debug)]
pub struct InitResult {
    pub shares: Vec<IssuedShare>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnsealResult {
    pub sealed: bool,
    pub progress: usize,
    pub threshold: usize,
    /// Nonce of the attempt in progress (empty once unsealed).
    pub nonce: String,
}

/// A single unseal submission, as received from an operator.
#[derive(Clone, Debug, Default)]
pub struct UnsealRequest {
    /// Hex or base64 encoded key share.
    pub key: Option<String>,
    pub nonce: Option<String>,
    /// Discard the attempt in progress before using `key`.
    pub reset: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SealStatus {
    #[serde(rename = "type")]
    pub seal_type: String,
    pub initialized: bool,
    pub sealed: bool,
    pub threshold: usize,
    pub shares: usize,
    pub progress: usize,
    pub nonce: String,
    pub version: String,
    pub rekey_interrupted: bool,
}

/// Everything derived from a new root key that has to be written out.
pub(crate) struct DealtKey {
    pub(crate) issued: Vec<IssuedShare>,
    wrapped_root_key: Option<Vec<u8>>,
    wrapped_stored_shares: Option<Vec<u8>>,
}

/// Drives the seal lifecycle: initialization, unsealing from key shares (or
/// automatically through the seal) and sealing.
pub struct SealManager {
    storage: Arc<dyn Storage>,
    barrier: Barrier,
    seal: Arc<dyn SealBackend>,
    encryptor: Option<Arc<dyn ShareEncryptor>>,
    unseal: Mutex<Option<Quorum>>,
    // Held for the whole of initialize().
    init: Mutex<()>,
    // Bumped on every seal, so coordinators can drop state from before it.
    seal_epoch: AtomicU64,
}

impl SealManager {
    pub fn new(storage: Arc<dyn Storage>, seal: Arc<dyn SealBackend>) -> Self {
        Self {
            barrier: Barrier::new(Arc::clone(&storage)),
            storage,
            seal,
            encryptor: None,
            unseal: Mutex::new(None),
            init: Mutex::new(()),
            seal_epoch: AtomicU64::new(0),
        }
    }

    /// Enable PGP encryption of key shares.
    pub fn with_share_encryptor(mut self, encryptor: Arc<dyn ShareEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    pub fn seal_backend(&self) -> &dyn SealBackend {
        self.seal.as_ref()
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(crate) fn encryptor(&self) -> Option<&dyn ShareEncryptor> {
        self.encryptor.as_deref()
    }

    pub(crate) fn seal_epoch(&self) -> u64 {
        self.seal_epoch.load(Ordering::SeqCst)
    }

    fn lock_unseal(&self) -> MutexGuard<'_, Option<Quorum>> {
        self.unseal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sealed(&self) -> bool {
        self.barrier.sealed()
    }

    fn load_config(&self) -> Result<Option<SealConfig>, Error> {
        self.storage
            .get(SEAL_CONFIG_PATH)?
            .map(|raw| serde_json::from_slice(&raw).map_err(Error::serde("seal config")))
            .transpose()
    }

    /// The persisted seal configuration.
    pub fn seal_config(&self) -> Result<SealConfig, Error> {
        self.load_config()?.ok_or(Error::NotInitialized)
    }

    pub fn initialized(&self) -> Result<bool, Error> {
        Ok(self.storage.get(SEAL_CONFIG_PATH)?.is_some() && self.barrier.initialized()?)
    }

    /// Write the configuration and read it back.
    pub(crate) fn persist_config(&self, config: &SealConfig) -> Result<(), Error> {
        let config = SealConfig {
            seal_type: self.seal.seal_type(),
            ..config.clone()
        };
        let raw = serde_json::to_vec(&config).map_err(Error::serde("seal config"))?;
        self.storage.put(SEAL_CONFIG_PATH, &raw)?;
        match self.seal_config()? {
            stored if stored == config => Ok(()),
            _ => Err(Error::InvalidConfig("persisted seal config does not match".into())),
        }
    }

    /// Split `root_key` according to `config` and prepare everything that
    /// has to be stored alongside it. Nothing is written, so a failure here
    /// (PGP or seal wrapping) leaves no trace.
    pub(crate) fn deal_key(&self, root_key: &[u8], config: &SealConfig) -> Result<DealtKey, Error> {
        let mut shares = shamir::split(root_key, config.secret_shares, config.secret_threshold)?;
        let stored = shares.split_off(config.returned_shares());

        let wrapped_root_key = match self.seal.auto_unseal() {
            true => Some(self.seal.wrap_root_key(root_key)?),
            false => None,
        };
        let wrapped_stored_shares = match stored.is_empty() {
            true => None,
            false => {
                let encoded = Zeroizing::new(stored.iter().map(KeyShare::to_hex).collect::<Vec<_>>());
                let raw = Zeroizing::new(
                    serde_json::to_vec(&*encoded).map_err(Error::serde("stored shares"))?,
                );
                Some(self.seal.wrap_root_key(&raw)?)
            }
        };
        let issued = pgp::issue(self.encryptor(), &config.pgp_keys, shares)?;

        Ok(DealtKey {
            issued,
            wrapped_root_key,
            wrapped_stored_shares,
        })
    }

    /// Write the seal-wrapped material from [`deal_key`](Self::deal_key),
    /// removing whatever an older key left behind.
    pub(crate) fn store_dealt_key(&self, dealt: &DealtKey) -> Result<(), Error> {
        for (path, blob) in [
            (WRAPPED_ROOT_KEY_PATH, &dealt.wrapped_root_key),
            (STORED_SHARES_PATH, &dealt.wrapped_stored_shares),
        ] {
            match blob {
                Some(blob) => self.storage.put(path, blob)?,
                None => self.storage.delete(path)?,
            }
        }
        Ok(())
    }

    /// Generate a root key, initialize the barrier with it and split it into
    /// shares. The barrier stays sealed.
    pub fn initialize(&self, config: &SealConfig) -> Result<InitResult, Error> {
        config.validate(self.seal.as_ref())?;
        let _init = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if self.storage.get(SEAL_CONFIG_PATH)?.is_some() || self.barrier.initialized()? {
            return Err(Error::AlreadyInitialized);
        }
        if !config.pgp_keys.is_empty() && self.encryptor.is_none() {
            return Err(Error::MissingCapability("pgp share encryption"));
        }

        let root_key = generate_key();
        let dealt = self.deal_key(&root_key, config)?;

        let commit = || -> Result<(), Error> {
            self.barrier.initialize(&root_key)?;
            self.store_dealt_key(&dealt)?;
            // The seal config is the commit point for initialized().
            self.persist_config(config)
        };
        if let Err(err) = commit() {
            tracing::warn!(error = %err, "initialization failed, rolling back");
            self.rollback_initialize();
            return Err(err);
        }

        tracing::info!(
            shares = config.secret_shares,
            threshold = config.secret_threshold,
            stored_shares = config.stored_shares,
            seal_type = %self.seal.seal_type(),
            "seal initialized"
        );
        Ok(InitResult {
            shares: dealt.issued,
        })
    }

    fn rollback_initialize(&self) {
        for path in [
            SEAL_CONFIG_PATH,
            STORED_SHARES_PATH,
            WRAPPED_ROOT_KEY_PATH,
            KEYRING_PENDING_PATH,
            KEYRING_PATH,
        ] {
            if let Err(err) = self.storage.delete(path) {
                tracing::warn!(path, error = %err, "failed to roll back initialization");
            }
        }
    }

    /// Submit one key share towards unsealing.
    ///
    /// The first share starts an attempt with a new nonce. Later shares may
    /// quote that nonce; quoting any other one is an error. Once the
    /// threshold is reached the root key is reconstructed and the barrier
    /// unsealed. If the reconstructed key is wrong the whole attempt is
    /// discarded. Other failures (such as storage errors) keep the collected
    /// shares, and submitting any share again retries.
    pub fn submit_unseal_key(
        &self,
        share: KeyShare,
        nonce: Option<&str>,
    ) -> Result<UnsealResult, Error> {
        let mut guard = self.lock_unseal();
        if !self.barrier.sealed() {
            return Err(Error::AlreadyUnsealed);
        }
        let config = self.seal_config()?;

        match guard.as_ref() {
            Some(quorum) => quorum.check_nonce(nonce)?,
            // Nonces are handed out by us, so one for a non-existent attempt
            // must be stale.
            None if nonce.is_some() => return Err(Error::NonceMismatch),
            None => (),
        }
        let quorum = guard.get_or_insert_with(|| {
            let quorum = Quorum::for_key(config.secret_threshold, KEY_LENGTH);
            tracing::debug!(nonce = quorum.nonce(), "unseal attempt started");
            quorum
        });

        if !quorum.is_complete() && !quorum.add(share)? {
            tracing::debug!(nonce = quorum.nonce(), "ignoring duplicate unseal key");
        }
        if !quorum.is_complete() {
            return Ok(UnsealResult {
                sealed: true,
                progress: quorum.progress(),
                threshold: quorum.required(),
                nonce: quorum.nonce().to_string(),
            });
        }

        let unsealed = quorum
            .combine()
            .map_err(|_| barrier::Error::InvalidRootKey)
            .and_then(|root_key| self.barrier.unseal(&root_key));
        match unsealed {
            Ok(()) => {
                *guard = None;
                Ok(UnsealResult {
                    sealed: false,
                    progress: 0,
                    threshold: config.secret_threshold,
                    nonce: String::new(),
                })
            }
            Err(barrier::Error::InvalidRootKey) => {
                tracing::warn!(nonce = quorum.nonce(), "unseal failed with incorrect keys");
                *guard = None;
                Err(Error::IncorrectUnsealKeys)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Handle an [`UnsealRequest`]. With `reset` the current attempt is
    /// discarded first (and any nonce in the request is ignored).
    pub fn unseal(&self, request: UnsealRequest) -> Result<UnsealResult, Error> {
        if request.reset {
            self.reset_unseal();
        }
        match request.key {
            Some(key) => {
                let share = key
                    .parse::<KeyShare>()
                    .map_err(|err| Error::InvalidShare(err.to_string()))?;
                let nonce = match request.reset {
                    true => None,
                    false => request.nonce.as_deref(),
                };
                self.submit_unseal_key(share, nonce)
            }
            None if request.reset => {
                let status = self.status()?;
                Ok(UnsealResult {
                    sealed: status.sealed,
                    progress: status.progress,
                    threshold: status.threshold,
                    nonce: status.nonce,
                })
            }
            None => Err(Error::InvalidShare("no key given".into())),
        }
    }

    /// Discard the current unseal attempt, if any.
    pub fn reset_unseal(&self) {
        if let Some(quorum) = self.lock_unseal().take() {
            tracing::debug!(nonce = quorum.nonce(), "unseal attempt reset");
        }
    }

    /// Unseal using the seal itself instead of operator shares: the wrapped
    /// root key if present, otherwise the stored shares.
    pub fn auto_unseal(&self) -> Result<(), Error> {
        if !self.seal.auto_unseal() {
            return Err(Error::MissingCapability("seal cannot auto-unseal"));
        }
        let mut guard = self.lock_unseal();
        if !self.barrier.sealed() {
            return Err(Error::AlreadyUnsealed);
        }
        let config = self.seal_config()?;

        let root_key = match self.storage.get(WRAPPED_ROOT_KEY_PATH)? {
            Some(blob) => self.seal.unwrap_root_key(&blob)?,
            None => match self.storage.get(STORED_SHARES_PATH)? {
                Some(blob) => {
                    let raw = self.seal.unwrap_root_key(&blob)?;
                    let encoded: Zeroizing<Vec<String>> = Zeroizing::new(
                        serde_json::from_slice(&raw).map_err(Error::serde("stored shares"))?,
                    );
                    let shares = encoded
                        .iter()
                        .map(|s| s.parse::<KeyShare>())
                        .collect::<Result<Vec<_>, _>>()?;
                    if shares.len() < config.secret_threshold {
                        return Err(Error::InvalidConfig(
                            "not enough stored shares to reach the threshold".into(),
                        ));
                    }
                    shamir::combine(&shares)?
                }
                None => return Err(Error::NotInitialized),
            },
        };

        match self.barrier.unseal(&root_key) {
            Ok(()) => {
                *guard = None;
                tracing::info!(seal_type = %self.seal.seal_type(), "auto-unsealed");
                Ok(())
            }
            Err(barrier::Error::InvalidRootKey) => Err(Error::IncorrectUnsealKeys),
            Err(err) => Err(err.into()),
        }
    }

    /// Seal the barrier, wiping the key material and any unseal progress.
    pub fn seal(&self) -> Result<(), Error> {
        let mut guard = self.lock_unseal();
        if self.barrier.sealed() {
            return Err(Error::Sealed);
        }
        self.seal_epoch.fetch_add(1, Ordering::SeqCst);
        self.barrier.seal();
        *guard = None;
        Ok(())
    }

    pub fn status(&self) -> Result<SealStatus, Error> {
        let config = self.load_config()?;
        let initialized = config.is_some() && self.barrier.initialized()?;
        let rekey_interrupted = self.storage.get(REKEY_MARKER_PATH)?.is_some();
        let guard = self.lock_unseal();

        Ok(SealStatus {
            seal_type: self.seal.seal_type(),
            initialized,
            sealed: self.barrier.sealed(),
            threshold: config.as_ref().map_or(0, |c| c.secret_threshold),
            shares: config.as_ref().map_or(0, |c| c.secret_shares),
            progress: guard.as_ref().map_or(0, Quorum::progress),
            nonce: guard
                .as_ref()
                .map(|q| q.nonce().to_string())
                .unwrap_or_default(),
            version: VERSION.to_string(),
            rekey_interrupted,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use crate::{
        pgp::test::FakeEncryptor,
        seal::{KmsSeal, LocalKms, ShamirSeal},
        storage::{test::FlakyStorage, InmemStorage},
    };

    use std::{thread, time::Duration};

    pub(crate) fn plain_shares(result: &InitResult) -> Vec<KeyShare> {
        result
            .shares
            .iter()
            .map(|share| match share {
                IssuedShare::Plain(share) => share.clone(),
                IssuedShare::Pgp { .. } => panic!("expected plain shares"),
            })
            .collect()
    }

    pub(crate) fn shamir_manager() -> (Arc<InmemStorage>, SealManager) {
        let storage = Arc::new(InmemStorage::new());
        let manager = SealManager::new(storage.clone(), Arc::new(ShamirSeal));
        (storage, manager)
    }

    /// Initialize with 5 shares and a threshold of 3, then unseal.
    pub(crate) fn unsealed_manager() -> (SealManager, Vec<KeyShare>) {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(5, 3)).unwrap());
        for share in &shares[..3] {
            manager.submit_unseal_key(share.clone(), None).unwrap();
        }
        assert!(!manager.sealed());
        (manager, shares)
    }

    #[test]
    fn initialize() {
        let (storage, manager) = shamir_manager();
        assert!(!manager.initialized().unwrap());
        assert!(matches!(manager.seal_config(), Err(Error::NotInitialized)));

        let result = manager.initialize(&SealConfig::new(5, 3)).unwrap();
        let shares = plain_shares(&result);
        assert_eq!(shares.len(), 5);
        assert!(shares.iter().all(|s| s.len() == KEY_LENGTH + 1));

        assert!(manager.initialized().unwrap());
        assert!(manager.sealed());
        let config = manager.seal_config().unwrap();
        assert_eq!(config.seal_type, "shamir");
        assert_eq!((config.secret_shares, config.secret_threshold), (5, 3));
        assert!(storage.get(WRAPPED_ROOT_KEY_PATH).unwrap().is_none());

        assert!(matches!(
            manager.initialize(&SealConfig::new(5, 3)),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn initialize_rejects_before_writing() {
        let (storage, manager) = shamir_manager();
        assert!(matches!(
            manager.initialize(&SealConfig::new(3, 5)),
            Err(Error::InvalidConfig(_))
        ));
        let config = SealConfig {
            pgp_keys: vec!["a".into(), "b".into(), "c".into()],
            ..SealConfig::new(3, 2)
        };
        assert!(matches!(
            manager.initialize(&config),
            Err(Error::MissingCapability(_))
        ));

        let manager = manager.with_share_encryptor(Arc::new(FakeEncryptor));
        let config = SealConfig {
            pgp_keys: vec!["a".into(), "bad".into(), "c".into()],
            ..SealConfig::new(3, 2)
        };
        assert!(matches!(manager.initialize(&config), Err(Error::Pgp(_))));
        assert!(storage.is_empty());
    }

    #[test]
    fn initialize_rolls_back() {
        let storage = Arc::new(FlakyStorage::default());
        let manager = SealManager::new(storage.clone(), Arc::new(ShamirSeal));
        storage.fail_on(Some(WRAPPED_ROOT_KEY_PATH));
        assert!(matches!(
            manager.initialize(&SealConfig::new(3, 2)),
            Err(Error::Storage(_))
        ));
        storage.fail_on(None);
        assert!(!manager.barrier().initialized().unwrap());
        manager.initialize(&SealConfig::new(3, 2)).unwrap();
    }

    #[test]
    fn concurrent_initialize() {
        let storage = Arc::new(FlakyStorage::default());
        storage.delay_writes(Some(Duration::from_millis(10)));
        let manager = Arc::new(SealManager::new(storage.clone(), Arc::new(ShamirSeal)));

        let handles = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.initialize(&SealConfig::new(3, 2)))
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        storage.delay_writes(None);

        let winners = results.iter().filter_map(|r| r.as_ref().ok()).collect::<Vec<_>>();
        assert_eq!(winners.len(), 1, "exactly one initialize must succeed");
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(_) | Err(Error::AlreadyInitialized))));
        assert!(manager.initialized().unwrap());

        // The shares handed out must be the ones protecting the barrier.
        let shares = plain_shares(winners[0]);
        manager.submit_unseal_key(shares[0].clone(), None).unwrap();
        let result = manager.submit_unseal_key(shares[2].clone(), None).unwrap();
        assert!(!result.sealed);
    }

    #[test]
    fn initialize_pgp_shares() {
        let (_, manager) = shamir_manager();
        let manager = manager.with_share_encryptor(Arc::new(FakeEncryptor));
        let keys = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
        let config = SealConfig {
            pgp_keys: keys.clone(),
            ..SealConfig::new(3, 2)
        };
        let result = manager.initialize(&config).unwrap();
        assert_eq!(result.shares.len(), 3);

        for (issued, key) in result.shares.iter().zip(&keys).take(2) {
            let ciphertext = match issued {
                IssuedShare::Pgp { ciphertext, .. } => ciphertext,
                IssuedShare::Plain(_) => panic!("share was not encrypted"),
            };
            let hex = FakeEncryptor::decrypt(key, ciphertext);
            let share = std::str::from_utf8(&hex).unwrap().parse().unwrap();
            manager.submit_unseal_key(share, None).unwrap();
        }
        assert!(!manager.sealed());
    }

    #[test]
    fn unseal_progress() {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(5, 3)).unwrap());

        let first = manager.submit_unseal_key(shares[0].clone(), None).unwrap();
        assert!(first.sealed);
        assert_eq!((first.progress, first.threshold), (1, 3));
        assert!(!first.nonce.is_empty());

        // Duplicates don't count.
        let again = manager
            .submit_unseal_key(shares[0].clone(), Some(&first.nonce))
            .unwrap();
        assert_eq!(again, first);

        let status = manager.status().unwrap();
        assert_eq!((status.progress, status.nonce.as_str()), (1, first.nonce.as_str()));

        assert!(matches!(
            manager.submit_unseal_key(shares[2].clone(), Some("stale")),
            Err(Error::NonceMismatch)
        ));
        let second = manager
            .submit_unseal_key(shares[2].clone(), Some(&first.nonce))
            .unwrap();
        assert_eq!(second.progress, 2);

        let done = manager.submit_unseal_key(shares[4].clone(), None).unwrap();
        assert!(!done.sealed);
        assert_eq!(done.progress, 0);
        assert!(!manager.sealed());
        assert_eq!(manager.status().unwrap().nonce, "");

        assert!(matches!(
            manager.submit_unseal_key(shares[1].clone(), None),
            Err(Error::AlreadyUnsealed)
        ));
    }

    #[test]
    fn nonce_without_attempt() {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(3, 2)).unwrap());
        assert!(matches!(
            manager.submit_unseal_key(shares[0].clone(), Some("made-up")),
            Err(Error::NonceMismatch)
        ));
        assert_eq!(manager.status().unwrap().progress, 0);
    }

    #[test]
    fn incorrect_keys_reset_progress() {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(5, 3)).unwrap());
        let foreign = shamir::split(&generate_key(), 5, 3).unwrap();

        manager.submit_unseal_key(shares[0].clone(), None).unwrap();
        manager.submit_unseal_key(shares[1].clone(), None).unwrap();
        assert!(matches!(
            manager.submit_unseal_key(foreign[4].clone(), None),
            Err(Error::IncorrectUnsealKeys)
        ));
        assert!(manager.sealed());
        let status = manager.status().unwrap();
        assert_eq!((status.progress, status.nonce.as_str()), (0, ""));

        // The ceremony starts over.
        for share in &shares[2..] {
            manager.submit_unseal_key(share.clone(), None).unwrap();
        }
        assert!(!manager.sealed());
    }

    #[test]
    fn invalid_shares_keep_progress() {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(5, 3)).unwrap());
        manager.submit_unseal_key(shares[0].clone(), None).unwrap();
        assert!(matches!(
            manager.submit_unseal_key(KeyShare::from_bytes(vec![1u8; 5]), None),
            Err(Error::InvalidShare(_))
        ));
        assert_eq!(manager.status().unwrap().progress, 1);
    }

    #[test]
    fn storage_failure_keeps_progress() {
        let storage = Arc::new(FlakyStorage::default());
        let manager = SealManager::new(storage.clone(), Arc::new(ShamirSeal));
        let shares = plain_shares(&manager.initialize(&SealConfig::new(3, 2)).unwrap());

        manager.submit_unseal_key(shares[0].clone(), None).unwrap();
        storage.fail_on(Some(KEYRING_PATH));
        assert!(matches!(
            manager.submit_unseal_key(shares[1].clone(), None),
            Err(Error::Barrier(barrier::Error::Storage(_)))
        ));
        assert!(manager.sealed());
        assert_eq!(manager.status().unwrap().progress, 2);

        storage.fail_on(None);
        let result = manager.submit_unseal_key(shares[1].clone(), None).unwrap();
        assert!(!result.sealed);
    }

    #[test]
    fn reset_and_requests() {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(3, 2)).unwrap());

        let first = manager
            .unseal(UnsealRequest {
                key: Some(shares[0].to_base64()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(first.progress, 1);

        manager.reset_unseal();
        assert_eq!(manager.status().unwrap().progress, 0);

        manager
            .unseal(UnsealRequest {
                key: Some(shares[1].to_hex()),
                ..Default::default()
            })
            .unwrap();
        let reset = manager
            .unseal(UnsealRequest {
                key: Some(shares[2].to_hex()),
                nonce: Some("ignored".into()),
                reset: true,
            })
            .unwrap();
        assert_eq!(reset.progress, 1);

        assert!(matches!(
            manager.unseal(UnsealRequest::default()),
            Err(Error::InvalidShare(_))
        ));
        assert!(matches!(
            manager.unseal(UnsealRequest {
                key: Some("!!".into()),
                ..Default::default()
            }),
            Err(Error::InvalidShare(_))
        ));
        let cleared = manager
            .unseal(UnsealRequest {
                reset: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!((cleared.sealed, cleared.progress), (true, 0));
    }

    #[test]
    fn seal_and_unseal_again() {
        let (manager, shares) = unsealed_manager();
        manager.barrier().put("secret/foo", b"bar").unwrap();
        manager.seal().unwrap();
        assert!(matches!(manager.seal(), Err(Error::Sealed)));
        assert!(matches!(
            manager.barrier().get("secret/foo"),
            Err(barrier::Error::Sealed)
        ));

        for share in shares.iter().rev().take(3) {
            manager.submit_unseal_key(share.clone(), None).unwrap();
        }
        assert_eq!(
            manager.barrier().get("secret/foo").unwrap().as_deref(),
            Some(&b"bar"[..])
        );
    }

    #[test]
    fn single_share() {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(1, 1)).unwrap());
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].len(), KEY_LENGTH);
        let result = manager.submit_unseal_key(shares[0].clone(), None).unwrap();
        assert!(!result.sealed);
    }

    #[test]
    fn status_fields() {
        let (_, manager) = shamir_manager();
        let status = manager.status().unwrap();
        assert!(!status.initialized);
        assert!(status.sealed);
        assert_eq!((status.threshold, status.shares), (0, 0));

        manager.initialize(&SealConfig::new(5, 3)).unwrap();
        let status = manager.status().unwrap();
        assert_eq!(status.seal_type, "shamir");
        assert!(status.initialized);
        assert_eq!((status.threshold, status.shares), (3, 5));
        assert_eq!(status.version, VERSION);
        assert!(!status.rekey_interrupted);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "shamir");
    }

    #[test]
    fn auto_unseal() {
        let storage = Arc::new(InmemStorage::new());
        let seal = Arc::new(KmsSeal::new(Arc::new(LocalKms::generate())));
        let manager = SealManager::new(storage.clone(), seal);
        assert!(matches!(manager.auto_unseal(), Err(Error::NotInitialized)));

        let result = manager.initialize(&SealConfig::new(3, 2)).unwrap();
        assert_eq!(result.shares.len(), 3);
        assert!(storage.get(WRAPPED_ROOT_KEY_PATH).unwrap().is_some());
        assert!(manager.sealed());

        manager.auto_unseal().unwrap();
        assert!(!manager.sealed());
        assert!(matches!(manager.auto_unseal(), Err(Error::AlreadyUnsealed)));

        // Operator shares still work as well.
        manager.seal().unwrap();
        let shares = plain_shares(&result);
        manager.submit_unseal_key(shares[0].clone(), None).unwrap();
        manager.submit_unseal_key(shares[2].clone(), None).unwrap();
        assert!(!manager.sealed());
    }

    #[test]
    fn auto_unseal_from_stored_shares() {
        let storage = Arc::new(InmemStorage::new());
        let seal = Arc::new(KmsSeal::new(Arc::new(LocalKms::generate())));
        let manager = SealManager::new(storage.clone(), seal);
        let config = SealConfig {
            stored_shares: 3,
            ..SealConfig::new(5, 3)
        };
        let result = manager.initialize(&config).unwrap();
        assert_eq!(result.shares.len(), 2);
        assert!(storage.get(STORED_SHARES_PATH).unwrap().is_some());

        storage.delete(WRAPPED_ROOT_KEY_PATH).unwrap();
        manager.auto_unseal().unwrap();
        assert!(!manager.sealed());
    }

    #[test]
    fn auto_unseal_needs_capable_seal() {
        let (_, manager) = shamir_manager();
        manager.initialize(&SealConfig::new(3, 2)).unwrap();
        assert!(matches!(
            manager.auto_unseal(),
            Err(Error::MissingCapability(_))
        ));
    }

    #[test]
    fn auto_unseal_wrong_kms() {
        let storage = Arc::new(InmemStorage::new());
        let manager = SealManager::new(
            storage.clone(),
            Arc::new(KmsSeal::new(Arc::new(LocalKms::generate()))),
        );
        manager.initialize(&SealConfig::new(3, 2)).unwrap();

        let other = SealManager::new(
            storage,
            Arc::new(KmsSeal::new(Arc::new(LocalKms::generate()))),
        );
        assert!(matches!(other.auto_unseal(), Err(Error::Seal(_))));
        assert!(other.sealed());
    }

    #[test]
    fn concurrent_submissions() {
        let (_, manager) = shamir_manager();
        let shares = plain_shares(&manager.initialize(&SealConfig::new(10, 5)).unwrap());
        let manager = Arc::new(manager);

        let handles = shares
            .into_iter()
            .map(|share| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.submit_unseal_key(share, None))
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();

        assert!(!manager.sealed());
        let unsealing = results
            .iter()
            .filter(|r| matches!(r, Ok(UnsealResult { sealed: false, .. })))
            .count();
        assert_eq!(unsealing, 1);
        assert!(results.iter().all(|r| matches!(
            r,
            Ok(_) | Err(Error::AlreadyUnsealed)
        )));
    }
}
