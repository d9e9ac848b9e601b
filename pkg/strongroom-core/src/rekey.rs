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

//! Replacing the root key (and the key shares derived from it).
//!
//! A rekey is authorized by a quorum of the *current* key shares. Once that
//! quorum is reached a new root key is generated and split according to the
//! new [`SealConfig`]. If the new configuration asks for verification, the
//! new shares are handed out first and the rekey only commits after a
//! quorum of them has been submitted back.

use crate::{
    barrier::{self, generate_key, KEY_LENGTH},
    config::SealConfig,
    manager::{DealtKey, SealManager, SEAL_CONFIG_PATH, STORED_SHARES_PATH, WRAPPED_ROOT_KEY_PATH},
    pgp::{IssuedShare, ShareBackup},
    progress::Quorum,
    shamir::KeyShare,
    Error,
};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Written before the barrier is rekeyed and removed once everything has
/// been committed. If it is still present, a rekey was interrupted.
pub const REKEY_MARKER_PATH: &str = "core/rekey-in-progress-marker";

/// PGP-encrypted shares of the last rekey with `backup` set. Stored inside
/// the barrier.
pub const REKEY_BACKUP_PATH: &str = "core/unseal-keys-backup";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RekeyResult {
    pub nonce: String,
    /// Whether the new root key is now in use.
    pub complete: bool,
    pub progress: usize,
    pub required: usize,
    /// The new shares, only present once the quorum has been reached.
    pub keys: Vec<String>,
    pub pgp_fingerprints: Vec<String>,
    pub backup: bool,
    pub verification_required: bool,
    pub verification_nonce: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    pub nonce: String,
    pub complete: bool,
    pub progress: usize,
    pub required: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RekeyStatus {
    pub started: bool,
    pub nonce: String,
    pub progress: usize,
    pub required: usize,
    /// The configuration the new root key will be dealt with.
    pub config: Option<SealConfig>,
    pub verification_nonce: Option<String>,
    pub verification_progress: usize,
}

struct AwaitingVerification {
    old_root_key: Zeroizing<Vec<u8>>,
    new_root_key: Zeroizing<Vec<u8>>,
    dealt: DealtKey,
    verification: Quorum,
}

enum Phase {
    AwaitingQuorum(Quorum),
    AwaitingVerification(Box<AwaitingVerification>),
}

struct Rekey {
    nonce: String,
    config: SealConfig,
    epoch: u64,
    phase: Phase,
}

impl Rekey {
    fn check_nonce(&self, nonce: &str) -> Result<(), Error> {
        match nonce == self.nonce {
            true => Ok(()),
            false => Err(Error::NonceMismatch),
        }
    }
}

fn issued_keys(issued: &[IssuedShare]) -> (Vec<String>, Vec<String>) {
    let keys = issued.iter().map(IssuedShare::encoded).collect();
    let fingerprints = issued
        .iter()
        .filter_map(IssuedShare::fingerprint)
        .map(String::from)
        .collect();
    (keys, fingerprints)
}

/// Coordinates a single rekey operation at a time.
pub struct RekeyCoordinator {
    manager: Arc<SealManager>,
    state: Mutex<Option<Rekey>>,
}

impl RekeyCoordinator {
    pub fn new(manager: Arc<SealManager>) -> Self {
        Self {
            manager,
            state: Mutex::new(None),
        }
    }

    /// Lock the rekey state, dropping it if the barrier has been sealed
    /// since it was started.
    fn lock(&self) -> MutexGuard<'_, Option<Rekey>> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let epoch = self.manager.seal_epoch();
        if guard.as_ref().map_or(false, |rekey| rekey.epoch != epoch) {
            tracing::info!("discarding rekey started before the barrier was sealed");
            *guard = None;
        }
        guard
    }

    /// Start a rekey towards `config`, returning its nonce.
    pub fn init(&self, config: SealConfig) -> Result<String, Error> {
        let mut guard = self.lock();
        if self.manager.sealed() {
            return Err(Error::Sealed);
        }
        if guard.is_some() {
            return Err(Error::RekeyInProgress);
        }
        let current = self.manager.seal_config()?;

        config.validate(self.manager.seal_backend())?;
        if config.verification_required && config.stored_shares > 0 {
            return Err(Error::InvalidConfig(
                "verification cannot be used with stored shares".into(),
            ));
        }
        if !config.pgp_keys.is_empty() && self.manager.encryptor().is_none() {
            return Err(Error::MissingCapability("pgp share encryption"));
        }

        let quorum = Quorum::for_key(current.secret_threshold, KEY_LENGTH);
        let nonce = quorum.nonce().to_string();
        tracing::info!(
            nonce = %nonce,
            shares = config.secret_shares,
            threshold = config.secret_threshold,
            verification_required = config.verification_required,
            "rekey started"
        );
        *guard = Some(Rekey {
            nonce: nonce.clone(),
            config,
            epoch: self.manager.seal_epoch(),
            phase: Phase::AwaitingQuorum(quorum),
        });
        Ok(nonce)
    }

    /// Submit one of the current key shares.
    ///
    /// When the quorum is reached and verification is not required, the new
    /// root key is committed and the new shares are returned. With
    /// verification, the new shares are returned but nothing changes until
    /// [`verify`](Self::verify) succeeds.
    pub fn submit_key(&self, share: KeyShare, nonce: &str) -> Result<RekeyResult, Error> {
        let mut guard = self.lock();
        let rekey = guard.as_mut().ok_or(Error::NoRekeyInProgress)?;
        if self.manager.sealed() {
            return Err(Error::Sealed);
        }
        rekey.check_nonce(nonce)?;

        let quorum = match &mut rekey.phase {
            Phase::AwaitingQuorum(quorum) => quorum,
            Phase::AwaitingVerification(_) => {
                return Err(Error::InvalidPhase("rekey is awaiting verification"))
            }
        };
        if !quorum.is_complete() && !quorum.add(share)? {
            tracing::debug!(nonce = %rekey.nonce, "ignoring duplicate rekey key");
        }

        let mut result = RekeyResult {
            nonce: rekey.nonce.clone(),
            progress: quorum.progress(),
            required: quorum.required(),
            backup: rekey.config.backup,
            verification_required: rekey.config.verification_required,
            ..Default::default()
        };
        if !quorum.is_complete() {
            return Ok(result);
        }

        let old_root_key = quorum.combine().ok().filter(|key| {
            self.manager.barrier().verify_root(key).is_ok()
        });
        let old_root_key = match old_root_key {
            Some(key) => key,
            None => {
                tracing::warn!(nonce = %rekey.nonce, "rekey failed with incorrect keys");
                quorum.reset_shares();
                return Err(Error::IncorrectUnsealKeys);
            }
        };

        let new_root_key = generate_key();
        let dealt = self.manager.deal_key(&new_root_key, &rekey.config)?;
        (result.keys, result.pgp_fingerprints) = issued_keys(&dealt.issued);

        if rekey.config.verification_required {
            let verification = Quorum::for_key(rekey.config.secret_threshold, KEY_LENGTH);
            tracing::info!(
                nonce = %rekey.nonce,
                verification_nonce = verification.nonce(),
                "rekey awaiting verification of the new shares"
            );
            result.verification_nonce = Some(verification.nonce().to_string());
            rekey.phase = Phase::AwaitingVerification(Box::new(AwaitingVerification {
                old_root_key,
                new_root_key,
                dealt,
                verification,
            }));
            return Ok(result);
        }

        self.commit(&rekey.nonce, &rekey.config, &old_root_key, &new_root_key, &dealt)?;
        *guard = None;
        result.complete = true;
        Ok(result)
    }

    /// Submit one of the new key shares. Once a quorum of them reconstructs
    /// the new root key, the rekey is committed.
    pub fn verify(&self, share: KeyShare, nonce: &str) -> Result<VerifyResult, Error> {
        let mut guard = self.lock();
        let rekey = guard.as_mut().ok_or(Error::NoRekeyInProgress)?;
        if self.manager.sealed() {
            return Err(Error::Sealed);
        }
        let pending = match &mut rekey.phase {
            Phase::AwaitingVerification(pending) => pending,
            Phase::AwaitingQuorum(_) => {
                return Err(Error::InvalidPhase("rekey is not awaiting verification"))
            }
        };
        pending.verification.check_nonce(Some(nonce))?;
        if !pending.verification.is_complete() && !pending.verification.add(share)? {
            tracing::debug!(nonce, "ignoring duplicate verification key");
        }

        let mut result = VerifyResult {
            nonce: pending.verification.nonce().to_string(),
            complete: false,
            progress: pending.verification.progress(),
            required: pending.verification.required(),
        };
        if !pending.verification.is_complete() {
            return Ok(result);
        }

        let matches = match pending.verification.combine() {
            Ok(key) => bool::from(key.as_slice().ct_eq(pending.new_root_key.as_slice())),
            Err(_) => false,
        };
        if !matches {
            tracing::warn!(nonce, "rekey verification failed");
            pending.verification.reset_shares();
            return Err(Error::VerificationFailed);
        }

        self.commit(
            &rekey.nonce,
            &rekey.config,
            &pending.old_root_key,
            &pending.new_root_key,
            &pending.dealt,
        )?;
        *guard = None;
        result.complete = true;
        Ok(result)
    }

    /// Throw away the verification progress and start it again with a new
    /// nonce, which is returned.
    pub fn restart_verification(&self) -> Result<String, Error> {
        let mut guard = self.lock();
        let rekey = guard.as_mut().ok_or(Error::NoRekeyInProgress)?;
        match &mut rekey.phase {
            Phase::AwaitingVerification(pending) => {
                pending.verification = Quorum::for_key(rekey.config.secret_threshold, KEY_LENGTH);
                Ok(pending.verification.nonce().to_string())
            }
            Phase::AwaitingQuorum(_) => Err(Error::InvalidPhase("rekey is not awaiting verification")),
        }
    }

    /// Abandon the rekey in progress. The current root key stays in use.
    pub fn cancel(&self) -> Result<(), Error> {
        match self.lock().take() {
            Some(rekey) => {
                tracing::info!(nonce = %rekey.nonce, "rekey cancelled");
                Ok(())
            }
            None => Err(Error::NoRekeyInProgress),
        }
    }

    pub fn status(&self) -> RekeyStatus {
        let guard = self.lock();
        let rekey = match guard.as_ref() {
            Some(rekey) => rekey,
            None => return RekeyStatus::default(),
        };
        let (quorum, verification) = match &rekey.phase {
            Phase::AwaitingQuorum(quorum) => (Some(quorum), None),
            Phase::AwaitingVerification(pending) => (None, Some(&pending.verification)),
        };
        let required = match quorum {
            Some(quorum) => quorum.required(),
            None => self.manager.seal_config().map_or(0, |c| c.secret_threshold),
        };
        RekeyStatus {
            started: true,
            nonce: rekey.nonce.clone(),
            progress: quorum.map_or(required, Quorum::progress),
            required,
            config: Some(rekey.config.clone()),
            verification_nonce: verification.map(|v| v.nonce().to_string()),
            verification_progress: verification.map_or(0, Quorum::progress),
        }
    }

    /// The encrypted shares saved by the last rekey with `backup` set.
    pub fn retrieve_backup(&self) -> Result<Option<ShareBackup>, Error> {
        self.manager
            .barrier()
            .get(REKEY_BACKUP_PATH)?
            .map(|raw| serde_json::from_slice(&raw).map_err(Error::serde("share backup")))
            .transpose()
    }

    pub fn delete_backup(&self) -> Result<(), Error> {
        Ok(self.manager.barrier().delete_internal(REKEY_BACKUP_PATH)?)
    }

    /// Switch everything over to the new root key. If any step fails, the
    /// steps already taken are undone and the old root key stays in use.
    fn commit(
        &self,
        nonce: &str,
        config: &SealConfig,
        old_root_key: &[u8],
        new_root_key: &[u8],
        dealt: &DealtKey,
    ) -> Result<(), Error> {
        let storage = self.manager.storage();
        let barrier = self.manager.barrier();

        let snapshot = [SEAL_CONFIG_PATH, WRAPPED_ROOT_KEY_PATH, STORED_SHARES_PATH]
            .into_iter()
            .map(|path| -> Result<_, Error> { Ok((path, storage.get(path)?)) })
            .collect::<Result<Vec<_>, _>>()?;
        let old_backup = barrier.get(REKEY_BACKUP_PATH)?;

        storage.put(REKEY_MARKER_PATH, nonce.as_bytes())?;
        let mut touched = Touched::default();
        let mut apply = || -> Result<(), Error> {
            if config.backup {
                let (keys, fingerprints) = issued_keys(&dealt.issued);
                let backup = ShareBackup {
                    nonce: nonce.to_string(),
                    keys: fingerprints.into_iter().zip(keys).collect(),
                };
                let raw = serde_json::to_vec(&backup).map_err(Error::serde("share backup"))?;
                Touched::note(
                    &mut touched.backup,
                    barrier.put_internal(REKEY_BACKUP_PATH, &raw),
                )?;
            }
            Touched::note(&mut touched.barrier, barrier.rekey(new_root_key))?;
            self.manager.store_dealt_key(dealt)?;
            self.manager.persist_config(config)
        };

        if let Err(err) = apply() {
            tracing::warn!(nonce, error = %err, "rekey failed, restoring the old root key");
            if self.roll_back(touched, old_root_key, &snapshot, old_backup) {
                self.remove_marker();
            }
            return Err(err);
        }
        self.remove_marker();
        tracing::info!(
            nonce,
            shares = config.secret_shares,
            threshold = config.secret_threshold,
            "rekey complete"
        );
        Ok(())
    }

    /// Undo the steps in `touched`. Returns whether everything was restored.
    fn roll_back(
        &self,
        touched: Touched,
        old_root_key: &[u8],
        snapshot: &[(&str, Option<Vec<u8>>)],
        old_backup: Option<Vec<u8>>,
    ) -> bool {
        let storage = self.manager.storage();
        let barrier = self.manager.barrier();
        let mut restored = true;

        // The seal state is only written after the barrier has been rekeyed.
        if touched.barrier {
            if let Err(err) = barrier.rekey(old_root_key) {
                tracing::error!(error = %err, "failed to restore the old root key");
                restored = false;
            }
            for (path, value) in snapshot {
                let undo = match value {
                    Some(value) => storage.put(path, value),
                    None => storage.delete(path),
                };
                if let Err(err) = undo {
                    tracing::error!(path, error = %err, "failed to restore seal state");
                    restored = false;
                }
            }
        }
        if touched.backup {
            let undo = match old_backup {
                Some(value) => barrier.put_internal(REKEY_BACKUP_PATH, &value),
                None => barrier.delete_internal(REKEY_BACKUP_PATH),
            };
            if let Err(err) = undo {
                tracing::error!(error = %err, "failed to restore share backup");
                restored = false;
            }
        }
        restored
    }

    fn remove_marker(&self) {
        if let Err(err) = self.manager.storage().delete(REKEY_MARKER_PATH) {
            tracing::warn!(error = %err, "failed to remove rekey marker");
        }
    }
}

/// Which parts of a commit may have changed storage.
#[derive(Clone, Copy, Debug, Default)]
struct Touched {
    backup: bool,
    barrier: bool,
}

impl Touched {
    /// Record a barrier write in `flag` unless the barrier refused it for
    /// being sealed, which happens before storage is touched.
    fn note<T>(flag: &mut bool, result: Result<T, barrier::Error>) -> Result<T, Error> {
        if !matches!(result, Err(barrier::Error::Sealed)) {
            *flag = true;
        }
        Ok(result?)
    }
}
