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

//! The barrier is the encryption layer between callers and physical storage.
//!
//! Every value is encrypted with the active barrier key before it reaches
//! storage. Barrier keys live in a [keyring](keyring::Keyring) which is itself
//! encrypted directly with the root key and stored at [`KEYRING_PATH`].
//! Reading older values after a rotation works because each entry records the
//! term of the key it was written with.

mod keyring;
mod wire;

pub use keyring::KeyInfo;

use crate::storage::{self, Storage};
use keyring::Keyring;
use wire::{Entry, FromWire, ToWire, ROOT_TERM};

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

/// Length of the root key and of every barrier key.
pub const KEY_LENGTH: usize = 32;

/// The active keyring, wrapped under the root key.
pub const KEYRING_PATH: &str = "core/keyring";

/// Where a re-wrapped keyring is staged during [`Barrier::rekey`].
pub const KEYRING_PENDING_PATH: &str = "core/keyring-pending";

/// Paths under this prefix can only be written by the crate itself.
pub const RESERVED_PREFIX: &str = "core/";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("barrier is sealed")]
    Sealed,

    #[error("barrier is already initialized")]
    AlreadyInitialized,

    #[error("barrier is not initialized")]
    NotInitialized,

    #[error("root key is invalid")]
    InvalidRootKey,

    #[error("keys must be {0} bytes long")]
    InvalidKeyLength(usize),

    #[error("no barrier key for term {0}")]
    UnknownTerm(u32),

    #[error("failed to decrypt entry at {path:?}")]
    Decrypt { path: String },

    #[error("failed to encrypt entry for {path:?}")]
    Encrypt { path: String },

    #[error("malformed entry at {path:?}: {reason}")]
    MalformedEntry { path: String, reason: String },

    #[error("path {0:?} is reserved for internal use")]
    ReservedPath(String),

    #[error("keyring encoding: {0}")]
    Keyring(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(#[from] storage::Error),
}

/// Generate a random key suitable for use as a root or barrier key.
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; KEY_LENGTH]);
    OsRng.fill_bytes(&mut key);
    key
}

/// Transparent authenticated encryption on top of a [`Storage`].
///
/// `get`/`put`/`delete`/`list` take a shared lock on the keyring and may run
/// concurrently. `unseal`, `seal`, `rotate` and `rekey` take the lock
/// exclusively for their whole duration.
pub struct Barrier {
    storage: Arc<dyn Storage>,
    keyring: RwLock<Option<Keyring>>,
}

impl Barrier {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            keyring: RwLock::new(None),
        }
    }

    fn read_keyring(&self) -> RwLockReadGuard<'_, Option<Keyring>> {
        self.keyring.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_keyring(&self) -> RwLockWriteGuard<'_, Option<Keyring>> {
        self.keyring.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_entry(&self, path: &str) -> Result<Option<Entry>, Error> {
        self.storage
            .get(path)?
            .map(|raw| {
                Entry::from_wire(raw).map_err(|reason| Error::MalformedEntry {
                    path: path.to_string(),
                    reason,
                })
            })
            .transpose()
    }

    /// Decrypt a wrapped keyring. Any failure to authenticate is reported as
    /// an invalid root key.
    fn open_keyring(entry: &Entry, root_key: &[u8]) -> Result<Keyring, Error> {
        if entry.term != ROOT_TERM {
            return Err(Error::MalformedEntry {
                path: KEYRING_PATH.to_string(),
                reason: format!("keyring wrapped with term {}", entry.term),
            });
        }
        let plaintext = entry
            .open(root_key, KEYRING_PATH)
            .map_err(|_| Error::InvalidRootKey)?;
        let keyring = Keyring::deserialize(&plaintext)?;
        match keyring.root_key_matches(root_key) {
            true => Ok(keyring),
            false => Err(Error::InvalidRootKey),
        }
    }

    /// Write `keyring` wrapped under `root_key` to `path`, then read it back
    /// to make sure it can be unwrapped again.
    fn store_keyring(&self, path: &str, keyring: &Keyring, root_key: &[u8]) -> Result<(), Error> {
        let plaintext = keyring.serialize()?;
        let entry = Entry::seal(root_key, ROOT_TERM, KEYRING_PATH, &plaintext).map_err(|_| {
            Error::Encrypt {
                path: path.to_string(),
            }
        })?;
        self.storage.put(path, &entry.to_wire())?;

        let stored = self.load_entry(path)?.ok_or(Error::NotInitialized)?;
        Self::open_keyring(&stored, root_key).map(|_| ())
    }

    /// Whether a keyring has been written to storage.
    pub fn initialized(&self) -> Result<bool, Error> {
        Ok(self.storage.get(KEYRING_PATH)?.is_some()
            || self.storage.get(KEYRING_PENDING_PATH)?.is_some())
    }

    /// Create a new keyring protected by `root_key`. The barrier stays sealed.
    pub fn initialize(&self, root_key: &[u8]) -> Result<(), Error> {
        keyring::check_key_length(root_key)?;
        // Concurrent callers must not both see an empty barrier.
        let _guard = self.write_keyring();
        if self.initialized()? {
            return Err(Error::AlreadyInitialized);
        }
        let keyring = Keyring::new(root_key)?;
        self.store_keyring(KEYRING_PATH, &keyring, root_key)?;
        tracing::info!("barrier initialized");
        Ok(())
    }

    /// Load the keyring using `root_key`. Unsealing an unsealed barrier is a
    /// no-op.
    ///
    /// If a previous [`rekey`](Self::rekey) was interrupted, the staged
    /// keyring is used (and promoted) when the primary one does not accept
    /// `root_key`. A leftover staged keyring is removed once the primary one
    /// unseals.
    pub fn unseal(&self, root_key: &[u8]) -> Result<(), Error> {
        let mut guard = self.write_keyring();
        if guard.is_some() {
            return Ok(());
        }

        let primary = self.load_entry(KEYRING_PATH)?;
        let pending = self.load_entry(KEYRING_PENDING_PATH)?;

        let keyring = match (primary, pending) {
            (None, None) => return Err(Error::NotInitialized),
            (Some(primary), pending) => match Self::open_keyring(&primary, root_key) {
                Ok(keyring) => {
                    if pending.is_some() {
                        tracing::warn!("removing stale pending keyring");
                        self.storage.delete(KEYRING_PENDING_PATH)?;
                    }
                    keyring
                }
                Err(Error::InvalidRootKey) => match pending {
                    Some(pending) => self.promote_pending(&pending, root_key)?,
                    None => return Err(Error::InvalidRootKey),
                },
                Err(err) => return Err(err),
            },
            (None, Some(pending)) => self.promote_pending(&pending, root_key)?,
        };

        tracing::info!(term = keyring.active_term(), "barrier unsealed");
        *guard = Some(keyring);
        Ok(())
    }

    fn promote_pending(&self, pending: &Entry, root_key: &[u8]) -> Result<Keyring, Error> {
        let keyring = Self::open_keyring(pending, root_key)?;
        tracing::warn!("promoting pending keyring left by an interrupted rekey");
        self.storage.put(KEYRING_PATH, &pending.to_wire())?;
        self.storage.delete(KEYRING_PENDING_PATH)?;
        Ok(keyring)
    }

    /// Drop the in-memory keyring. The key material is wiped.
    pub fn seal(&self) {
        if self.write_keyring().take().is_some() {
            tracing::info!("barrier sealed");
        }
    }

    pub fn sealed(&self) -> bool {
        self.read_keyring().is_none()
    }

    /// Check that `candidate` is the current root key, without changing any
    /// state. The barrier must be unsealed.
    pub fn verify_root(&self, candidate: &[u8]) -> Result<(), Error> {
        let guard = self.read_keyring();
        let keyring = guard.as_ref().ok_or(Error::Sealed)?;
        match keyring.root_key_matches(candidate) {
            true => Ok(()),
            false => Err(Error::InvalidRootKey),
        }
    }

    pub fn active_term(&self) -> Result<u32, Error> {
        let guard = self.read_keyring();
        Ok(guard.as_ref().ok_or(Error::Sealed)?.active_term())
    }

    /// Terms and install times of every barrier key.
    pub fn key_info(&self) -> Result<Vec<KeyInfo>, Error> {
        let guard = self.read_keyring();
        Ok(guard.as_ref().ok_or(Error::Sealed)?.key_info())
    }

    /// Install a new barrier key and make it active for new writes. Returns
    /// the new term.
    pub fn rotate(&self) -> Result<u32, Error> {
        let mut guard = self.write_keyring();
        let keyring = guard.as_ref().ok_or(Error::Sealed)?;

        let rotated = keyring.rotate(&generate_key())?;
        self.store_keyring(KEYRING_PATH, &rotated, rotated.root_key())?;

        let term = rotated.active_term();
        *guard = Some(rotated);
        tracing::info!(term, "barrier key rotated");
        Ok(term)
    }

    /// Re-wrap the keyring under `new_root_key`. Stored values are not
    /// re-encrypted.
    ///
    /// The new wrapping is staged at [`KEYRING_PENDING_PATH`] and verified
    /// before the primary copy is replaced, so at every point there is at
    /// least one keyring in storage that some root key can open.
    pub fn rekey(&self, new_root_key: &[u8]) -> Result<(), Error> {
        keyring::check_key_length(new_root_key)?;
        let mut guard = self.write_keyring();
        let keyring = guard.as_ref().ok_or(Error::Sealed)?;

        let rekeyed = keyring.with_root_key(new_root_key)?;
        self.store_keyring(KEYRING_PENDING_PATH, &rekeyed, new_root_key)?;
        self.store_keyring(KEYRING_PATH, &rekeyed, new_root_key)?;
        *guard = Some(rekeyed);

        // The staged copy is identical to the primary one now, so failing to
        // remove it only leaves work for the next unseal.
        if let Err(err) = self.storage.delete(KEYRING_PENDING_PATH) {
            tracing::warn!(error = %err, "failed to remove pending keyring");
        }
        tracing::info!("barrier rekeyed");
        Ok(())
    }

    fn check_path(path: &str) -> Result<(), Error> {
        match path.starts_with(RESERVED_PREFIX) {
            true => Err(Error::ReservedPath(path.to_string())),
            false => Ok(()),
        }
    }

    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>, Error> {
        let guard = self.read_keyring();
        let keyring = guard.as_ref().ok_or(Error::Sealed)?;

        let entry = match self.load_entry(path)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let key = keyring.term_key(entry.term)?;
        let mut plaintext = entry
            .open(&key.value, path)
            .map_err(|_| Error::Decrypt {
                path: path.to_string(),
            })?;
        Ok(Some(std::mem::take(&mut *plaintext)))
    }

    pub fn put(&self, path: &str, value: &[u8]) -> Result<(), Error> {
        Self::check_path(path)?;
        self.put_internal(path, value)
    }

    pub fn delete(&self, path: &str) -> Result<(), Error> {
        Self::check_path(path)?;
        self.delete_internal(path)
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let guard = self.read_keyring();
        guard.as_ref().ok_or(Error::Sealed)?;
        Ok(self.storage.list(prefix)?)
    }

    /// [`put`](Self::put) without the reserved path check.
    pub(crate) fn put_internal(&self, path: &str, value: &[u8]) -> Result<(), Error> {
        let guard = self.read_keyring();
        let keyring = guard.as_ref().ok_or(Error::Sealed)?;

        let key = keyring.active_key()?;
        let entry = Entry::seal(&key.value, key.term, path, value).map_err(|_| {
            Error::Encrypt {
                path: path.to_string(),
            }
        })?;
        Ok(self.storage.put(path, &entry.to_wire())?)
    }

    pub(crate) fn delete_internal(&self, path: &str) -> Result<(), Error> {
        let guard = self.read_keyring();
        guard.as_ref().ok_or(Error::Sealed)?;
        Ok(self.storage.delete(path)?)
    }
}
