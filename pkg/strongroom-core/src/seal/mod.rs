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

//! Seal backends decide how the root key is protected while the barrier is
//! sealed.
//!
//! [`ShamirSeal`] hands the root key to operators as key shares and cannot
//! wrap anything itself. [`KmsSeal`] wraps the root key with a key management
//! service so the barrier can be unsealed without operator input, and
//! [`MultiSeal`] wraps with several of those at once.

mod kms;
mod multi;
mod shamir;

pub use self::shamir::ShamirSeal;
pub use kms::{Kms, KmsSeal, LocalKms};
pub use multi::MultiSeal;

use std::{io, path::PathBuf};

use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("seal type {0:?} cannot wrap keys")]
    Unsupported(String),

    #[error("kms {name:?} failed to encrypt")]
    Encrypt { name: String },

    #[error("kms {name:?} failed to decrypt")]
    Decrypt { name: String },

    #[error("malformed wrapped key: {0}")]
    MalformedBlob(String),

    #[error("kms key must be {0} bytes long")]
    InvalidKeyLength(usize),

    #[error("no seal was able to unwrap the key")]
    NoSealUnwrapped,

    #[error("multi seal needs at least one member that can wrap keys")]
    InvalidMultiSeal,

    #[error("kms key file {path:?}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How the root key is protected while sealed.
pub trait SealBackend: Send + Sync {
    /// Name reported in the seal status.
    fn seal_type(&self) -> String;

    /// Whether this seal can unwrap the root key without operator shares.
    fn auto_unseal(&self) -> bool;

    /// Whether some of the key shares may be kept (wrapped) in storage.
    fn stored_shares_supported(&self) -> bool {
        self.auto_unseal()
    }

    /// Wrap the root key (or a stored key share) for storage.
    fn wrap_root_key(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Reverse [`wrap_root_key`](Self::wrap_root_key).
    fn unwrap_root_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;
}
