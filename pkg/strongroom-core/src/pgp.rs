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

//! Encrypting key shares to operators' PGP keys.
//!
//! No OpenPGP implementation is bundled. Callers plug one in through
//! [`ShareEncryptor`]; requesting PGP keys without one fails instead of
//! returning plaintext shares.

use crate::{shamir::KeyShare, Error};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PgpError(pub String);

/// Encrypts data to a PGP public key.
pub trait ShareEncryptor: Send + Sync {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, PgpError>;

    fn fingerprint(&self, public_key: &str) -> Result<String, PgpError>;
}

/// A key share as handed to an operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuedShare {
    Plain(KeyShare),
    Pgp {
        fingerprint: String,
        ciphertext: Vec<u8>,
    },
}

impl IssuedShare {
    /// Printable form: hex for plain shares, base64 for encrypted ones.
    pub fn encoded(&self) -> String {
        match self {
            Self::Plain(share) => share.to_hex(),
            Self::Pgp { ciphertext, .. } => BASE64.encode(ciphertext),
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Plain(_) => None,
            Self::Pgp { fingerprint, .. } => Some(fingerprint),
        }
    }
}

/// The encrypted shares from a rekey, as kept in the backup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareBackup {
    pub nonce: String,
    /// Base64 ciphertexts, keyed by fingerprint in share order.
    pub keys: Vec<(String, String)>,
}

/// Encrypt each share to the matching entry in `pgp_keys`. With no keys
/// the shares are returned in plain form.
///
/// Either every share is encrypted or the whole operation fails.
pub(crate) fn issue(
    encryptor: Option<&dyn ShareEncryptor>,
    pgp_keys: &[String],
    shares: Vec<KeyShare>,
) -> Result<Vec<IssuedShare>, Error> {
    if pgp_keys.is_empty() {
        return Ok(shares.into_iter().map(IssuedShare::Plain).collect());
    }
    let encryptor = encryptor.ok_or(Error::MissingCapability("pgp share encryption"))?;
    if pgp_keys.len() != shares.len() {
        return Err(Error::InvalidConfig(format!(
            "{} pgp keys given for {} shares",
            pgp_keys.len(),
            shares.len()
        )));
    }
    pgp_keys
        .iter()
        .zip(shares.iter())
        .map(|(key, share)| -> Result<IssuedShare, Error> {
            // Operators get the hex encoding, same as for plain shares.
            let ciphertext = encryptor.encrypt(key, share.to_hex().as_bytes())?;
            Ok(IssuedShare::Pgp {
                fingerprint: encryptor.fingerprint(key)?,
                ciphertext,
            })
        })
        .collect()
}
