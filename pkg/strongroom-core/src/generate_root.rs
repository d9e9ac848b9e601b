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

//! Minting a new root credential, authorized by a quorum of key shares.
//!
//! The credential never leaves the server in the clear. In OTP mode it is
//! XORed with a one-time pad handed to the operator at the start, and in PGP
//! mode it is encrypted to a public key supplied by the operator.

use crate::{
    barrier::KEY_LENGTH, manager::SealManager, progress::Quorum, shamir::KeyShare, Error,
};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde::Serialize;
use zeroize::Zeroizing;

const TOKEN_PREFIX: &str = "s.";
const TOKEN_RANDOM_LENGTH: usize = 24;

/// Length of the one-time pad, which is also the length of every minted
/// credential.
pub const OTP_LENGTH: usize = TOKEN_PREFIX.len() + TOKEN_RANDOM_LENGTH;

fn random_alphanumeric(len: usize) -> Zeroizing<String> {
    Zeroizing::new(
        OsRng
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect(),
    )
}

/// Creates the privileged credential handed out at the end of a root
/// generation. Credentials must be [`OTP_LENGTH`] bytes long.
pub trait CredentialMinter: Send + Sync {
    fn mint(&self) -> Result<Zeroizing<String>, Error>;
}

/// Mints random `s.`-prefixed tokens.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomTokenMinter;

impl CredentialMinter for RandomTokenMinter {
    fn mint(&self) -> Result<Zeroizing<String>, Error> {
        let random = random_alphanumeric(TOKEN_RANDOM_LENGTH);
        Ok(Zeroizing::new(format!("{}{}", TOKEN_PREFIX, *random)))
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(lhs.iter().zip(rhs).map(|(a, b)| a ^ b).collect())
}

/// Recover the credential from an OTP-mode encoded token.
pub fn decode_root_token(encoded: &str, otp: &str) -> Result<Zeroizing<String>, Error> {
    let raw = Zeroizing::new(
        BASE64
            .decode(encoded.trim())
            .map_err(|err| Error::InvalidToken(err.to_string()))?,
    );
    if raw.len() != otp.len() {
        return Err(Error::InvalidToken(format!(
            "token is {} bytes but the otp is {}",
            raw.len(),
            otp.len()
        )));
    }
    let token = xor(&raw, otp.as_bytes());
    String::from_utf8(token.to_vec())
        .map(Zeroizing::new)
        .map_err(|_| Error::InvalidToken("decoded token is not valid utf-8".into()))
}

/// How the minted credential is protected on its way to the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootTokenMode {
    /// Generate a one-time pad and return it from
    /// [`init`](GenerateRootCoordinator::init).
    Otp,
    /// Encrypt to this armored PGP public key.
    Pgp(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GenerateRootInit {
    pub nonce: String,
    /// Only in OTP mode. Needed to decode the final token.
    pub otp: Option<String>,
    pub pgp_fingerprint: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GenerateRootResult {
    pub nonce: String,
    pub complete: bool,
    pub progress: usize,
    pub required: usize,
    /// Base64 encoded, either XORed with the OTP or PGP-encrypted.
    pub encoded_token: Option<String>,
    pub pgp_fingerprint: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GenerateRootStatus {
    pub started: bool,
    pub nonce: String,
    pub progress: usize,
    pub required: usize,
    pub complete: bool,
    pub otp_length: usize,
    pub pgp_fingerprint: Option<String>,
    pub encoded_token: Option<String>,
}

enum Protection {
    Otp(Zeroizing<String>),
    Pgp {
        public_key: String,
        fingerprint: String,
    },
}

struct GenerateRoot {
    quorum: Quorum,
    protection: Protection,
    epoch: u64,
    encoded_token: Option<String>,
}

impl GenerateRoot {
    fn pgp_fingerprint(&self) -> Option<String> {
        match &self.protection {
            Protection::Otp(_) => None,
            Protection::Pgp { fingerprint, .. } => Some(fingerprint.clone()),
        }
    }

    fn result(&self) -> GenerateRootResult {
        GenerateRootResult {
            nonce: self.quorum.nonce().to_string(),
            complete: self.encoded_token.is_some(),
            progress: self.quorum.progress(),
            required: self.quorum.required(),
            encoded_token: self.encoded_token.clone(),
            pgp_fingerprint: self.pgp_fingerprint(),
        }
    }
}

pub struct GenerateRootCoordinator {
    manager: Arc<SealManager>,
    minter: Box<dyn CredentialMinter>,
    state: Mutex<Option<GenerateRoot>>,
}

impl GenerateRootCoordinator {
    pub fn new(manager: Arc<SealManager>) -> Self {
        Self::with_minter(manager, Box::new(RandomTokenMinter))
    }

    pub fn with_minter(manager: Arc<SealManager>, minter: Box<dyn CredentialMinter>) -> Self {
        Self {
            manager,
            minter,
            state: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<GenerateRoot>> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let epoch = self.manager.seal_epoch();
        if guard.as_ref().map_or(false, |attempt| attempt.epoch != epoch) {
            tracing::info!("discarding root generation started before the barrier was sealed");
            *guard = None;
        }
        guard
    }

    /// Start a root generation. A finished attempt is replaced, an unfinished
    /// one has to be cancelled first.
    pub fn init(&self, mode: RootTokenMode) -> Result<GenerateRootInit, Error> {
        let mut guard = self.lock();
        if self.manager.sealed() {
            return Err(Error::Sealed);
        }
        if guard.as_ref().map_or(false, |attempt| attempt.encoded_token.is_none()) {
            return Err(Error::GenerateRootInProgress);
        }
        let config = self.manager.seal_config()?;

        let protection = match mode {
            RootTokenMode::Otp => Protection::Otp(random_alphanumeric(OTP_LENGTH)),
            RootTokenMode::Pgp(public_key) => {
                let encryptor = self
                    .manager
                    .encryptor()
                    .ok_or(Error::MissingCapability("pgp share encryption"))?;
                let fingerprint = encryptor.fingerprint(&public_key)?;
                Protection::Pgp {
                    public_key,
                    fingerprint,
                }
            }
        };
        let attempt = GenerateRoot {
            quorum: Quorum::for_key(config.secret_threshold, KEY_LENGTH),
            protection,
            epoch: self.manager.seal_epoch(),
            encoded_token: None,
        };

        let init = GenerateRootInit {
            nonce: attempt.quorum.nonce().to_string(),
            otp: match &attempt.protection {
                Protection::Otp(otp) => Some(otp.to_string()),
                Protection::Pgp { .. } => None,
            },
            pgp_fingerprint: attempt.pgp_fingerprint(),
        };
        tracing::info!(nonce = %init.nonce, pgp = init.pgp_fingerprint.is_some(), "root generation started");
        *guard = Some(attempt);
        Ok(init)
    }

    /// Submit one of the current key shares. Once the quorum is reached the
    /// credential is minted and returned in encoded form.
    pub fn submit_key(&self, share: KeyShare, nonce: &str) -> Result<GenerateRootResult, Error> {
        let mut guard = self.lock();
        let attempt = guard.as_mut().ok_or(Error::NoGenerateRootInProgress)?;
        if self.manager.sealed() {
            return Err(Error::Sealed);
        }
        attempt.quorum.check_nonce(Some(nonce))?;
        if attempt.encoded_token.is_some() {
            return Err(Error::InvalidPhase("root generation is already complete"));
        }

        if !attempt.quorum.add(share)? {
            tracing::debug!(nonce, "ignoring duplicate root generation key");
        }
        if !attempt.quorum.is_complete() {
            return Ok(attempt.result());
        }

        let verified = attempt
            .quorum
            .combine()
            .ok()
            .filter(|key| self.manager.barrier().verify_root(key).is_ok());
        if verified.is_none() {
            tracing::warn!(nonce, "root generation failed with incorrect keys");
            attempt.quorum.reset_shares();
            return Err(Error::IncorrectUnsealKeys);
        }

        let token = self.minter.mint()?;
        let encoded = match &attempt.protection {
            Protection::Otp(otp) => {
                if token.len() != otp.len() {
                    return Err(Error::InvalidToken(format!(
                        "minted credential must be {} bytes long",
                        otp.len()
                    )));
                }
                BASE64.encode(&*xor(token.as_bytes(), otp.as_bytes()))
            }
            Protection::Pgp { public_key, .. } => {
                let encryptor = self
                    .manager
                    .encryptor()
                    .ok_or(Error::MissingCapability("pgp share encryption"))?;
                BASE64.encode(encryptor.encrypt(public_key, token.as_bytes())?)
            }
        };
        attempt.encoded_token = Some(encoded);
        tracing::info!(nonce, "root credential generated");
        Ok(attempt.result())
    }

    pub fn cancel(&self) -> Result<(), Error> {
        match self.lock().take() {
            Some(attempt) => {
                tracing::info!(nonce = attempt.quorum.nonce(), "root generation cancelled");
                Ok(())
            }
            None => Err(Error::NoGenerateRootInProgress),
        }
    }

    pub fn status(&self) -> GenerateRootStatus {
        let guard = self.lock();
        match guard.as_ref() {
            Some(attempt) => GenerateRootStatus {
                started: true,
                nonce: attempt.quorum.nonce().to_string(),
                progress: attempt.quorum.progress(),
                required: attempt.quorum.required(),
                complete: attempt.encoded_token.is_some(),
                otp_length: OTP_LENGTH,
                pgp_fingerprint: attempt.pgp_fingerprint(),
                encoded_token: attempt.encoded_token.clone(),
            },
            None => GenerateRootStatus {
                otp_length: OTP_LENGTH,
                ..Default::default()
            },
        }
    }
}
