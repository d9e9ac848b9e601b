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

use crate::{seal::SealBackend, shamir::MAX_SHARES, Error};

use serde::{Deserialize, Serialize};

/// Parameters of the key share ceremony.
///
/// Once persisted, the configuration only changes through a rekey.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    /// Seal backend the configuration was written for (filled in when
    /// persisted).
    #[serde(rename = "type", default)]
    pub seal_type: String,

    /// Total number of shares to generate.
    pub secret_shares: usize,

    /// Number of shares required to reconstruct the root key.
    pub secret_threshold: usize,

    /// Shares kept by the server (wrapped by the seal) instead of being
    /// handed to operators.
    #[serde(default)]
    pub stored_shares: usize,

    /// Armored public keys to encrypt each returned share with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pgp_keys: Vec<String>,

    /// Keep a copy of the PGP-encrypted shares inside the barrier.
    #[serde(default)]
    pub backup: bool,

    /// Require a second quorum of the new shares before a rekey commits.
    #[serde(default)]
    pub verification_required: bool,
}

impl SealConfig {
    pub fn new(secret_shares: usize, secret_threshold: usize) -> Self {
        Self {
            secret_shares,
            secret_threshold,
            ..Default::default()
        }
    }

    /// Number of shares handed to operators.
    pub fn returned_shares(&self) -> usize {
        self.secret_shares.saturating_sub(self.stored_shares)
    }

    pub fn validate(&self, seal: &dyn SealBackend) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.secret_shares < 1 || self.secret_shares > MAX_SHARES {
            return invalid(format!("shares must be between 1 and {}", MAX_SHARES));
        }
        if self.secret_threshold < 1 || self.secret_threshold > self.secret_shares {
            return invalid("threshold must be between 1 and the number of shares".into());
        }
        if self.secret_shares > 1 && self.secret_threshold < 2 {
            return invalid("threshold must be at least 2 when there is more than one share".into());
        }
        if !self.pgp_keys.is_empty() && self.pgp_keys.len() != self.secret_shares {
            return invalid(format!(
                "{} pgp keys given for {} shares",
                self.pgp_keys.len(),
                self.secret_shares
            ));
        }
        if self.backup && self.pgp_keys.is_empty() {
            return invalid("backup requires pgp keys".into());
        }
        if self.stored_shares > 0 {
            if !seal.stored_shares_supported() {
                return invalid(format!(
                    "seal type {:?} does not support stored shares",
                    seal.seal_type()
                ));
            }
            if self.stored_shares > self.secret_shares {
                return invalid("stored shares cannot exceed the number of shares".into());
            }
            if self.stored_shares < self.secret_threshold {
                return invalid("stored shares must be enough to reach the threshold".into());
            }
            if !self.pgp_keys.is_empty() {
                return invalid("pgp keys cannot be combined with stored shares".into());
            }
        }
        Ok(())
    }
}
